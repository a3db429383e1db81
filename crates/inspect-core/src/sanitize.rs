//! Text sanitization for persisted details, suggestions, and summaries.
//!
//! Check output and error messages can contain control characters, huge
//! payloads, or megabytes of tool noise; everything written to a result
//! or run row passes through here first.

/// Maximum length for result detail and suggestion fields.
pub const MAX_DETAIL_CHARS: usize = 2000;

/// Maximum length for run summary text.
pub const MAX_SUMMARY_CHARS: usize = 500;

/// Collapse all whitespace runs to single spaces and trim. Returns `None`
/// when nothing printable remains.
pub fn collapse(text: &str) -> Option<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Truncate to at most `max` characters, on a char boundary.
pub fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    text.chars().take(max).collect()
}

/// Sanitize a result detail or suggestion field.
pub fn detail(text: &str) -> Option<String> {
    collapse(text).map(|t| clip(&t, MAX_DETAIL_CHARS))
}

/// Sanitize a run summary; never empty.
pub fn summary(text: &str) -> String {
    match collapse(text) {
        Some(t) => clip(&t, MAX_SUMMARY_CHARS),
        None => "No additional details.".to_string(),
    }
}
