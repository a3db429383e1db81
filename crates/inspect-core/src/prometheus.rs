//! Minimal Prometheus HTTP API client for instant queries.

use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Default request timeout for Prometheus queries.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum PromError {
    #[error("prometheus request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("prometheus returned HTTP {status}: {snippet}")]
    BadStatus { status: u16, snippet: String },
    #[error("prometheus response is not valid JSON")]
    InvalidJson,
    #[error("prometheus query failed: {0}")]
    Query(String),
}

/// One instant-query sample: its label set and scalar value.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

impl Sample {
    /// Best-effort node identity: `instance`, then `node`, then a placeholder.
    pub fn instance(&self) -> &str {
        self.labels
            .get("instance")
            .or_else(|| self.labels.get("node"))
            .map_or("unknown", String::as_str)
    }
}

/// Instant-query client against a Prometheus base URL.
#[derive(Debug, Clone)]
pub struct PromClient {
    base_url: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl PromClient {
    pub fn new(base_url: &str) -> Self {
        Self::with_timeout(base_url, DEFAULT_QUERY_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Execute an instant query, returning the vector of samples.
    pub async fn instant_query(&self, expression: &str) -> Result<Vec<Sample>, PromError> {
        let url = format!("{}/api/v1/query", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("query", expression)])
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(PromError::BadStatus {
                status: status.as_u16(),
                snippet: body.chars().take(200).collect(),
            });
        }

        let payload: Value = serde_json::from_str(&body).map_err(|_| PromError::InvalidJson)?;
        parse_query_payload(&payload)
    }
}

/// Parse the `/api/v1/query` response envelope into samples. Samples whose
/// value cannot be parsed as a float are skipped.
pub fn parse_query_payload(payload: &Value) -> Result<Vec<Sample>, PromError> {
    if payload.get("status").and_then(Value::as_str) != Some("success") {
        let error_type = payload
            .get("errorType")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let error = payload
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or_default();
        return Err(PromError::Query(
            format!("{error_type} {error}").trim().to_string(),
        ));
    }

    let results = payload
        .get("data")
        .and_then(|d| d.get("result"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut samples = Vec::with_capacity(results.len());
    for entry in &results {
        let Some(value) = extract_value(entry) else {
            tracing::debug!(?entry, "skipping sample with unparsable value");
            continue;
        };
        let labels = entry
            .get("metric")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        samples.push(Sample { labels, value });
    }
    Ok(samples)
}

/// Pull the scalar out of a sample's `value` field: `[timestamp, "93.5"]`.
fn extract_value(sample: &Value) -> Option<f64> {
    let value = sample.get("value")?;
    match value {
        Value::Array(parts) if parts.len() >= 2 => match &parts[1] {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        },
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_vector_payload() {
        let payload = json!({
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {"instance": "node-a"}, "value": [1_700_000_000.0, "93.5"]},
                    {"metric": {"node": "node-b"}, "value": [1_700_000_000.0, "12"]}
                ]
            }
        });
        let samples = parse_query_payload(&payload).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].instance(), "node-a");
        assert!((samples[0].value - 93.5).abs() < f64::EPSILON);
        assert_eq!(samples[1].instance(), "node-b");
    }

    #[test]
    fn skips_unparsable_values() {
        let payload = json!({
            "status": "success",
            "data": {
                "result": [
                    {"metric": {}, "value": [0.0, "NaN-ish"]},
                    {"metric": {}, "value": [0.0, "1.5"]}
                ]
            }
        });
        let samples = parse_query_payload(&payload).unwrap();
        assert_eq!(samples.len(), 1);
    }

    #[test]
    fn error_envelope_becomes_query_error() {
        let payload = json!({
            "status": "error",
            "errorType": "bad_data",
            "error": "parse error"
        });
        let err = parse_query_payload(&payload).unwrap_err();
        match err {
            PromError::Query(msg) => assert!(msg.contains("parse error")),
            other => panic!("expected Query error, got {other:?}"),
        }
    }

    #[test]
    fn missing_instance_label_falls_back() {
        let sample = Sample {
            labels: BTreeMap::new(),
            value: 1.0,
        };
        assert_eq!(sample.instance(), "unknown");
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let client = PromClient::new("http://prom:9090/");
        assert_eq!(client.base_url(), "http://prom:9090");
    }
}
