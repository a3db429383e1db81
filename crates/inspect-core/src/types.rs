//! Core domain types for the inspection service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::check::CheckSpec;

/// Unique identifier for clusters, items, runs, results, and agents.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Inspection run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Paused,
    Cancelled,
    Finished,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "cancelled" => Some(Self::Cancelled),
            "finished" => Some(Self::Finished),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// A terminal run accepts no further result writes or control signals.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Finished | Self::Failed)
    }
}

/// Sub-state of an agent-executed run, tracked alongside [`RunStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Queued,
    Running,
    Finished,
    Failed,
}

impl AgentRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "finished" => Some(Self::Finished),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Who executes a run: the server's own worker pool or a remote agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    #[default]
    Server,
    Agent,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Agent => "agent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "server" => Some(Self::Server),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }
}

/// Verdict of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Warning,
    Failed,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Warning => "warning",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "passed" => Some(Self::Passed),
            "warning" => Some(Self::Warning),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

// --- Core types ---

/// One entry of a run's plan: the immutable snapshot of a selected check,
/// captured at run creation. Execution reads only this, never the live
/// catalog, so later item edits or deletions cannot change a run in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanItem {
    pub item_id: Id,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub check: CheckSpec,
}

/// One execution of a selected set of checks against one cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectionRun {
    pub id: Id,
    pub cluster_id: Id,
    pub operator: Option<String>,
    pub status: RunStatus,
    pub executor: ExecutorKind,
    /// Bound agent when `executor` is [`ExecutorKind::Agent`].
    pub agent_id: Option<Id>,
    /// Agent-side sub-state; always updated together with `status`.
    pub agent_status: Option<AgentRunStatus>,
    pub total_items: u32,
    /// Monotonically advancing checkpoint, clamped to `total_items`.
    pub processed_items: u32,
    pub plan: Vec<PlanItem>,
    pub summary: Option<String>,
    pub report_path: Option<String>,
    /// Fencing token: bumped on every worker (re)submission. Result and
    /// progress writes from a superseded worker affect zero rows.
    pub generation: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl InspectionRun {
    /// Completion percentage in `0..=100`.
    pub fn progress_percent(&self) -> u32 {
        if self.total_items == 0 {
            return 100;
        }
        (self.processed_items.min(self.total_items) * 100) / self.total_items
    }
}

/// Persisted verdict of one check within a run. Append-only; the cached
/// item name survives later catalog deletions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectionResult {
    pub id: Id,
    pub run_id: Id,
    /// Nulled if the catalog item is later deleted.
    pub item_id: Option<Id>,
    pub item_name: String,
    pub status: CheckStatus,
    pub detail: Option<String>,
    pub suggestion: Option<String>,
}

/// Catalog entry describing one named check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectionItem {
    pub id: Id,
    pub name: String,
    pub description: Option<String>,
    #[serde(flatten)]
    pub check: CheckSpec,
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A registered remote worker, authenticated by its bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectionAgent {
    pub id: Id,
    pub name: String,
    pub token: String,
    pub cluster_id: Option<Id>,
    pub description: Option<String>,
    pub is_enabled: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub prometheus_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A registered cluster: credential file plus execution preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub id: Id,
    pub name: String,
    pub kubeconfig_path: String,
    pub prometheus_url: Option<String>,
    /// Context names extracted from the kubeconfig, for display.
    pub contexts: Vec<String>,
    pub execution_mode: ExecutorKind,
    pub default_agent_id: Option<Id>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a check evaluation produced. Evaluator errors are folded into the
/// status; they never escape as errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub status: CheckStatus,
    pub detail: Option<String>,
    pub suggestion: Option<String>,
}

impl CheckOutcome {
    pub fn passed(detail: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Passed,
            detail: Some(detail.into()),
            suggestion: None,
        }
    }

    pub fn warning(detail: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Warning,
            detail: Some(detail.into()),
            suggestion: Some(suggestion.into()),
        }
    }

    pub fn failed(detail: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Failed,
            detail: Some(detail.into()),
            suggestion: Some(suggestion.into()),
        }
    }
}

/// Per-status result counts, used to classify a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub passed: u32,
    pub warning: u32,
    pub failed: u32,
}

impl StatusCounts {
    pub fn tally<'a>(statuses: impl IntoIterator<Item = &'a CheckStatus>) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            counts.add(*status);
        }
        counts
    }

    pub fn add(&mut self, status: CheckStatus) {
        match status {
            CheckStatus::Passed => self.passed += 1,
            CheckStatus::Warning => self.warning += 1,
            CheckStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.passed + self.warning + self.failed
    }

    /// Worst-of classification: any failure fails the run, else any
    /// warning downgrades it, else clean.
    pub fn overall(&self) -> CheckStatus {
        if self.failed > 0 {
            CheckStatus::Failed
        } else if self.warning > 0 {
            CheckStatus::Warning
        } else {
            CheckStatus::Passed
        }
    }

    /// Run summary line, e.g. `Cluster prod -> passed: 3, warning: 1, failed: 0.`
    pub fn summary_line(&self, cluster_name: &str) -> String {
        format!(
            "Cluster {} -> passed: {}, warning: {}, failed: {}.",
            cluster_name, self.passed, self.warning, self.failed
        )
    }
}
