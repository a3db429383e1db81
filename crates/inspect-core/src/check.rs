//! Typed check specifications.
//!
//! The original catalog stored an opaque key/value config interpreted at
//! evaluation time; here each check family carries its own struct and is
//! validated when an item or run is created, so malformed configs fail
//! fast instead of surfacing mid-run.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::types::CheckStatus;

/// Default execution timeout for command checks.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of sample rows listed in a metrics check detail.
pub const DEFAULT_SAMPLE_ROWS: usize = 5;

/// Placeholder substituted with the cluster's credential-file path in
/// command-check argument lists.
pub const KUBECONFIG_PLACEHOLDER: &str = "{kubeconfig}";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CheckConfigError {
    #[error("command must not be empty")]
    EmptyCommand,
    #[error("command timeout must be greater than zero")]
    ZeroTimeout,
    #[error("promql query must not be empty")]
    EmptyQuery,
    #[error("max_rows must be greater than zero")]
    ZeroRows,
}

/// A check definition: one of the fixed built-in probes, a shell command,
/// or a PromQL threshold query. Serialized with the discriminator under
/// `check_type` and the family config under `config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "check_type", content = "config", rename_all = "snake_case")]
pub enum CheckSpec {
    ClusterVersion,
    NodesStatus,
    PodsStatus,
    EventsRecent,
    ClusterCpuUsage,
    ClusterMemoryUsage,
    NodeCpuHotspots,
    NodeMemoryPressure,
    ClusterDiskIo,
    Command(CommandCheck),
    Promql(PromqlCheck),
}

impl CheckSpec {
    pub fn check_type(&self) -> &'static str {
        match self {
            Self::ClusterVersion => "cluster_version",
            Self::NodesStatus => "nodes_status",
            Self::PodsStatus => "pods_status",
            Self::EventsRecent => "events_recent",
            Self::ClusterCpuUsage => "cluster_cpu_usage",
            Self::ClusterMemoryUsage => "cluster_memory_usage",
            Self::NodeCpuHotspots => "node_cpu_hotspots",
            Self::NodeMemoryPressure => "node_memory_pressure",
            Self::ClusterDiskIo => "cluster_disk_io",
            Self::Command(_) => "command",
            Self::Promql(_) => "promql",
        }
    }

    /// Reject configs that could never evaluate meaningfully.
    pub fn validate(&self) -> Result<(), CheckConfigError> {
        match self {
            Self::Command(cfg) => cfg.validate(),
            Self::Promql(cfg) => cfg.validate(),
            _ => Ok(()),
        }
    }
}

/// The command to execute: a shell-interpreted string or an argv list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandLine {
    fn is_empty(&self) -> bool {
        match self {
            Self::Shell(s) => s.trim().is_empty(),
            Self::Argv(argv) => argv.is_empty() || argv[0].trim().is_empty(),
        }
    }
}

/// Configuration for a command check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandCheck {
    pub command: CommandLine,
    /// Execution timeout in seconds; defaults to 30.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Exit codes treated as success; defaults to `{0}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_exit_codes: Option<Vec<i32>>,
    /// Substrings the stdout must contain for the check to pass.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expect_substrings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl CommandCheck {
    pub fn timeout(&self) -> Duration {
        self.timeout_secs
            .map_or(DEFAULT_COMMAND_TIMEOUT, Duration::from_secs)
    }

    pub fn is_success_exit(&self, code: i32) -> bool {
        match &self.success_exit_codes {
            Some(codes) => codes.contains(&code),
            None => code == 0,
        }
    }

    pub fn validate(&self) -> Result<(), CheckConfigError> {
        if self.command.is_empty() {
            return Err(CheckConfigError::EmptyCommand);
        }
        if self.timeout_secs == Some(0) {
            return Err(CheckConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

/// Comparison operator for metrics thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompareOp {
    #[default]
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ge => ">=",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Lt => "<",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }

    pub fn matches(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Ge => value >= threshold,
            Self::Gt => value > threshold,
            Self::Le => value <= threshold,
            Self::Lt => value < threshold,
            Self::Eq => (value - threshold).abs() < f64::EPSILON,
            Self::Ne => (value - threshold).abs() >= f64::EPSILON,
        }
    }

    /// Whether high values are the offenders for this operator. Drives the
    /// sort direction when listing triggering samples.
    pub fn high_is_worse(&self) -> bool {
        !matches!(self, Self::Le | Self::Lt)
    }
}

/// Aggregation applied over the returned sample set before comparing
/// against thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregate {
    #[default]
    Max,
    Min,
    Avg,
    Sum,
}

impl Aggregate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Max => "max",
            Self::Min => "min",
            Self::Avg => "avg",
            Self::Sum => "sum",
        }
    }

    /// Returns `None` for an empty sample set.
    pub fn apply(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let result = match self {
            Self::Max => values.iter().copied().fold(f64::MIN, f64::max),
            Self::Min => values.iter().copied().fold(f64::MAX, f64::min),
            Self::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Self::Sum => values.iter().sum(),
        };
        Some(result)
    }
}

/// Configuration for a metrics-threshold check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromqlCheck {
    pub query: String,
    #[serde(default)]
    pub comparison: CompareOp,
    #[serde(default)]
    pub aggregate: Aggregate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warn_threshold: Option<f64>,
    /// Status reported when the query returns no samples.
    #[serde(default = "default_empty_status")]
    pub empty_status: CheckStatus,
    /// Unit suffix appended to rendered values, e.g. `%`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Cap on the number of sample rows rendered in the detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<usize>,
}

fn default_empty_status() -> CheckStatus {
    CheckStatus::Warning
}

impl PromqlCheck {
    pub fn max_rows(&self) -> usize {
        self.max_rows.unwrap_or(DEFAULT_SAMPLE_ROWS)
    }

    pub fn validate(&self) -> Result<(), CheckConfigError> {
        if self.query.trim().is_empty() {
            return Err(CheckConfigError::EmptyQuery);
        }
        if self.max_rows == Some(0) {
            return Err(CheckConfigError::ZeroRows);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_spec_round_trips_as_bare_tag() {
        let json = serde_json::to_string(&CheckSpec::ClusterVersion).unwrap();
        assert_eq!(json, r#"{"check_type":"cluster_version"}"#);
        let parsed: CheckSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.check_type(), "cluster_version");
    }

    #[test]
    fn command_spec_deserializes_with_config() {
        let json = r#"{
            "check_type": "command",
            "config": {
                "command": ["kubectl", "--kubeconfig", "{kubeconfig}", "get", "ns"],
                "timeout_secs": 10,
                "expect_substrings": ["default"]
            }
        }"#;
        let spec: CheckSpec = serde_json::from_str(json).unwrap();
        let CheckSpec::Command(cfg) = &spec else {
            panic!("expected command spec, got {}", spec.check_type());
        };
        assert_eq!(cfg.timeout(), Duration::from_secs(10));
        assert_eq!(cfg.expect_substrings, vec!["default".to_string()]);
        assert!(cfg.is_success_exit(0));
        assert!(!cfg.is_success_exit(1));
    }

    #[test]
    fn command_shell_string_accepted() {
        let json = r#"{"check_type":"command","config":{"command":"kubectl get ns | wc -l"}}"#;
        let spec: CheckSpec = serde_json::from_str(json).unwrap();
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn command_success_exit_codes_override_default() {
        let cfg = CommandCheck {
            command: CommandLine::Argv(vec!["true".into()]),
            timeout_secs: None,
            success_exit_codes: Some(vec![0, 3]),
            expect_substrings: Vec::new(),
            success_message: None,
            failure_message: None,
            suggestion: None,
        };
        assert!(cfg.is_success_exit(3));
        assert!(!cfg.is_success_exit(1));
    }

    #[test]
    fn empty_command_rejected() {
        let json = r#"{"check_type":"command","config":{"command":"   "}}"#;
        let spec: CheckSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.validate(), Err(CheckConfigError::EmptyCommand));

        let json = r#"{"check_type":"command","config":{"command":[]}}"#;
        let spec: CheckSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.validate(), Err(CheckConfigError::EmptyCommand));
    }

    #[test]
    fn promql_spec_defaults() {
        let json = r#"{"check_type":"promql","config":{"query":"up"}}"#;
        let spec: CheckSpec = serde_json::from_str(json).unwrap();
        let CheckSpec::Promql(cfg) = &spec else {
            panic!("expected promql spec");
        };
        assert_eq!(cfg.comparison, CompareOp::Ge);
        assert_eq!(cfg.aggregate, Aggregate::Max);
        assert_eq!(cfg.empty_status, CheckStatus::Warning);
        assert_eq!(cfg.max_rows(), DEFAULT_SAMPLE_ROWS);
    }

    #[test]
    fn promql_comparison_symbols() {
        let json = r#"{"check_type":"promql","config":{"query":"up","comparison":"<","fail_threshold":1.0}}"#;
        let spec: CheckSpec = serde_json::from_str(json).unwrap();
        let CheckSpec::Promql(cfg) = spec else {
            panic!("expected promql spec");
        };
        assert_eq!(cfg.comparison, CompareOp::Lt);
        assert!(!cfg.comparison.high_is_worse());
    }

    #[test]
    fn empty_query_rejected() {
        let json = r#"{"check_type":"promql","config":{"query":""}}"#;
        let spec: CheckSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.validate(), Err(CheckConfigError::EmptyQuery));
    }

    #[test]
    fn compare_op_matches() {
        assert!(CompareOp::Ge.matches(90.0, 90.0));
        assert!(!CompareOp::Gt.matches(90.0, 90.0));
        assert!(CompareOp::Lt.matches(0.5, 1.0));
        assert!(CompareOp::Ne.matches(2.0, 1.0));
        assert!(CompareOp::Eq.matches(1.0, 1.0));
    }

    #[test]
    fn aggregate_apply() {
        let values = [1.0, 4.0, 2.5];
        assert_eq!(Aggregate::Max.apply(&values), Some(4.0));
        assert_eq!(Aggregate::Min.apply(&values), Some(1.0));
        assert_eq!(Aggregate::Sum.apply(&values), Some(7.5));
        assert_eq!(Aggregate::Avg.apply(&values), Some(2.5));
        assert_eq!(Aggregate::Max.apply(&[]), None);
    }
}
