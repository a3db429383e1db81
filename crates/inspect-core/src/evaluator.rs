//! Check dispatch and evaluation.
//!
//! [`evaluate`] turns a check definition plus a cluster-scoped context into
//! a pass/warn/fail verdict. Underlying failures — tool missing, non-zero
//! exit, timeout, malformed output, unset metrics backend — are folded into
//! the verdict and never propagate as errors, so every call is independently
//! retryable and side-effect-free beyond the command or query it issues.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tokio::time::timeout;

use crate::check::{CheckSpec, CommandCheck, CommandLine, PromqlCheck, KUBECONFIG_PLACEHOLDER};
use crate::prometheus::{PromClient, Sample};
use crate::sanitize;
use crate::types::{CheckOutcome, CheckStatus};

/// Timeout for kubectl invocations issued by built-in checks.
pub const KUBECTL_TIMEOUT: Duration = Duration::from_secs(15);

/// Detail reported for a passing command check that produced no output.
pub const DEFAULT_SUCCESS_DETAIL: &str = "Command completed successfully.";

/// How many problem pods to list before cutting off.
const PODS_LISTED: usize = 8;

/// How many nodes the hotspot checks report.
const TOP_NODES: usize = 5;

/// Cluster-scoped capabilities injected into every evaluation: the
/// credential file for command execution and an optional metrics backend.
#[derive(Debug, Clone, Default)]
pub struct CheckContext {
    pub kubeconfig_path: Option<PathBuf>,
    pub prom: Option<PromClient>,
}

/// Evaluate one check against a cluster.
pub async fn evaluate(spec: &CheckSpec, ctx: &CheckContext) -> CheckOutcome {
    match spec {
        CheckSpec::ClusterVersion => check_cluster_version(ctx).await,
        CheckSpec::NodesStatus => check_nodes_status(ctx).await,
        CheckSpec::PodsStatus => check_pods_status(ctx).await,
        CheckSpec::EventsRecent => check_events_recent(ctx).await,
        CheckSpec::ClusterCpuUsage => check_cluster_cpu_usage(ctx).await,
        CheckSpec::ClusterMemoryUsage => check_cluster_memory_usage(ctx).await,
        CheckSpec::NodeCpuHotspots => check_node_cpu_hotspots(ctx).await,
        CheckSpec::NodeMemoryPressure => check_node_memory_pressure(ctx).await,
        CheckSpec::ClusterDiskIo => check_cluster_disk_io(ctx).await,
        CheckSpec::Command(cfg) => run_command_check(cfg, ctx).await,
        CheckSpec::Promql(cfg) => run_promql_check(cfg, ctx).await,
    }
}

// --- kubectl plumbing ---

/// Run kubectl with the context's credential file. `Err` carries a
/// human-readable reason and always resolves to a `warning` verdict at the
/// call site.
async fn run_kubectl(args: &[&str], ctx: &CheckContext) -> Result<String, String> {
    let mut cmd = Command::new("kubectl");
    if let Some(path) = &ctx.kubeconfig_path {
        cmd.arg("--kubeconfig").arg(path);
    }
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err("kubectl command not found on the executing host.".to_string());
        }
        Err(e) => return Err(format!("kubectl execution error: {e}")),
    };

    let output = match timeout(KUBECTL_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(format!("kubectl execution error: {e}")),
        Err(_) => {
            return Err(format!(
                "kubectl timed out after {}s.",
                KUBECTL_TIMEOUT.as_secs()
            ));
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.is_empty() {
            return Err("kubectl returned a non-zero exit code.".to_string());
        }
        return Err(stderr);
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn require_prom(ctx: &CheckContext) -> Result<&PromClient, CheckOutcome> {
    ctx.prom.as_ref().ok_or_else(|| {
        CheckOutcome::warning(
            "Prometheus endpoint is not configured for this cluster.",
            "Set the cluster's Prometheus URL to enable this check.",
        )
    })
}

fn format_percent(value: f64) -> String {
    format!("{value:.2}%")
}

// --- built-in kubectl probes ---

async fn check_cluster_version(ctx: &CheckContext) -> CheckOutcome {
    let payload = match run_kubectl(&["version"], ctx).await {
        Ok(payload) => payload,
        Err(reason) => {
            return CheckOutcome::warning(reason, "Verify kubectl connectivity to the cluster.");
        }
    };
    let server_line = payload
        .lines()
        .find(|line| line.to_lowercase().starts_with("server version"));
    match server_line {
        Some(line) => CheckOutcome::passed(line.trim()),
        None => CheckOutcome::warning(
            payload,
            "Could not parse a Server Version line from kubectl output.",
        ),
    }
}

async fn check_nodes_status(ctx: &CheckContext) -> CheckOutcome {
    let payload = match run_kubectl(&["get", "nodes", "-o", "json"], ctx).await {
        Ok(payload) => payload,
        Err(reason) => {
            return CheckOutcome::warning(
                reason,
                "Ensure nodes are reachable and the kubeconfig is valid.",
            );
        }
    };
    let parsed: Value = match serde_json::from_str(&payload) {
        Ok(parsed) => parsed,
        Err(_) => {
            return CheckOutcome::warning(payload, "kubectl output was not valid JSON.");
        }
    };

    let items = parsed
        .get("items")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut not_ready = Vec::new();
    for item in &items {
        let conditions = item
            .pointer("/status/conditions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let ready = conditions
            .iter()
            .find(|cond| cond.get("type").and_then(Value::as_str) == Some("Ready"));
        if let Some(cond) = ready {
            if cond.get("status").and_then(Value::as_str) != Some("True") {
                if let Some(name) = item.pointer("/metadata/name").and_then(Value::as_str) {
                    not_ready.push(name.to_string());
                }
            }
        }
    }

    if not_ready.is_empty() {
        return CheckOutcome::passed(format!("{} nodes ready.", items.len()));
    }
    CheckOutcome::failed(
        format!("Nodes not ready: {}", not_ready.join(", ")),
        "Investigate node conditions via 'kubectl describe node <name>'.",
    )
}

async fn check_pods_status(ctx: &CheckContext) -> CheckOutcome {
    let payload = match run_kubectl(&["get", "pods", "--all-namespaces", "-o", "json"], ctx).await {
        Ok(payload) => payload,
        Err(reason) => {
            return CheckOutcome::warning(reason, "Verify cluster access or the kubeconfig path.");
        }
    };
    let parsed: Value = match serde_json::from_str(&payload) {
        Ok(parsed) => parsed,
        Err(_) => {
            return CheckOutcome::warning(payload, "kubectl output was not valid JSON.");
        }
    };

    let mut failing = Vec::new();
    for item in parsed
        .get("items")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let phase = item.pointer("/status/phase").and_then(Value::as_str);
        if !matches!(phase, Some("Running" | "Succeeded")) {
            let namespace = item
                .pointer("/metadata/namespace")
                .and_then(Value::as_str)
                .unwrap_or("default");
            let name = item
                .pointer("/metadata/name")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            failing.push(format!(
                "{namespace}/{name} ({})",
                phase.unwrap_or("Unknown")
            ));
        }
    }

    if failing.is_empty() {
        return CheckOutcome::passed("All pods running or completed.");
    }
    failing.truncate(PODS_LISTED);
    CheckOutcome::warning(
        format!("Problem pods: {}", failing.join(", ")),
        "Check pod logs or describe the pods for details.",
    )
}

async fn check_events_recent(ctx: &CheckContext) -> CheckOutcome {
    let args = [
        "get",
        "events",
        "--all-namespaces",
        "--sort-by=.metadata.creationTimestamp",
        "-o",
        "wide",
    ];
    match run_kubectl(&args, ctx).await {
        Ok(payload) => CheckOutcome {
            status: CheckStatus::Passed,
            detail: Some(sanitize::clip(&payload, sanitize::MAX_DETAIL_CHARS)),
            suggestion: Some("Use 'kubectl get events' for the full listing.".to_string()),
        },
        Err(reason) => {
            CheckOutcome::warning(reason, "Confirm the cluster permissions allow listing events.")
        }
    }
}

// --- built-in metrics probes ---

/// Aggregate metric with a single scalar answer, e.g. whole-cluster CPU.
async fn prom_single_value(
    prom: &PromClient,
    expression: &str,
    what: &str,
) -> Result<f64, CheckOutcome> {
    let samples = prom.instant_query(expression).await.map_err(|e| {
        CheckOutcome::warning(
            e.to_string(),
            "Confirm Prometheus is reachable and scraping node metrics.",
        )
    })?;
    samples.first().map(|s| s.value).ok_or_else(|| {
        CheckOutcome::warning(
            format!("Prometheus returned no {what} data."),
            format!("Check that {what} metrics are being collected."),
        )
    })
}

/// Per-node topk metric: sorted (node, value) readings, highest first.
async fn prom_node_readings(
    prom: &PromClient,
    expression: &str,
) -> Result<Vec<(String, f64)>, CheckOutcome> {
    let samples = prom.instant_query(expression).await.map_err(|e| {
        CheckOutcome::warning(
            e.to_string(),
            "Confirm Prometheus is reachable and scraping node metrics.",
        )
    })?;
    let mut readings: Vec<(String, f64)> = samples
        .iter()
        .map(|s| (s.instance().to_string(), s.value))
        .collect();
    readings.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    Ok(readings)
}

fn render_readings(readings: &[(String, f64)], render: impl Fn(f64) -> String) -> String {
    readings
        .iter()
        .take(TOP_NODES)
        .map(|(name, value)| format!("{name}: {}", render(*value)))
        .collect::<Vec<_>>()
        .join(", ")
}

async fn check_cluster_cpu_usage(ctx: &CheckContext) -> CheckOutcome {
    let prom = match require_prom(ctx) {
        Ok(prom) => prom,
        Err(outcome) => return outcome,
    };
    let expression = "sum(rate(node_cpu_seconds_total{mode!='idle'}[5m])) \
                      / sum(rate(node_cpu_seconds_total[5m])) * 100";
    let value = match prom_single_value(prom, expression, "CPU").await {
        Ok(value) => value,
        Err(outcome) => return outcome,
    };

    let detail = format!("Cluster CPU usage ~ {}.", format_percent(value));
    if value >= 90.0 {
        CheckOutcome::failed(
            detail,
            "CPU is close to saturation; inspect cluster load and consider scaling out.",
        )
    } else if value >= 75.0 {
        CheckOutcome::warning(
            detail,
            "CPU usage is elevated; watch the hottest workloads or add capacity.",
        )
    } else {
        CheckOutcome::passed(detail)
    }
}

async fn check_cluster_memory_usage(ctx: &CheckContext) -> CheckOutcome {
    let prom = match require_prom(ctx) {
        Ok(prom) => prom,
        Err(outcome) => return outcome,
    };
    let expression = "(sum(node_memory_MemTotal_bytes - node_memory_MemAvailable_bytes) \
                      / sum(node_memory_MemTotal_bytes)) * 100";
    let value = match prom_single_value(prom, expression, "memory").await {
        Ok(value) => value,
        Err(outcome) => return outcome,
    };

    let detail = format!("Cluster memory usage ~ {}.", format_percent(value));
    if value >= 90.0 {
        CheckOutcome::failed(
            detail,
            "Memory usage is critical; scale out or hunt for leaks.",
        )
    } else if value >= 80.0 {
        CheckOutcome::warning(
            detail,
            "Memory usage is elevated; watch key nodes and workloads.",
        )
    } else {
        CheckOutcome::passed(detail)
    }
}

async fn check_node_cpu_hotspots(ctx: &CheckContext) -> CheckOutcome {
    let prom = match require_prom(ctx) {
        Ok(prom) => prom,
        Err(outcome) => return outcome,
    };
    let expression =
        "topk(5, (1 - avg by (instance)(rate(node_cpu_seconds_total{mode='idle'}[5m]))) * 100)";
    let readings = match prom_node_readings(prom, expression).await {
        Ok(readings) => readings,
        Err(outcome) => return outcome,
    };
    if readings.is_empty() {
        return CheckOutcome::passed("All nodes show low CPU usage.");
    }

    let detail = format!(
        "Top node CPU usage: {}",
        render_readings(&readings, format_percent)
    );
    let worst = readings[0].1;
    if worst >= 90.0 {
        CheckOutcome::failed(
            detail,
            "Some nodes run extremely hot; find the hotspot workloads or rebalance scheduling.",
        )
    } else if worst >= 80.0 {
        CheckOutcome::warning(
            detail,
            "Some nodes run hot; consider scheduling changes or more capacity.",
        )
    } else {
        CheckOutcome::passed(detail)
    }
}

async fn check_node_memory_pressure(ctx: &CheckContext) -> CheckOutcome {
    let prom = match require_prom(ctx) {
        Ok(prom) => prom,
        Err(outcome) => return outcome,
    };
    let expression = "topk(5, ((node_memory_MemTotal_bytes - node_memory_MemAvailable_bytes) \
                      / node_memory_MemTotal_bytes) * 100)";
    let readings = match prom_node_readings(prom, expression).await {
        Ok(readings) => readings,
        Err(outcome) => return outcome,
    };
    if readings.is_empty() {
        return CheckOutcome::passed("All nodes show normal memory usage.");
    }

    let detail = format!(
        "Top node memory usage: {}",
        render_readings(&readings, format_percent)
    );
    let worst = readings[0].1;
    if worst >= 95.0 {
        CheckOutcome::failed(
            detail,
            "Node memory is nearly exhausted; hunt for leaks or add capacity.",
        )
    } else if worst >= 85.0 {
        CheckOutcome::warning(
            detail,
            "Some nodes are under memory pressure; watch their key workloads.",
        )
    } else {
        CheckOutcome::passed(detail)
    }
}

async fn check_cluster_disk_io(ctx: &CheckContext) -> CheckOutcome {
    let prom = match require_prom(ctx) {
        Ok(prom) => prom,
        Err(outcome) => return outcome,
    };
    let expression = "topk(5, sum by (instance)(rate(node_disk_io_time_seconds_total[5m])))";
    let readings = match prom_node_readings(prom, expression).await {
        Ok(readings) => readings,
        Err(outcome) => return outcome,
    };
    if readings.is_empty() {
        return CheckOutcome::passed("No significant disk IO detected.");
    }

    let detail = format!(
        "Top node disk IO (s/s): {}",
        render_readings(&readings, |v| format!("{v:.4}s/s"))
    );
    let worst = readings[0].1;
    if worst >= 0.8 {
        CheckOutcome::failed(
            detail,
            "Disk IO time ratio is very high; an IO bottleneck is likely.",
        )
    } else if worst >= 0.4 {
        CheckOutcome::warning(
            detail,
            "Disk IO ratio is elevated; watch the hot nodes and disk health.",
        )
    } else {
        CheckOutcome::passed(detail)
    }
}

// --- command checks ---

async fn run_command_check(cfg: &CommandCheck, ctx: &CheckContext) -> CheckOutcome {
    let kubeconfig = ctx
        .kubeconfig_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let substitute = |s: &str| s.replace(KUBECONFIG_PLACEHOLDER, &kubeconfig);

    let (mut cmd, program) = match &cfg.command {
        CommandLine::Shell(line) => {
            let mut c = Command::new("sh");
            c.arg("-c").arg(substitute(line));
            (c, "sh".to_string())
        }
        CommandLine::Argv(argv) => {
            // Validated non-empty at creation time; guard anyway.
            let Some(program) = argv.first() else {
                return CheckOutcome::failed(
                    "Command is empty.",
                    "Fix the check configuration.",
                );
            };
            let program = substitute(program);
            let mut c = Command::new(&program);
            for arg in &argv[1..] {
                c.arg(substitute(arg));
            }
            (c, program)
        }
    };
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return CheckOutcome {
                status: CheckStatus::Failed,
                detail: Some(format!("Command not found: {program}")),
                suggestion: Some(cfg.suggestion.clone().unwrap_or_else(|| {
                    "Install the required tool on the executing host.".to_string()
                })),
            };
        }
        Err(e) => {
            return CheckOutcome::warning(
                format!("Command execution error: {e}"),
                "Check the executing host's environment.",
            );
        }
    };

    let output = match timeout(cfg.timeout(), child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return CheckOutcome::warning(
                format!("Command execution error: {e}"),
                "Check the executing host's environment.",
            );
        }
        Err(_) => {
            return CheckOutcome {
                status: CheckStatus::Warning,
                detail: Some(format!(
                    "Command timed out after {}s.",
                    cfg.timeout().as_secs()
                )),
                suggestion: Some(cfg.suggestion.clone().unwrap_or_else(|| {
                    "Raise timeout_secs or investigate why the command hangs.".to_string()
                })),
            };
        }
    };

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    let missing: Vec<&String> = cfg
        .expect_substrings
        .iter()
        .filter(|needle| !stdout.contains(needle.as_str()))
        .collect();

    if cfg.is_success_exit(exit_code) && missing.is_empty() {
        let detail = cfg
            .success_message
            .clone()
            .or_else(|| sanitize::detail(&stdout))
            .or_else(|| sanitize::detail(&stderr))
            .unwrap_or_else(|| DEFAULT_SUCCESS_DETAIL.to_string());
        return CheckOutcome {
            status: CheckStatus::Passed,
            detail: Some(detail),
            suggestion: None,
        };
    }

    let reason = if !cfg.is_success_exit(exit_code) {
        format!("exit code {exit_code}")
    } else {
        format!(
            "stdout missing expected text: {}",
            missing
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )
    };
    let output_text = sanitize::detail(&stdout).or_else(|| sanitize::detail(&stderr));
    let detail = cfg.failure_message.clone().unwrap_or_else(|| match output_text {
        Some(text) => format!("Command failed ({reason}): {text}"),
        None => format!("Command failed ({reason})."),
    });
    CheckOutcome {
        status: CheckStatus::Failed,
        detail: Some(sanitize::clip(&detail, sanitize::MAX_DETAIL_CHARS)),
        suggestion: cfg.suggestion.clone(),
    }
}

// --- metrics-threshold checks ---

async fn run_promql_check(cfg: &PromqlCheck, ctx: &CheckContext) -> CheckOutcome {
    let prom = match require_prom(ctx) {
        Ok(prom) => prom,
        Err(outcome) => return outcome,
    };
    match prom.instant_query(&cfg.query).await {
        Ok(samples) => classify_samples(cfg, &samples),
        Err(e) => CheckOutcome::warning(
            format!("PromQL query failed: {e}"),
            "Check Prometheus connectivity and the query expression.",
        ),
    }
}

/// Classify a fetched sample set against the check's thresholds.
///
/// Fail-then-warn precedence on the aggregated value; the detail lists the
/// samples that individually crossed the matched threshold (sorted in the
/// comparison's offending direction), falling back to the top raw samples
/// when no single sample crosses it.
pub fn classify_samples(cfg: &PromqlCheck, samples: &[Sample]) -> CheckOutcome {
    if samples.is_empty() {
        return CheckOutcome {
            status: cfg.empty_status,
            detail: Some("Query returned no samples.".to_string()),
            suggestion: Some("Verify the query expression or widen its time window.".to_string()),
        };
    }

    let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
    let Some(aggregate) = cfg.aggregate.apply(&values) else {
        // Unreachable with a non-empty sample set.
        return CheckOutcome::warning(
            "Could not aggregate the returned samples.",
            "Verify the query expression.",
        );
    };

    if let Some(threshold) = cfg.fail_threshold {
        if cfg.comparison.matches(aggregate, threshold) {
            return threshold_outcome(cfg, CheckStatus::Failed, aggregate, threshold, samples);
        }
    }
    if let Some(threshold) = cfg.warn_threshold {
        if cfg.comparison.matches(aggregate, threshold) {
            return threshold_outcome(cfg, CheckStatus::Warning, aggregate, threshold, samples);
        }
    }

    let detail = format!(
        "aggregate {} = {}; top samples: {}",
        cfg.aggregate.as_str(),
        format_value(cfg, aggregate),
        render_samples(cfg, &top_samples(cfg, samples)),
    );
    CheckOutcome::passed(detail)
}

fn threshold_outcome(
    cfg: &PromqlCheck,
    status: CheckStatus,
    aggregate: f64,
    threshold: f64,
    samples: &[Sample],
) -> CheckOutcome {
    let mut triggering: Vec<&Sample> = samples
        .iter()
        .filter(|s| cfg.comparison.matches(s.value, threshold))
        .collect();
    sort_offenders(cfg, &mut triggering);
    triggering.truncate(cfg.max_rows());
    // A sum/avg aggregate can cross without any single sample doing so.
    let rows = if triggering.is_empty() {
        top_samples(cfg, samples)
    } else {
        triggering
    };

    let detail = format!(
        "aggregate {} = {} {} {}; samples: {}",
        cfg.aggregate.as_str(),
        format_value(cfg, aggregate),
        cfg.comparison.as_str(),
        format_value(cfg, threshold),
        render_samples(cfg, &rows),
    );
    let suggestion = match status {
        CheckStatus::Failed => "Metric crossed the failure threshold; investigate the listed samples.",
        _ => "Metric is approaching the failure threshold; investigate the listed samples.",
    };
    CheckOutcome {
        status,
        detail: Some(detail),
        suggestion: Some(suggestion.to_string()),
    }
}

fn sort_offenders<'a>(cfg: &PromqlCheck, samples: &mut [&'a Sample]) {
    samples.sort_by(|a, b| {
        let ordering = a
            .value
            .partial_cmp(&b.value)
            .unwrap_or(std::cmp::Ordering::Equal);
        if cfg.comparison.high_is_worse() {
            ordering.reverse()
        } else {
            ordering
        }
    });
}

fn top_samples<'a>(cfg: &PromqlCheck, samples: &'a [Sample]) -> Vec<&'a Sample> {
    let mut rows: Vec<&Sample> = samples.iter().collect();
    sort_offenders(cfg, &mut rows);
    rows.truncate(cfg.max_rows());
    rows
}

fn format_value(cfg: &PromqlCheck, value: f64) -> String {
    match &cfg.unit {
        Some(unit) => format!("{value:.2}{unit}"),
        None => format!("{value:.2}"),
    }
}

fn render_samples(cfg: &PromqlCheck, rows: &[&Sample]) -> String {
    rows.iter()
        .map(|s| format!("{}: {}", s.instance(), format_value(cfg, s.value)))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{Aggregate, CompareOp};
    use std::collections::BTreeMap;

    fn command_check(command: CommandLine) -> CommandCheck {
        CommandCheck {
            command,
            timeout_secs: None,
            success_exit_codes: None,
            expect_substrings: Vec::new(),
            success_message: None,
            failure_message: None,
            suggestion: None,
        }
    }

    fn promql_check() -> PromqlCheck {
        PromqlCheck {
            query: "up".to_string(),
            comparison: CompareOp::Ge,
            aggregate: Aggregate::Max,
            fail_threshold: None,
            warn_threshold: None,
            empty_status: CheckStatus::Warning,
            unit: None,
            max_rows: None,
        }
    }

    fn sample(instance: &str, value: f64) -> Sample {
        let mut labels = BTreeMap::new();
        labels.insert("instance".to_string(), instance.to_string());
        Sample { labels, value }
    }

    #[tokio::test]
    async fn command_true_passes_with_default_detail() {
        let cfg = command_check(CommandLine::Argv(vec!["true".to_string()]));
        let ctx = CheckContext::default();
        let outcome = run_command_check(&cfg, &ctx).await;
        assert_eq!(outcome.status, CheckStatus::Passed);
        assert_eq!(outcome.detail.as_deref(), Some(DEFAULT_SUCCESS_DETAIL));
    }

    #[tokio::test]
    async fn command_false_fails_with_exit_code() {
        let cfg = command_check(CommandLine::Argv(vec!["false".to_string()]));
        let outcome = run_command_check(&cfg, &CheckContext::default()).await;
        assert_eq!(outcome.status, CheckStatus::Failed);
        assert!(outcome.detail.unwrap().contains("exit code 1"));
    }

    #[tokio::test]
    async fn command_not_found_fails() {
        let cfg = command_check(CommandLine::Argv(vec![
            "definitely-not-a-real-command-xyz".to_string(),
        ]));
        let outcome = run_command_check(&cfg, &CheckContext::default()).await;
        assert_eq!(outcome.status, CheckStatus::Failed);
        assert!(outcome.detail.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn command_timeout_is_warning() {
        let mut cfg = command_check(CommandLine::Shell("sleep 5".to_string()));
        cfg.timeout_secs = Some(1);
        let outcome = run_command_check(&cfg, &CheckContext::default()).await;
        assert_eq!(outcome.status, CheckStatus::Warning);
        assert!(outcome.detail.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn command_expected_substring_enforced() {
        let mut cfg = command_check(CommandLine::Shell("echo hello world".to_string()));
        cfg.expect_substrings = vec!["hello".to_string()];
        let outcome = run_command_check(&cfg, &CheckContext::default()).await;
        assert_eq!(outcome.status, CheckStatus::Passed);
        assert_eq!(outcome.detail.as_deref(), Some("hello world"));

        cfg.expect_substrings = vec!["absent".to_string()];
        let outcome = run_command_check(&cfg, &CheckContext::default()).await;
        assert_eq!(outcome.status, CheckStatus::Failed);
        assert!(outcome.detail.unwrap().contains("missing expected text"));
    }

    #[tokio::test]
    async fn command_success_message_overrides_output() {
        let mut cfg = command_check(CommandLine::Shell("echo noise".to_string()));
        cfg.success_message = Some("All good.".to_string());
        let outcome = run_command_check(&cfg, &CheckContext::default()).await;
        assert_eq!(outcome.detail.as_deref(), Some("All good."));
    }

    #[tokio::test]
    async fn command_kubeconfig_placeholder_substituted() {
        let mut cfg = command_check(CommandLine::Shell("echo {kubeconfig}".to_string()));
        cfg.expect_substrings = vec!["/etc/kube/prod.yaml".to_string()];
        let ctx = CheckContext {
            kubeconfig_path: Some(PathBuf::from("/etc/kube/prod.yaml")),
            prom: None,
        };
        let outcome = run_command_check(&cfg, &ctx).await;
        assert_eq!(outcome.status, CheckStatus::Passed);
    }

    #[tokio::test]
    async fn command_argv_placeholder_reads_credential_file() {
        use std::io::Write;
        let mut kubeconfig = tempfile::NamedTempFile::new().unwrap();
        writeln!(kubeconfig, "current-context: prod").unwrap();

        let mut cfg = command_check(CommandLine::Argv(vec![
            "cat".to_string(),
            KUBECONFIG_PLACEHOLDER.to_string(),
        ]));
        cfg.expect_substrings = vec!["current-context: prod".to_string()];
        let ctx = CheckContext {
            kubeconfig_path: Some(kubeconfig.path().to_path_buf()),
            prom: None,
        };
        let outcome = run_command_check(&cfg, &ctx).await;
        assert_eq!(outcome.status, CheckStatus::Passed);
    }

    #[tokio::test]
    async fn builtin_check_without_cluster_degrades_to_warning() {
        // Point at a kubeconfig that cannot exist so the probe fails even
        // when kubectl happens to be installed.
        let ctx = CheckContext {
            kubeconfig_path: Some(PathBuf::from("/nonexistent/kubeconfig.yaml")),
            prom: None,
        };
        let outcome = evaluate(&CheckSpec::ClusterVersion, &ctx).await;
        assert_eq!(outcome.status, CheckStatus::Warning);
    }

    #[tokio::test]
    async fn metrics_check_without_prom_is_warning() {
        let outcome = evaluate(&CheckSpec::ClusterCpuUsage, &CheckContext::default()).await;
        assert_eq!(outcome.status, CheckStatus::Warning);
        assert!(outcome.detail.unwrap().contains("not configured"));
    }

    #[test]
    fn classify_fail_threshold_crossed() {
        let mut cfg = promql_check();
        cfg.fail_threshold = Some(90.0);
        let outcome = classify_samples(&cfg, &[sample("node-a", 95.0)]);
        assert_eq!(outcome.status, CheckStatus::Failed);
        let detail = outcome.detail.unwrap();
        assert!(detail.contains(">= 90.00"));
        assert!(detail.contains("node-a: 95.00"));
    }

    #[test]
    fn classify_below_thresholds_passes() {
        let mut cfg = promql_check();
        cfg.fail_threshold = Some(90.0);
        let outcome = classify_samples(&cfg, &[sample("node-a", 50.0)]);
        assert_eq!(outcome.status, CheckStatus::Passed);
        assert!(outcome.detail.unwrap().contains("top samples"));
    }

    #[test]
    fn classify_fail_takes_precedence_over_warn() {
        let mut cfg = promql_check();
        cfg.fail_threshold = Some(90.0);
        cfg.warn_threshold = Some(75.0);
        let outcome = classify_samples(&cfg, &[sample("a", 95.0)]);
        assert_eq!(outcome.status, CheckStatus::Failed);

        let outcome = classify_samples(&cfg, &[sample("a", 80.0)]);
        assert_eq!(outcome.status, CheckStatus::Warning);
    }

    #[test]
    fn classify_empty_uses_configured_status() {
        let cfg = promql_check();
        assert_eq!(classify_samples(&cfg, &[]).status, CheckStatus::Warning);

        let mut cfg = promql_check();
        cfg.empty_status = CheckStatus::Passed;
        assert_eq!(classify_samples(&cfg, &[]).status, CheckStatus::Passed);
    }

    #[test]
    fn classify_orders_offenders_by_direction() {
        let mut cfg = promql_check();
        cfg.fail_threshold = Some(50.0);
        let samples = [sample("low", 60.0), sample("high", 90.0)];
        let detail = classify_samples(&cfg, &samples).detail.unwrap();
        let high_pos = detail.find("high").unwrap();
        let low_pos = detail.find("low").unwrap();
        assert!(high_pos < low_pos, "worst offender listed first: {detail}");

        // With a less-than comparison the lowest value is the offender.
        cfg.comparison = CompareOp::Lt;
        cfg.fail_threshold = Some(100.0);
        let detail = classify_samples(&cfg, &samples).detail.unwrap();
        let high_pos = detail.find("high").unwrap();
        let low_pos = detail.find("low").unwrap();
        assert!(low_pos < high_pos, "lowest value listed first: {detail}");
    }

    #[test]
    fn classify_sum_aggregate_falls_back_to_top_samples() {
        let mut cfg = promql_check();
        cfg.aggregate = Aggregate::Sum;
        cfg.fail_threshold = Some(100.0);
        // Sum crosses 100 but no single sample does.
        let samples = [sample("a", 60.0), sample("b", 55.0)];
        let outcome = classify_samples(&cfg, &samples);
        assert_eq!(outcome.status, CheckStatus::Failed);
        let detail = outcome.detail.unwrap();
        assert!(detail.contains("a: 60.00"));
    }

    #[test]
    fn classify_respects_max_rows() {
        let mut cfg = promql_check();
        cfg.fail_threshold = Some(10.0);
        cfg.max_rows = Some(2);
        let samples = [
            sample("a", 20.0),
            sample("b", 30.0),
            sample("c", 40.0),
            sample("d", 50.0),
        ];
        let detail = classify_samples(&cfg, &samples).detail.unwrap();
        assert!(detail.contains("d: 50.00"));
        assert!(detail.contains("c: 40.00"));
        assert!(!detail.contains("a: 20.00"));
    }

    #[test]
    fn classify_renders_unit_hint() {
        let mut cfg = promql_check();
        cfg.unit = Some("%".to_string());
        cfg.fail_threshold = Some(90.0);
        let detail = classify_samples(&cfg, &[sample("a", 95.0)])
            .detail
            .unwrap();
        assert!(detail.contains("95.00%"));
    }
}
