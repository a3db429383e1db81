//! inspect-agent - remote inspection worker.
//!
//! Polls the server for queued runs bound to this agent, executes their
//! plan snapshots locally with the shared check evaluator, and submits the
//! full result batch back. The server cannot reach the cluster; this
//! process runs next to it and dials out.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod client;
mod config;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use inspect_core::{evaluate, CheckContext, PromClient};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use client::{AgentTask, Client, SubmittedResult};
use config::AgentConfig;

#[derive(Parser)]
#[command(name = "inspect-agent", about = "Remote inspection worker", version)]
struct Cli {
    /// Path to the YAML config file
    #[arg(short, long, env = "INSPECT_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Run a single poll cycle and exit
    #[arg(long)]
    once: bool,
}

struct AgentRunner {
    config: AgentConfig,
    client: Client,
    ctx: CheckContext,
}

impl AgentRunner {
    fn new(config: AgentConfig, client: Client) -> Self {
        let ctx = CheckContext {
            kubeconfig_path: config.kubeconfig_path.clone(),
            prom: config.prometheus_url.as_deref().map(PromClient::new),
        };
        Self {
            config,
            client,
            ctx,
        }
    }

    async fn run_forever(&self, once: bool) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "agent started"
        );
        loop {
            let had_task = self.run_once().await;
            if once {
                break;
            }
            let sleep = if had_task {
                Duration::from_secs(1)
            } else {
                self.config.poll_interval
            };
            tokio::time::sleep(sleep).await;
        }
    }

    /// One poll cycle: heartbeat, pull, claim, execute, submit. Returns
    /// whether any task was processed.
    async fn run_once(&self) -> bool {
        if let Err(e) = self.client.heartbeat().await {
            warn!(error = %e, "heartbeat failed");
        }

        let tasks = match self.client.fetch_tasks(self.config.batch_size).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "failed to pull tasks");
                return false;
            }
        };
        if tasks.is_empty() {
            debug!("no queued tasks");
            return false;
        }

        for task in &tasks {
            if let Err(e) = self.client.claim_run(&task.run_id).await {
                // Another poll cycle, the sweep, or an operator got here
                // first; skip it.
                warn!(run_id = %task.run_id, error = %e, "claim rejected");
                continue;
            }
            let results = self.execute_items(task).await;
            match self.client.submit_results(&task.run_id, &results).await {
                Ok(view) => info!(
                    run_id = %task.run_id,
                    status = view.status.as_str(),
                    results = results.len(),
                    "results submitted"
                ),
                Err(e) => error!(run_id = %task.run_id, error = %e, "failed to submit results"),
            }
        }
        true
    }

    /// Evaluate every plan item in order with the shared evaluator.
    async fn execute_items(&self, task: &AgentTask) -> Vec<SubmittedResult> {
        let mut results = Vec::with_capacity(task.items.len());
        for item in &task.items {
            let outcome = evaluate(&item.check, &self.ctx).await;
            debug!(
                run_id = %task.run_id,
                item = %item.name,
                status = outcome.status.as_str(),
                "check evaluated"
            );
            results.push(SubmittedResult {
                item_id: Some(item.item_id.clone()),
                item_name: Some(item.name.clone()),
                status: outcome.status.as_str().to_string(),
                detail: outcome.detail,
                suggestion: outcome.suggestion,
            });
        }
        results
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match AgentConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config: {e}");
            std::process::exit(1);
        }
    };
    let token = match config.load_token() {
        Ok(token) => token,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    let client = match Client::new(&config.server_base, token, config.request_timeout) {
        Ok(client) => client,
        Err(e) => {
            error!("failed to build HTTP client: {e}");
            std::process::exit(1);
        }
    };

    let runner = AgentRunner::new(config, client);
    runner.run_forever(cli.once).await;
}
