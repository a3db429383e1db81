//! The run worker: drives one locally-executed run through its plan.
//!
//! Items are evaluated in plan order starting at the persisted
//! `processed_items` checkpoint, so a run interrupted by a process restart
//! resumes where it left off. The run row is re-read before every item;
//! in-memory state is never trusted over it.

use std::path::PathBuf;
use std::sync::Arc;

use inspect_core::{
    evaluate, sanitize, CheckContext, CheckStatus, Id, InspectionResult, PromClient, RunStatus,
    StatusCounts,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::control::ExecutionControl;
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("cluster kubeconfig file missing: {0}")]
    KubeconfigMissing(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Classify a fully-executed run from its result counts.
///
/// A run only finishes when every planned item produced a result; fewer
/// results than planned indicates an item or cluster lookup inconsistency
/// and fails the run rather than passing it partially.
pub fn classify_run(
    counts: &StatusCounts,
    total: u32,
    processed: u32,
    cluster_name: &str,
) -> (RunStatus, String) {
    if processed < total || counts.total() < total {
        return (
            RunStatus::Failed,
            format!("Run produced {processed}/{total} results; inspection items or cluster lookup were inconsistent."),
        );
    }
    let line = counts.summary_line(cluster_name);
    match counts.overall() {
        CheckStatus::Failed => (RunStatus::Failed, line),
        CheckStatus::Warning => (RunStatus::Finished, format!("{line} Completed with warnings.")),
        CheckStatus::Passed => (RunStatus::Finished, line),
    }
}

/// Executes a single run to completion under its [`ExecutionControl`].
pub struct RunWorker {
    storage: Arc<Storage>,
    control: Arc<ExecutionControl>,
}

impl RunWorker {
    pub fn new(storage: Arc<Storage>, control: Arc<ExecutionControl>) -> Self {
        Self { storage, control }
    }

    /// Drive the run. Never panics the pool: every exit path either
    /// persists a terminal status or leaves the run resumable at its
    /// checkpoint.
    pub async fn execute(&self, run_id: &Id, generation: i64) {
        match self.drive(run_id, generation).await {
            Ok(()) => {}
            Err(WorkerError::Storage(StorageError::RunSuperseded(_))) => {
                // A newer worker owns this run; our checkpoint writes were
                // fenced out. Exit without touching the row.
                warn!(run_id = %run_id, "worker superseded, exiting");
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "run aborted");
                let summary = sanitize::summary(&format!("Inspection aborted: {e}"));
                if let Err(finalize_err) = self
                    .storage
                    .finalize_run(run_id, RunStatus::Failed, None, &summary)
                    .await
                {
                    error!(
                        run_id = %run_id,
                        error = %finalize_err,
                        "failed to record terminal run state"
                    );
                }
            }
        }
    }

    async fn drive(&self, run_id: &Id, generation: i64) -> Result<()> {
        let run = self.storage.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }
        if run.status == RunStatus::Queued {
            // Conditional: a cancel or pause racing this start wins, and
            // the per-item status re-read below handles whatever landed.
            self.storage
                .transition_run_status(run_id, &[RunStatus::Queued], RunStatus::Running)
                .await?;
        }

        let cluster = self.storage.get_cluster(&run.cluster_id).await?;
        let kubeconfig = PathBuf::from(&cluster.kubeconfig_path);
        if !kubeconfig.exists() {
            return Err(WorkerError::KubeconfigMissing(cluster.kubeconfig_path));
        }
        let ctx = CheckContext {
            kubeconfig_path: Some(kubeconfig),
            prom: cluster.prometheus_url.as_deref().map(PromClient::new),
        };

        let start = run.processed_items as usize;
        info!(
            run_id = %run_id,
            cluster = %cluster.name,
            total = run.total_items,
            resume_from = start,
            "executing inspection run"
        );

        for (index, item) in run.plan.iter().enumerate().skip(start) {
            // Observe control signals between items; a check in flight is
            // never forcibly killed.
            loop {
                if self.control.is_cancelled() {
                    info!(run_id = %run_id, "cancel observed, stopping");
                    return Ok(());
                }
                let current = self.storage.get_run(run_id).await?;
                match current.status {
                    RunStatus::Running => break,
                    RunStatus::Paused => {
                        self.control.request_pause();
                        self.control.wait_while_paused().await;
                        // Loop to re-check cancel and re-read the row.
                    }
                    other => {
                        info!(
                            run_id = %run_id,
                            status = other.as_str(),
                            "run status changed externally, stopping"
                        );
                        return Ok(());
                    }
                }
            }

            let outcome = evaluate(&item.check, &ctx).await;
            let result = InspectionResult {
                id: Id::new(),
                run_id: run_id.clone(),
                item_id: Some(item.item_id.clone()),
                item_name: item.name.clone(),
                status: outcome.status,
                detail: outcome.detail.as_deref().and_then(sanitize::detail),
                suggestion: outcome.suggestion.as_deref().and_then(sanitize::detail),
            };
            self.storage
                .record_result(&result, index as u32, generation)
                .await?;
            self.storage
                .advance_progress(run_id, index as u32 + 1, generation)
                .await?;
            debug!(
                run_id = %run_id,
                item = %item.name,
                status = outcome.status.as_str(),
                "check evaluated"
            );
        }

        if self.control.is_cancelled() {
            return Ok(());
        }

        // Counts cover every persisted result, including rows written
        // before a resume.
        let counts = self.storage.count_result_statuses(run_id).await?;
        let current = self.storage.get_run(run_id).await?;
        let (status, summary) = classify_run(
            &counts,
            current.total_items,
            current.processed_items,
            &cluster.name,
        );
        self.storage
            .finalize_run(run_id, status, None, &summary)
            .await?;
        info!(
            run_id = %run_id,
            status = status.as_str(),
            summary = %summary,
            "run finalized"
        );
        Ok(())
    }
}
