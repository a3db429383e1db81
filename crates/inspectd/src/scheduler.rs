//! Run scheduler: bounded worker pool plus the in-memory control table.
//!
//! Constructed once at daemon start and injected wherever runs are
//! submitted or controlled. At most `max_concurrent` runs execute at a
//! time; each run owns exactly one worker task for its lifetime. The
//! control table maps run id to its [`ExecutionControl`] and worker
//! handle — pure bookkeeping behind one mutex, never the authority on run
//! status.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use inspect_core::{Id, RunStatus};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::control::ExecutionControl;
use crate::storage::{Storage, StorageError};
use crate::worker::RunWorker;

/// Default maximum concurrent locally-executed runs.
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 4;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

struct ActiveRun {
    control: Arc<ExecutionControl>,
    handle: JoinHandle<()>,
}

/// Scheduler state shared across the HTTP surface and the worker pool.
pub struct RunScheduler {
    storage: Arc<Storage>,
    semaphore: Arc<Semaphore>,
    active: Mutex<HashMap<Id, ActiveRun>>,
}

impl RunScheduler {
    pub fn new(storage: Arc<Storage>, max_concurrent: usize) -> Self {
        Self {
            storage,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults(storage: Arc<Storage>) -> Self {
        Self::new(storage, DEFAULT_MAX_CONCURRENT_RUNS)
    }

    fn table(&self) -> MutexGuard<'_, HashMap<Id, ActiveRun>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs with a live worker (running or blocked on pause).
    pub fn active_count(&self) -> usize {
        self.table()
            .values()
            .filter(|a| !a.handle.is_finished())
            .count()
    }

    fn lookup_control(&self, run_id: &Id) -> Option<Arc<ExecutionControl>> {
        let table = self.table();
        table
            .get(run_id)
            .filter(|a| !a.handle.is_finished())
            .map(|a| Arc::clone(&a.control))
    }

    fn deregister(&self, run_id: &Id) {
        self.table().remove(run_id);
    }

    /// Submit a run for local execution. Bumps the run's fencing
    /// generation, registers a fresh control, and spawns the worker onto
    /// the bounded pool. A run that already has a live worker is left
    /// alone — exactly one worker may resume a given run.
    pub async fn submit(self: &Arc<Self>, run_id: &Id) -> Result<()> {
        {
            let table = self.table();
            if let Some(active) = table.get(run_id) {
                if !active.handle.is_finished() {
                    warn!(run_id = %run_id, "run already has an active worker, ignoring submit");
                    return Ok(());
                }
            }
        }

        let generation = self.storage.begin_run_attempt(run_id).await?;
        let run = self.storage.get_run(run_id).await?;

        // A run recovered in the paused state keeps its gate closed until
        // an explicit resume.
        let control = if run.status == RunStatus::Paused {
            Arc::new(ExecutionControl::new_paused())
        } else {
            Arc::new(ExecutionControl::new())
        };

        let scheduler = Arc::clone(self);
        let worker_control = Arc::clone(&control);
        let id = run_id.clone();
        let handle = tokio::spawn(async move {
            let Ok(_permit) = scheduler.semaphore.clone().acquire_owned().await else {
                return;
            };
            let worker = RunWorker::new(Arc::clone(&scheduler.storage), worker_control);
            worker.execute(&id, generation).await;
            scheduler.deregister(&id);
        });

        let mut table = self.table();
        // The worker deregisters itself on completion; if it somehow beat
        // this insert, don't leave a dead entry behind.
        if handle.is_finished() {
            table.remove(run_id);
        } else {
            table.insert(run_id.clone(), ActiveRun { control, handle });
        }
        drop(table);
        info!(run_id = %run_id, generation, "run submitted");
        Ok(())
    }

    /// Request a pause. Idempotent; a run with no active worker is a
    /// silent no-op. Returns whether a state change occurred.
    pub async fn pause(&self, run_id: &Id) -> Result<bool> {
        let Some(control) = self.lookup_control(run_id) else {
            return Ok(false);
        };
        if control.is_cancelled() || control.is_paused() {
            return Ok(false);
        }
        // Persist first: the run row is what the worker re-reads. The
        // conditional transition loses cleanly if the worker finalized in
        // the meantime.
        let changed = self
            .storage
            .transition_run_status(
                run_id,
                &[RunStatus::Queued, RunStatus::Running],
                RunStatus::Paused,
            )
            .await?;
        if !changed {
            return Ok(false);
        }
        control.request_pause();
        info!(run_id = %run_id, "pause requested");
        Ok(true)
    }

    /// Resume a paused run. Only succeeds while its worker still exists;
    /// after a daemon restart the run must be resubmitted instead.
    pub async fn resume(&self, run_id: &Id) -> Result<bool> {
        let Some(control) = self.lookup_control(run_id) else {
            return Ok(false);
        };
        if control.is_cancelled() || !control.is_paused() {
            return Ok(false);
        }
        let changed = self
            .storage
            .transition_run_status(run_id, &[RunStatus::Paused], RunStatus::Running)
            .await?;
        if !changed {
            return Ok(false);
        }
        control.clear_pause();
        info!(run_id = %run_id, "run resumed");
        Ok(true)
    }

    /// Request cancellation. Idempotent; a run with no active worker is a
    /// silent no-op. Returns whether a state change occurred.
    pub async fn cancel(&self, run_id: &Id) -> Result<bool> {
        let Some(control) = self.lookup_control(run_id) else {
            return Ok(false);
        };
        if control.is_cancelled() {
            return Ok(false);
        }
        let changed = self
            .storage
            .transition_run_status(
                run_id,
                &[RunStatus::Queued, RunStatus::Running, RunStatus::Paused],
                RunStatus::Cancelled,
            )
            .await?;
        if !changed {
            return Ok(false);
        }
        control.request_cancel();
        info!(run_id = %run_id, "cancel requested");
        Ok(true)
    }

    /// `(total, processed, percent)` straight from the run row.
    pub async fn progress(&self, run_id: &Id) -> Result<(u32, u32, u32)> {
        let run = self.storage.get_run(run_id).await?;
        Ok((
            run.total_items,
            run.processed_items,
            run.progress_percent(),
        ))
    }

    /// Resubmit server-executed runs that were interrupted by a restart.
    /// Each resumes from its persisted checkpoint.
    pub async fn recover(self: &Arc<Self>) -> Result<usize> {
        let runs = self.storage.list_server_runs_to_recover().await?;
        for run in &runs {
            self.submit(&run.id).await?;
        }
        Ok(runs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use inspect_core::{
        CheckSpec, ClusterConfig, CommandCheck, CommandLine, ExecutorKind, InspectionRun, PlanItem,
    };
    use std::time::Duration;
    use tempfile::TempDir;

    struct TestScheduler {
        scheduler: Arc<RunScheduler>,
        storage: Arc<Storage>,
        cluster: ClusterConfig,
        _dir: TempDir,
    }

    async fn create_test_scheduler() -> TestScheduler {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let storage = Arc::new(storage);

        // The worker refuses to start without the credential file.
        let kubeconfig = dir.path().join("kubeconfig.yaml");
        std::fs::write(&kubeconfig, "apiVersion: v1\nkind: Config\n").unwrap();

        let now = Utc::now();
        let cluster = ClusterConfig {
            id: Id::new(),
            name: "test".to_string(),
            kubeconfig_path: kubeconfig.display().to_string(),
            prometheus_url: None,
            contexts: Vec::new(),
            execution_mode: ExecutorKind::Server,
            default_agent_id: None,
            created_at: now,
            updated_at: now,
        };
        storage.insert_cluster(&cluster).await.unwrap();

        let scheduler = Arc::new(RunScheduler::new(Arc::clone(&storage), 2));
        TestScheduler {
            scheduler,
            storage,
            cluster,
            _dir: dir,
        }
    }

    fn command_plan_item(name: &str, command: &str) -> PlanItem {
        PlanItem {
            item_id: Id::new(),
            name: name.to_string(),
            description: None,
            check: CheckSpec::Command(CommandCheck {
                command: CommandLine::Shell(command.to_string()),
                timeout_secs: None,
                success_exit_codes: None,
                expect_substrings: Vec::new(),
                success_message: None,
                failure_message: None,
                suggestion: None,
            }),
        }
    }

    fn queued_run(cluster_id: &Id, plan: Vec<PlanItem>) -> InspectionRun {
        InspectionRun {
            id: Id::new(),
            cluster_id: cluster_id.clone(),
            operator: Some("tester".to_string()),
            status: RunStatus::Queued,
            executor: ExecutorKind::Server,
            agent_id: None,
            agent_status: None,
            total_items: plan.len() as u32,
            processed_items: 0,
            plan,
            summary: None,
            report_path: None,
            generation: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    async fn wait_terminal(storage: &Storage, run_id: &Id) -> InspectionRun {
        for _ in 0..200 {
            let run = storage.get_run(run_id).await.unwrap();
            if run.status.is_terminal() {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("run {run_id} did not reach a terminal state");
    }

    #[tokio::test]
    async fn submitted_run_executes_to_finished() {
        let ts = create_test_scheduler().await;
        let run = queued_run(
            &ts.cluster.id,
            vec![
                command_plan_item("first", "true"),
                command_plan_item("second", "echo ok"),
            ],
        );
        ts.storage.insert_run(&run).await.unwrap();

        ts.scheduler.submit(&run.id).await.unwrap();
        let done = wait_terminal(&ts.storage, &run.id).await;

        assert_eq!(done.status, RunStatus::Finished);
        assert_eq!(done.processed_items, 2);
        assert!(done.summary.unwrap().contains("passed: 2"));
        let results = ts.storage.list_results(&run.id).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].item_name, "first");
    }

    #[tokio::test]
    async fn failed_check_fails_the_run() {
        let ts = create_test_scheduler().await;
        let run = queued_run(
            &ts.cluster.id,
            vec![
                command_plan_item("ok", "true"),
                command_plan_item("broken", "false"),
            ],
        );
        ts.storage.insert_run(&run).await.unwrap();

        ts.scheduler.submit(&run.id).await.unwrap();
        let done = wait_terminal(&ts.storage, &run.id).await;

        assert_eq!(done.status, RunStatus::Failed);
        assert!(done.summary.unwrap().contains("failed: 1"));
    }

    #[tokio::test]
    async fn control_calls_on_unknown_run_are_noops() {
        let ts = create_test_scheduler().await;
        let ghost = Id::new();
        assert!(!ts.scheduler.pause(&ghost).await.unwrap());
        assert!(!ts.scheduler.resume(&ghost).await.unwrap());
        assert!(!ts.scheduler.cancel(&ghost).await.unwrap());
    }

    #[tokio::test]
    async fn pause_then_resume_completes_run() {
        let ts = create_test_scheduler().await;
        let plan: Vec<PlanItem> = (0..4)
            .map(|i| command_plan_item(&format!("item-{i}"), "sleep 0.1"))
            .collect();
        let run = queued_run(&ts.cluster.id, plan);
        ts.storage.insert_run(&run).await.unwrap();
        ts.scheduler.submit(&run.id).await.unwrap();

        // Let the worker get going, then pause between items.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let changed = ts.scheduler.pause(&run.id).await.unwrap();
        assert!(changed);

        // A second pause is a no-op.
        assert!(!ts.scheduler.pause(&run.id).await.unwrap());

        // While paused the run makes no further progress.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let paused = ts.storage.get_run(&run.id).await.unwrap();
        assert_eq!(paused.status, RunStatus::Paused);
        let frozen_at = paused.processed_items;
        tokio::time::sleep(Duration::from_millis(300)).await;
        let still = ts.storage.get_run(&run.id).await.unwrap();
        assert_eq!(still.processed_items, frozen_at);

        assert!(ts.scheduler.resume(&run.id).await.unwrap());
        let done = wait_terminal(&ts.storage, &run.id).await;
        assert_eq!(done.status, RunStatus::Finished);
        assert_eq!(done.processed_items, 4);
    }

    #[tokio::test]
    async fn cancel_while_paused_stops_without_more_results() {
        let ts = create_test_scheduler().await;
        let plan: Vec<PlanItem> = (0..4)
            .map(|i| command_plan_item(&format!("item-{i}"), "sleep 0.1"))
            .collect();
        let run = queued_run(&ts.cluster.id, plan);
        ts.storage.insert_run(&run).await.unwrap();
        ts.scheduler.submit(&run.id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        ts.scheduler.pause(&run.id).await.unwrap();
        // Give the worker time to block on the gate.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let before = ts.storage.list_results(&run.id).await.unwrap().len();

        assert!(ts.scheduler.cancel(&run.id).await.unwrap());
        // Cancelled is already terminal; the worker exits without
        // finalizing over it.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let done = ts.storage.get_run(&run.id).await.unwrap();
        assert_eq!(done.status, RunStatus::Cancelled);
        let after = ts.storage.list_results(&run.id).await.unwrap().len();
        assert_eq!(before, after, "no result rows written after cancel");

        // Further control calls are no-ops once the worker is gone.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!ts.scheduler.cancel(&run.id).await.unwrap());
    }

    #[tokio::test]
    async fn processed_items_never_decreases() {
        let ts = create_test_scheduler().await;
        let plan: Vec<PlanItem> = (0..3)
            .map(|i| command_plan_item(&format!("item-{i}"), "sleep 0.05"))
            .collect();
        let run = queued_run(&ts.cluster.id, plan);
        ts.storage.insert_run(&run).await.unwrap();
        ts.scheduler.submit(&run.id).await.unwrap();

        let mut last = 0;
        for _ in 0..100 {
            let current = ts.storage.get_run(&run.id).await.unwrap();
            assert!(current.processed_items >= last);
            assert!(current.processed_items <= current.total_items);
            last = current.processed_items;
            if current.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(last, 3);
    }

    #[tokio::test]
    async fn recover_resubmits_interrupted_runs() {
        let ts = create_test_scheduler().await;
        let mut run = queued_run(&ts.cluster.id, vec![command_plan_item("only", "true")]);
        // Simulate a run that was mid-flight when the process died.
        run.status = RunStatus::Running;
        ts.storage.insert_run(&run).await.unwrap();

        let recovered = ts.scheduler.recover().await.unwrap();
        assert_eq!(recovered, 1);
        let done = wait_terminal(&ts.storage, &run.id).await;
        assert_eq!(done.status, RunStatus::Finished);
    }
}
