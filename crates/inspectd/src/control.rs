//! Per-run execution control.
//!
//! One [`ExecutionControl`] exists for each locally-executing run: a pause
//! gate and a cancel flag, set by API-facing control calls and observed
//! cooperatively by the worker between items. It lives exactly as long as
//! its worker task and is never the authority on run status — that is the
//! run row.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct ExecutionControl {
    cancel: CancellationToken,
    paused: AtomicBool,
    gate: Notify,
}

impl ExecutionControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Control for a run recovered in the paused state: the gate starts
    /// closed so the worker blocks until an explicit resume.
    pub fn new_paused() -> Self {
        let control = Self::default();
        control.paused.store(true, Ordering::SeqCst);
        control
    }

    /// Request cancellation; wakes a worker blocked on the pause gate.
    /// Returns whether the flag was newly set.
    pub fn request_cancel(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Close the pause gate. Returns whether the flag was newly set.
    pub fn request_pause(&self) -> bool {
        !self.paused.swap(true, Ordering::SeqCst)
    }

    /// Open the pause gate and wake the worker. Returns whether the flag
    /// was newly cleared.
    pub fn clear_pause(&self) -> bool {
        let was_paused = self.paused.swap(false, Ordering::SeqCst);
        if was_paused {
            self.gate.notify_waiters();
        }
        was_paused
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Block while the gate is closed. Returns immediately on cancel, so a
    /// cancelled-while-paused run exits on waking rather than continuing.
    pub async fn wait_while_paused(&self) {
        loop {
            if self.is_cancelled() || !self.is_paused() {
                return;
            }
            let notified = self.gate.notified();
            // Re-check after arming the waiter to close the wakeup race.
            if self.is_cancelled() || !self.is_paused() {
                return;
            }
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = notified => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn wait_returns_immediately_when_not_paused() {
        let control = ExecutionControl::new();
        timeout(Duration::from_millis(100), control.wait_while_paused())
            .await
            .expect("should not block");
    }

    #[tokio::test]
    async fn resume_wakes_paused_waiter() {
        let control = Arc::new(ExecutionControl::new());
        assert!(control.request_pause());

        let waiter = {
            let control = Arc::clone(&control);
            tokio::spawn(async move { control.wait_while_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        assert!(control.clear_pause());
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_wakes_paused_waiter() {
        let control = Arc::new(ExecutionControl::new());
        control.request_pause();

        let waiter = {
            let control = Arc::clone(&control);
            tokio::spawn(async move { control.wait_while_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        assert!(control.request_cancel());
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancel should wake waiter")
            .unwrap();
        assert!(control.is_cancelled());
        assert!(control.is_paused());
    }

    #[test]
    fn signals_are_idempotent() {
        let control = ExecutionControl::new();
        assert!(control.request_pause());
        assert!(!control.request_pause());
        assert!(control.clear_pause());
        assert!(!control.clear_pause());
        assert!(control.request_cancel());
        assert!(!control.request_cancel());
    }
}
