//! Process-wide cancellation signals.
//!
//! Three independent signals plus a pause switch, all idempotent and safe to
//! raise from any task or thread:
//! - stop current: abort the in-flight sub-task (wait or playback)
//! - stop program: end the worker loop and the process
//! - stop all: stop current and flush the queue
//!
//! Signals are atomics paired with a `Notify` so the worker can either poll
//! them or block on them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::queue::{PriorityTaskQueue, SubTask};

struct Signals {
    stop_current: AtomicBool,
    current_notify: Notify,
    paused: AtomicBool,
    resume_notify: Notify,
    program: CancellationToken,
}

#[derive(Clone)]
pub struct CancellationController {
    signals: Arc<Signals>,
    queue: Arc<PriorityTaskQueue>,
    keep_files: bool,
}

impl CancellationController {
    pub fn new(queue: Arc<PriorityTaskQueue>, keep_files: bool) -> Self {
        Self {
            signals: Arc::new(Signals {
                stop_current: AtomicBool::new(false),
                current_notify: Notify::new(),
                paused: AtomicBool::new(false),
                resume_notify: Notify::new(),
                program: CancellationToken::new(),
            }),
            queue,
            keep_files,
        }
    }

    pub fn stop_current(&self) {
        self.signals.stop_current.store(true, Ordering::SeqCst);
        self.signals.current_notify.notify_waiters();
    }

    /// Stop the current sub-task and discard every queued batch.
    /// Returns the number of batches removed.
    pub fn stop_all(&self) -> usize {
        self.stop_current();
        let flushed = self.queue.flush();
        let count = flushed.len();
        for batch in flushed {
            for task in batch.tasks {
                if let SubTask::Artifact(handle) = task {
                    handle.discard(self.keep_files);
                }
            }
        }
        info!("Flushed {count} queued batches");
        count
    }

    pub fn stop_program(&self) {
        self.signals.program.cancel();
        self.stop_current();
        // Wake a paused worker so it can observe the stop.
        self.signals.resume_notify.notify_waiters();
    }

    pub fn pause(&self) {
        self.signals.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.signals.paused.store(false, Ordering::SeqCst);
        self.signals.resume_notify.notify_waiters();
    }

    pub fn is_current_stopped(&self) -> bool {
        self.signals.stop_current.load(Ordering::SeqCst)
    }

    pub fn is_program_stopped(&self) -> bool {
        self.signals.program.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        self.signals.paused.load(Ordering::SeqCst)
    }

    /// Consume a raised stop-current signal.
    pub fn clear_current(&self) {
        self.signals.stop_current.store(false, Ordering::SeqCst);
    }

    /// Token cancelled when the program stops.
    pub fn program_token(&self) -> &CancellationToken {
        &self.signals.program
    }

    /// Resolve once stop-current is raised (immediately if it already is).
    pub async fn current_stopped(&self) {
        loop {
            let notified = self.signals.current_notify.notified();
            if self.is_current_stopped() {
                return;
            }
            notified.await;
        }
    }

    /// Resolve once consumption is not paused or the program stops.
    pub async fn wait_resumed(&self) {
        loop {
            let notified = self.signals.resume_notify.notified();
            if !self.is_paused() || self.is_program_stopped() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn controller() -> (CancellationController, Arc<PriorityTaskQueue>) {
        let queue = Arc::new(PriorityTaskQueue::new(8));
        (CancellationController::new(Arc::clone(&queue), false), queue)
    }

    #[tokio::test]
    async fn stop_current_wakes_waiters_and_is_idempotent() {
        let (cancel, _) = controller();
        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move { cancel.current_stopped().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.stop_current();
        cancel.stop_current();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();

        assert!(cancel.is_current_stopped());
        cancel.clear_current();
        assert!(!cancel.is_current_stopped());
        assert!(!cancel.is_program_stopped());
    }

    #[tokio::test]
    async fn stop_all_flushes_the_queue() {
        let (cancel, queue) = controller();
        queue.push(1, vec![SubTask::Pause(Duration::from_secs(1))]).unwrap();
        queue.push(2, vec![SubTask::Pause(Duration::from_secs(1))]).unwrap();

        assert_eq!(cancel.stop_all(), 2);
        assert!(queue.try_pop().is_none());
        assert!(cancel.is_current_stopped());
    }

    #[tokio::test]
    async fn stop_program_raises_stop_current_and_releases_pause() {
        let (cancel, _) = controller();
        cancel.pause();
        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move { cancel.wait_resumed().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.stop_program();

        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(cancel.is_program_stopped());
        assert!(cancel.is_current_stopped());
    }

    #[tokio::test]
    async fn resume_releases_a_paused_waiter() {
        let (cancel, _) = controller();
        cancel.pause();
        assert!(cancel.is_paused());
        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move { cancel.wait_resumed().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        cancel.resume();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}
