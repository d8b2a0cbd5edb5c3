//! The single consumer of the task queue.
//!
//! The worker takes one batch at a time and runs its sub-tasks in order:
//! pauses are slept, artifacts are awaited (bounded by the producer timeout)
//! and handed to the playback backend. Stop-current ends whatever sub-task is
//! in flight and the worker moves on; stop-program abandons the batch and
//! ends the loop.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::cancel::CancellationController;
use crate::config::Config;
use crate::player::{PlaybackBackend, PlaybackOutcome};
use crate::producer::{remove_if_exists, ArtifactHandle, WaitOutcome};
use crate::queue::{Batch, PriorityTaskQueue, SubTask};

pub struct PlaybackWorker {
    queue: Arc<PriorityTaskQueue>,
    cancel: CancellationController,
    backend: Box<dyn PlaybackBackend>,
    producer_timeout: Duration,
    keep_files: bool,
}

impl PlaybackWorker {
    pub fn new(
        queue: Arc<PriorityTaskQueue>,
        cancel: CancellationController,
        backend: Box<dyn PlaybackBackend>,
        config: &Config,
    ) -> Self {
        Self {
            queue,
            cancel,
            backend,
            producer_timeout: config.playback.producer_timeout(),
            keep_files: config.audio.keep_file,
        }
    }

    /// Consume batches until the program stops.
    pub async fn run(self) {
        info!("Playback worker started");
        loop {
            self.hold_while_paused().await;
            let Some(batch) = self.queue.pop(self.cancel.program_token()).await else {
                break;
            };
            self.cancel.clear_current();
            debug!(
                "Dequeued batch #{} (priority {}, {} tasks)",
                batch.seq,
                batch.priority,
                batch.tasks.len()
            );

            // A pause that arrives while waiting on the queue holds the batch.
            // Stopping during that hold drops it.
            if self.cancel.is_paused() {
                self.hold_while_paused().await;
                if self.cancel.is_current_stopped() || self.cancel.is_program_stopped() {
                    info!("Dropping held batch #{}", batch.seq);
                    self.discard(batch.tasks);
                    self.queue.task_done();
                    self.cancel.clear_current();
                    continue;
                }
            }

            self.play_batch(batch).await;
            self.queue.task_done();
        }
        info!("Playback worker stopped");
    }

    async fn hold_while_paused(&self) {
        if self.cancel.is_paused() && !self.cancel.is_program_stopped() {
            info!("Playback paused");
            self.cancel.wait_resumed().await;
            info!("Playback resumed");
        }
    }

    async fn play_batch(&self, batch: Batch) {
        let mut tasks = batch.tasks.into_iter();
        while let Some(task) = tasks.next() {
            if self.cancel.is_program_stopped() {
                info!("Abandoning batch #{} on shutdown", batch.seq);
                self.discard(std::iter::once(task).chain(tasks));
                return;
            }
            match task {
                SubTask::Pause(duration) => self.pause(duration).await,
                SubTask::Artifact(handle) => self.play_artifact(handle).await,
            }
            self.cancel.clear_current();
        }
    }

    async fn pause(&self, duration: Duration) {
        debug!("Sleeping {:.3}s", duration.as_secs_f64());
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.cancel.current_stopped() => info!("Pause interrupted"),
        }
    }

    async fn play_artifact(&self, mut handle: ArtifactHandle) {
        let waited = tokio::select! {
            outcome = handle.wait(self.producer_timeout) => Some(outcome),
            _ = self.cancel.current_stopped() => None,
        };

        match waited {
            None => {
                info!("Stopped while waiting for artifact {}", handle.name());
                handle.discard(self.keep_files);
            }
            Some(WaitOutcome::TimedOut) => {
                warn!("Artifact {} runs too long, skipping", handle.name());
                handle.discard(self.keep_files);
            }
            Some(WaitOutcome::Failed) => {
                warn!("Artifact {} could not be produced, skipping", handle.name());
            }
            Some(WaitOutcome::Ready) => {
                info!("Playing {}", handle.path().display());
                match self.backend.play(handle.path(), &self.cancel).await {
                    Ok(PlaybackOutcome::Finished) => debug!("Finished {}", handle.name()),
                    Ok(PlaybackOutcome::Interrupted) => {
                        info!("Playback of {} stopped", handle.name())
                    }
                    Err(e) => error!("Playback of {} failed: {e}", handle.name()),
                }
                if !self.keep_files {
                    remove_if_exists(handle.path()).await;
                }
            }
        }
    }

    fn discard(&self, tasks: impl IntoIterator<Item = SubTask>) {
        for task in tasks {
            if let SubTask::Artifact(handle) = task {
                handle.discard(self.keep_files);
            }
        }
    }
}
