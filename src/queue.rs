//! Bounded priority queue of batches.
//!
//! Batches are ordered by `(priority, seq)` ascending: lower priority values
//! play first, and the arrival sequence breaks ties so equal priorities stay
//! FIFO. The payload never takes part in the ordering.

use std::collections::BTreeMap;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use crate::producer::ArtifactHandle;

pub const DEFAULT_PRIORITY: i64 = 50;

#[derive(Debug)]
pub enum SubTask {
    Pause(std::time::Duration),
    Artifact(ArtifactHandle),
}

#[derive(Debug)]
pub struct Batch {
    pub priority: i64,
    pub seq: u64,
    pub tasks: Vec<SubTask>,
}

#[derive(Debug, Error)]
#[error("queue is full ({capacity} batches)")]
pub struct QueueFull {
    pub capacity: usize,
    /// The rejected sub-tasks, handed back so the caller can discard them.
    pub tasks: Vec<SubTask>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct BatchKey {
    priority: i64,
    seq: u64,
}

struct Inner {
    items: BTreeMap<BatchKey, Vec<SubTask>>,
    next_seq: u64,
    unfinished: usize,
}

pub struct PriorityTaskQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    available: Notify,
    drained: watch::Sender<usize>,
}

impl PriorityTaskQueue {
    pub fn new(capacity: usize) -> Self {
        let (drained, _) = watch::channel(0);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                items: BTreeMap::new(),
                next_seq: 0,
                unfinished: 0,
            }),
            available: Notify::new(),
            drained,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue without blocking; returns the arrival sequence number.
    pub fn push(&self, priority: i64, tasks: Vec<SubTask>) -> Result<u64, QueueFull> {
        let mut inner = self.inner.lock().unwrap();
        if inner.items.len() >= self.capacity {
            return Err(QueueFull {
                capacity: self.capacity,
                tasks,
            });
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.items.insert(BatchKey { priority, seq }, tasks);
        inner.unfinished += 1;
        self.drained.send_replace(inner.unfinished);
        drop(inner);

        self.available.notify_one();
        Ok(seq)
    }

    /// Take the most urgent batch, if any.
    pub fn try_pop(&self) -> Option<Batch> {
        let mut inner = self.inner.lock().unwrap();
        inner.items.pop_first().map(|(key, tasks)| Batch {
            priority: key.priority,
            seq: key.seq,
            tasks,
        })
    }

    /// Wait for a batch; `None` once `stop` is cancelled.
    pub async fn pop(&self, stop: &CancellationToken) -> Option<Batch> {
        loop {
            if stop.is_cancelled() {
                return None;
            }
            if let Some(batch) = self.try_pop() {
                return Some(batch);
            }
            tokio::select! {
                _ = self.available.notified() => {}
                _ = stop.cancelled() => return None,
            }
        }
    }

    /// Remove every queued batch and reset the unfinished count.
    /// Returns the removed batches so their artifacts can be discarded.
    pub fn flush(&self) -> Vec<Batch> {
        let mut inner = self.inner.lock().unwrap();
        let items = std::mem::take(&mut inner.items);
        inner.unfinished = 0;
        self.drained.send_replace(0);
        items
            .into_iter()
            .map(|(key, tasks)| Batch {
                priority: key.priority,
                seq: key.seq,
                tasks,
            })
            .collect()
    }

    /// Mark one dequeued batch as fully handled.
    pub fn task_done(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.unfinished = inner.unfinished.saturating_sub(1);
        self.drained.send_replace(inner.unfinished);
    }

    /// Resolve once every enqueued batch has been handled or flushed.
    #[cfg(test)]
    pub async fn wait_drained(&self) {
        let mut rx = self.drained.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn pause(secs: u64) -> Vec<SubTask> {
        vec![SubTask::Pause(Duration::from_secs(secs))]
    }

    #[test]
    fn lower_priority_value_comes_first() {
        let queue = PriorityTaskQueue::new(8);
        queue.push(90, pause(1)).unwrap();
        queue.push(10, pause(2)).unwrap();
        queue.push(50, pause(3)).unwrap();

        let order: Vec<i64> = std::iter::from_fn(|| queue.try_pop().map(|b| b.priority)).collect();
        assert_eq!(order, vec![10, 50, 90]);
    }

    #[test]
    fn equal_priority_is_fifo() {
        let queue = PriorityTaskQueue::new(8);
        let first = queue.push(DEFAULT_PRIORITY, pause(1)).unwrap();
        let second = queue.push(DEFAULT_PRIORITY, pause(2)).unwrap();
        assert!(first < second);

        assert_eq!(queue.try_pop().unwrap().seq, first);
        assert_eq!(queue.try_pop().unwrap().seq, second);
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn push_fails_at_capacity_and_returns_the_tasks() {
        let queue = PriorityTaskQueue::new(1);
        queue.push(1, pause(1)).unwrap();
        let err = queue.push(1, pause(2)).unwrap_err();
        assert_eq!(err.capacity, 1);
        assert_eq!(err.tasks.len(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn flush_empties_queue_and_resets_accounting() {
        let queue = PriorityTaskQueue::new(8);
        queue.push(1, pause(1)).unwrap();
        queue.push(2, pause(1)).unwrap();
        assert_eq!(*queue.drained.borrow(), 2);

        let removed = queue.flush();
        assert_eq!(removed.len(), 2);
        assert!(queue.try_pop().is_none());
        assert_eq!(*queue.drained.borrow(), 0);

        queue.task_done();
        assert_eq!(*queue.drained.borrow(), 0);
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = Arc::new(PriorityTaskQueue::new(8));
        let stop = CancellationToken::new();

        let waiter = {
            let queue = Arc::clone(&queue);
            let stop = stop.clone();
            tokio::spawn(async move { queue.pop(&stop).await.map(|b| b.priority) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(7, pause(0)).unwrap();

        let popped = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(popped, Some(7));
    }

    #[tokio::test]
    async fn pop_returns_none_on_stop() {
        let queue = PriorityTaskQueue::new(8);
        let stop = CancellationToken::new();
        stop.cancel();
        assert!(queue.pop(&stop).await.is_none());
    }

    #[tokio::test]
    async fn wait_drained_resolves_after_task_done() {
        let queue = Arc::new(PriorityTaskQueue::new(8));
        queue.push(1, pause(0)).unwrap();
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait_drained().await })
        };
        queue.try_pop().unwrap();
        queue.task_done();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}
