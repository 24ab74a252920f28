use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Bounded in-memory FIFO of job ids.
///
/// The queue is a scheduling hint, not a source of truth: the store is
/// authoritative, and the reaper re-offers ids the queue has lost. Offers
/// are non-blocking so submission never stalls behind slow workers.
pub struct JobQueue {
    tx: mpsc::Sender<Uuid>,
    rx: Mutex<mpsc::Receiver<Uuid>>,
    depth: AtomicI64,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            depth: AtomicI64::new(0),
        }
    }

    /// Offer a job id without blocking. Returns false when the queue is
    /// full; the id stays pending in the store and the reaper's stale scan
    /// will re-offer it.
    pub fn offer(&self, id: Uuid) -> bool {
        match self.tx.try_send(id) {
            Ok(()) => {
                let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::gauge!("job_queue_depth").set(depth as f64);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(job_id = %id, "queue full, dropping offer");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Take the next job id, waiting until one is available. Cancellation
    /// safe: callers select this against the shutdown signal.
    pub async fn take(&self) -> Option<Uuid> {
        let mut rx = self.rx.lock().await;
        let id = rx.recv().await;
        if id.is_some() {
            let depth = self.depth.fetch_sub(1, Ordering::Relaxed) - 1;
            metrics::gauge!("job_queue_depth").set(depth as f64);
        }
        id
    }

    /// Current number of queued ids.
    pub fn depth(&self) -> i64 {
        self.depth.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offers_and_takes_in_fifo_order() {
        let queue = JobQueue::new(8);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(queue.offer(a));
        assert!(queue.offer(b));
        assert_eq!(queue.depth(), 2);

        assert_eq!(queue.take().await, Some(a));
        assert_eq!(queue.take().await, Some(b));
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn offer_is_non_blocking_when_full() {
        let queue = JobQueue::new(2);
        assert!(queue.offer(Uuid::new_v4()));
        assert!(queue.offer(Uuid::new_v4()));
        assert!(!queue.offer(Uuid::new_v4()));
        assert_eq!(queue.depth(), 2);
    }

    #[tokio::test]
    async fn take_wakes_on_later_offer() {
        let queue = std::sync::Arc::new(JobQueue::new(2));
        let id = Uuid::new_v4();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.take().await })
        };
        tokio::task::yield_now().await;
        queue.offer(id);

        assert_eq!(waiter.await.unwrap(), Some(id));
    }
}
