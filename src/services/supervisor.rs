use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::services::reaper::run_reaper;
use crate::services::worker::{run_worker, WorkerContext};

/// Launches the worker pool and the reaper, restarts crashed tasks, and
/// coordinates graceful shutdown.
pub struct Supervisor {
    shutdown: watch::Sender<bool>,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl Supervisor {
    /// Spawn `worker_count` supervised workers plus one supervised reaper.
    pub fn start(
        ctx: Arc<WorkerContext>,
        worker_count: usize,
        reaper_interval: Duration,
        batch: i64,
        restart_backoff: Duration,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(worker_count + 1);

        for i in 0..worker_count {
            let label = format!("w-{}", i + 1);
            let worker_ctx = ctx.clone();
            let worker_label = label.clone();
            let handle = tokio::spawn(supervise(
                label.clone(),
                restart_backoff,
                shutdown_rx.clone(),
                move |rx| run_worker(worker_label.clone(), worker_ctx.clone(), rx),
            ));
            handles.push((label, handle));
        }

        let reaper_ctx = ctx.clone();
        let handle = tokio::spawn(supervise(
            "reaper".to_string(),
            restart_backoff,
            shutdown_rx,
            move |rx| run_reaper(reaper_ctx.clone(), reaper_interval, batch, rx),
        ));
        handles.push(("reaper".to_string(), handle));

        tracing::info!(worker_count, "supervisor started workers and reaper");
        Self { shutdown, handles }
    }

    /// Signal all tasks and wait up to `grace` for them to drain in-flight
    /// work. Stragglers are abandoned; their leases expire and the reaper
    /// recovers the jobs on next boot.
    pub async fn shutdown(self, grace: Duration) {
        tracing::info!("shutting down worker pool");
        let _ = self.shutdown.send(true);

        let drain = async {
            for (name, handle) in self.handles {
                if let Err(e) = handle.await {
                    tracing::error!(task = %name, error = %e, "task join failed during drain");
                }
            }
        };

        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!(
                grace_secs = grace.as_secs(),
                "shutdown grace elapsed with tasks still running"
            );
        } else {
            tracing::info!("worker pool drained");
        }
    }
}

/// Run a task in its own spawned scope, restarting it after `backoff` if it
/// terminates abnormally. A clean return means the task observed shutdown
/// and is not restarted.
pub async fn supervise<F, Fut>(
    name: String,
    backoff: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut task: F,
) where
    F: FnMut(watch::Receiver<bool>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        let handle = tokio::spawn(task(shutdown.clone()));
        match handle.await {
            Ok(()) => break,
            Err(e) if e.is_panic() => {
                tracing::error!(task = %name, "task crashed, restarting after backoff");
            }
            Err(_) => break,
        }

        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn graceful_return_is_not_restarted() {
        let launches = Arc::new(AtomicUsize::new(0));
        let (_tx, rx) = watch::channel(false);

        let counter = launches.clone();
        supervise("t".to_string(), Duration::from_millis(5), rx, move |_rx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {}
        })
        .await;

        assert_eq!(launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_task_is_restarted_until_shutdown() {
        let launches = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(false);

        let counter = launches.clone();
        let supervisor = tokio::spawn(supervise(
            "t".to_string(),
            Duration::from_millis(5),
            rx,
            move |_rx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { panic!("boom") }
            },
        ));

        // let it crash and restart a few times
        while launches.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), supervisor)
            .await
            .expect("supervise should stop after shutdown")
            .unwrap();
        assert!(launches.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn restarted_task_observes_shutdown_signal() {
        let launches = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(false);

        let counter = launches.clone();
        let supervisor = tokio::spawn(supervise(
            "t".to_string(),
            Duration::from_millis(5),
            rx,
            move |mut rx| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        panic!("first launch crashes");
                    }
                    // replacement runs until told to stop
                    let _ = rx.changed().await;
                }
            },
        ));

        while launches.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), supervisor)
            .await
            .expect("supervise should stop after shutdown")
            .unwrap();
    }
}
