use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::time::sleep;
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::store::{self, StoreError};
use crate::services::queue::JobQueue;

/// Knobs the worker pool and reaper share.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub lease_seconds: i64,
    pub max_retries: i64,
    pub fault_rate: f64,
    pub work_delay_ms: u64,
}

/// Everything a worker, reaper, or supervisor task needs.
pub struct WorkerContext {
    pub db: SqlitePool,
    pub queue: Arc<JobQueue>,
    pub clock: Arc<dyn Clock>,
    pub settings: WorkerSettings,
}

#[derive(Debug, thiserror::Error)]
enum ProcessError {
    /// A conditional update did not apply: the lease was lost to the reaper
    /// or another worker. The job is no longer ours to account for.
    #[error("lease lost at {stage}")]
    LeaseLost { stage: &'static str },

    #[error("injected transform failure")]
    Injected,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Worker loop: take an id, claim it, process it. Errors never escape —
/// every failure ends in a retry, a permanent failure record, or an
/// abandoned lease for the reaper.
pub async fn run_worker(
    label: String,
    ctx: Arc<WorkerContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(worker = %label, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        let id = tokio::select! {
            _ = shutdown.changed() => break,
            id = ctx.queue.take() => match id {
                Some(id) => id,
                None => break,
            },
        };

        handle_job(&label, &ctx, id).await;
    }

    tracing::info!(worker = %label, "worker stopped");
}

/// Claim and process a single job id pulled from the queue.
pub async fn handle_job(label: &str, ctx: &WorkerContext, id: Uuid) {
    let now = ctx.clock.now();
    let lease_until = now + chrono::Duration::seconds(ctx.settings.lease_seconds);

    match store::claim(&ctx.db, id, label, lease_until, now).await {
        Ok(true) => {}
        Ok(false) => {
            // Another worker owns it, it is terminal, or the reaper is
            // cycling it. Drop the hint.
            tracing::debug!(worker = %label, job_id = %id, "claim lost, discarding id");
            return;
        }
        Err(e) => {
            // Never claimed, so the id lives only in the queue hint:
            // re-offer rather than strand a pending row.
            tracing::error!(worker = %label, job_id = %id, error = %e, "claim failed, re-offering");
            ctx.queue.offer(id);
            return;
        }
    }

    let started = std::time::Instant::now();
    match process_claimed(label, ctx, id).await {
        Ok(chars) => {
            metrics::counter!("jobs_completed_total").increment(1);
            metrics::histogram!("job_processing_seconds").record(started.elapsed().as_secs_f64());
            tracing::info!(worker = %label, job_id = %id, characters = chars, "job completed");
        }
        Err(ProcessError::LeaseLost { stage }) => {
            tracing::warn!(worker = %label, job_id = %id, stage, "lease lost mid-flight, abandoning");
        }
        Err(e) => retry_or_fail(label, ctx, id, &e).await,
    }
}

async fn process_claimed(label: &str, ctx: &WorkerContext, id: Uuid) -> Result<i64, ProcessError> {
    if !store::mark_processing(&ctx.db, id, ctx.clock.now()).await? {
        return Err(ProcessError::LeaseLost { stage: "start" });
    }

    let text = store::fetch_text(&ctx.db, id)
        .await?
        .ok_or(ProcessError::LeaseLost { stage: "fetch" })?;

    if ctx.settings.fault_rate > 0.0 && rand::random::<f64>() < ctx.settings.fault_rate {
        return Err(ProcessError::Injected);
    }

    if ctx.settings.work_delay_ms > 0 {
        maybe_extend_lease(label, ctx, id).await;
        sleep(Duration::from_millis(ctx.settings.work_delay_ms)).await;
    }

    let chars = text.chars().count() as i64;

    if !store::complete(&ctx.db, id, chars, ctx.clock.now()).await? {
        // The lease expired during the delay and someone else owns the
        // outcome. The transform is idempotent, so duplicate work is noise.
        return Err(ProcessError::LeaseLost { stage: "complete" });
    }
    Ok(chars)
}

/// If the simulated work would eat most of the lease window, push the
/// deadline out before sleeping so the reaper does not race us.
async fn maybe_extend_lease(label: &str, ctx: &WorkerContext, id: Uuid) {
    let delay_ms = ctx.settings.work_delay_ms as i64;
    let lease_ms = ctx.settings.lease_seconds.saturating_mul(1000);
    if delay_ms * 2 < lease_ms {
        return;
    }

    let now = ctx.clock.now();
    let new_deadline =
        now + chrono::Duration::milliseconds(delay_ms) + chrono::Duration::seconds(ctx.settings.lease_seconds);
    match store::extend_lease(&ctx.db, id, new_deadline, now).await {
        Ok(true) => {
            tracing::debug!(worker = %label, job_id = %id, "lease extended for long transform");
        }
        Ok(false) => {
            tracing::warn!(worker = %label, job_id = %id, "lease extension did not apply");
        }
        Err(e) => {
            tracing::error!(worker = %label, job_id = %id, error = %e, "lease extension failed");
        }
    }
}

/// Convert a processing error into a retry or a permanent failure.
/// Retries while the job's recorded attempts are below the cap; the retry
/// itself increments the counter, so a failed row carries attempts == cap.
async fn retry_or_fail(label: &str, ctx: &WorkerContext, id: Uuid, error: &ProcessError) {
    let attempts = match store::get_attempts(&ctx.db, id).await {
        Ok(Some(a)) => a,
        Ok(None) => 0,
        Err(e) => {
            tracing::error!(worker = %label, job_id = %id, error = %e, "attempts read failed");
            0
        }
    };
    let now = ctx.clock.now();
    let message = error.to_string();

    if attempts < ctx.settings.max_retries {
        match store::record_retry(&ctx.db, id, &message, now).await {
            Ok(true) => {
                ctx.queue.offer(id);
                metrics::counter!("jobs_retried_total").increment(1);
                tracing::warn!(
                    worker = %label,
                    job_id = %id,
                    attempts = attempts + 1,
                    max_retries = ctx.settings.max_retries,
                    error = %message,
                    "job failed, re-queued for retry"
                );
            }
            Ok(false) => {
                tracing::debug!(worker = %label, job_id = %id, "retry not applied, job moved on");
            }
            Err(e) => {
                // The row keeps its lease; the reaper recovers it.
                tracing::error!(worker = %label, job_id = %id, error = %e, "retry record failed");
            }
        }
    } else {
        match store::record_failed(&ctx.db, id, &message, now).await {
            Ok(true) => {
                metrics::counter!("jobs_failed_total").increment(1);
                tracing::error!(
                    worker = %label,
                    job_id = %id,
                    attempts,
                    error = %message,
                    "job failed permanently"
                );
            }
            Ok(false) => {
                tracing::debug!(worker = %label, job_id = %id, "failure record not applied");
            }
            Err(e) => {
                tracing::error!(worker = %label, job_id = %id, error = %e, "failure record failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::store::from_millis;
    use crate::models::job::JobStatus;
    use tempfile::TempDir;

    async fn context(fault_rate: f64, max_retries: i64) -> (TempDir, Arc<WorkerContext>) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}/jobs.db", dir.path().display());
        let db = crate::db::init_pool(&url, 5).await.unwrap();
        crate::db::run_migrations(&db).await.unwrap();

        let ctx = Arc::new(WorkerContext {
            db,
            queue: Arc::new(JobQueue::new(64)),
            clock: Arc::new(ManualClock::new(from_millis(1_700_000_000_000))),
            settings: WorkerSettings {
                lease_seconds: 30,
                max_retries,
                fault_rate,
                work_delay_ms: 0,
            },
        });
        (dir, ctx)
    }

    #[tokio::test]
    async fn happy_path_counts_code_points() {
        let (_dir, ctx) = context(0.0, 3).await;
        let id = Uuid::new_v4();
        store::insert(&ctx.db, id, "héllo🌍", ctx.clock.now())
            .await
            .unwrap();

        handle_job("w-1", &ctx, id).await;

        let view = store::get_view(&ctx.db, id).await.unwrap().unwrap();
        assert_eq!(view.status, JobStatus::Done);
        assert_eq!(view.result_chars, Some(6));
        assert_eq!(view.attempts, 0);
        assert_eq!(view.lease_until, None);
    }

    #[tokio::test]
    async fn faults_retry_until_cap_then_fail_permanently() {
        let (_dir, ctx) = context(1.0, 2).await;
        let id = Uuid::new_v4();
        store::insert(&ctx.db, id, "doomed", ctx.clock.now())
            .await
            .unwrap();

        // attempts: 0 -> 1 -> 2, then the cap converts the next error to failed
        handle_job("w-1", &ctx, id).await;
        let view = store::get_view(&ctx.db, id).await.unwrap().unwrap();
        assert_eq!(view.status, JobStatus::Pending);
        assert_eq!(view.attempts, 1);

        handle_job("w-1", &ctx, id).await;
        let view = store::get_view(&ctx.db, id).await.unwrap().unwrap();
        assert_eq!(view.status, JobStatus::Pending);
        assert_eq!(view.attempts, 2);

        handle_job("w-1", &ctx, id).await;
        let view = store::get_view(&ctx.db, id).await.unwrap().unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.attempts, 2);
        assert!(view.last_error.is_some());
    }

    #[tokio::test]
    async fn retried_id_goes_back_to_the_queue() {
        let (_dir, ctx) = context(1.0, 3).await;
        let id = Uuid::new_v4();
        store::insert(&ctx.db, id, "retry me", ctx.clock.now())
            .await
            .unwrap();

        handle_job("w-1", &ctx, id).await;

        assert_eq!(ctx.queue.take().await, Some(id));
    }

    #[tokio::test]
    async fn unclaimable_id_is_discarded() {
        let (_dir, ctx) = context(0.0, 3).await;
        let id = Uuid::new_v4();
        let t = ctx.clock.now();
        store::insert(&ctx.db, id, "x", t).await.unwrap();
        store::claim(&ctx.db, id, "w-9", t + chrono::Duration::seconds(30), t)
            .await
            .unwrap();

        handle_job("w-1", &ctx, id).await;

        // still owned by w-9, untouched
        let view = store::get_view(&ctx.db, id).await.unwrap().unwrap();
        assert_eq!(view.status, JobStatus::Started);
        assert_eq!(view.processing_by.as_deref(), Some("w-9"));
        assert_eq!(ctx.queue.depth(), 0);
    }

    #[tokio::test]
    async fn worker_loop_drains_queue_and_stops_on_shutdown() {
        let (_dir, ctx) = context(0.0, 3).await;
        let id = Uuid::new_v4();
        store::insert(&ctx.db, id, "hello", ctx.clock.now())
            .await
            .unwrap();
        ctx.queue.offer(id);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_worker("w-1".to_string(), ctx.clone(), rx));

        // wait for the job to complete
        for _ in 0..100 {
            let view = store::get_view(&ctx.db, id).await.unwrap().unwrap();
            if view.status == JobStatus::Done {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let view = store::get_view(&ctx.db, id).await.unwrap().unwrap();
        assert_eq!(view.status, JobStatus::Done);
        assert_eq!(view.result_chars, Some(5));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker should stop on shutdown")
            .unwrap();
    }
}
