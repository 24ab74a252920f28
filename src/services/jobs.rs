use std::sync::Arc;

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::store::{self, StoreError};
use crate::models::job::{JobOutcome, JobStatus, JobView};
use crate::services::queue::JobQueue;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("file too large (maximum {limit} bytes)")]
    TooLarge { limit: usize },

    #[error("file must be UTF-8 encoded text")]
    InvalidUtf8,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Core job operations used by the HTTP adapter.
///
/// Submission validates input, persists the row, and offers the id to the
/// queue; reads are store snapshots. Workers and the reaper talk to the
/// store directly.
pub struct JobService {
    db: SqlitePool,
    queue: Arc<JobQueue>,
    clock: Arc<dyn Clock>,
    max_text_bytes: usize,
}

impl JobService {
    pub fn new(
        db: SqlitePool,
        queue: Arc<JobQueue>,
        clock: Arc<dyn Clock>,
        max_text_bytes: usize,
    ) -> Self {
        Self {
            db,
            queue,
            clock,
            max_text_bytes,
        }
    }

    /// Validate and enqueue a new job. Invalid input is rejected before
    /// anything is stored; a store failure means the job never existed.
    pub async fn submit(&self, raw: &[u8]) -> Result<Uuid, SubmitError> {
        if raw.len() > self.max_text_bytes {
            return Err(SubmitError::TooLarge {
                limit: self.max_text_bytes,
            });
        }
        let text = std::str::from_utf8(raw).map_err(|_| SubmitError::InvalidUtf8)?;

        let id = Uuid::new_v4();
        let now = self.clock.now();
        store::insert(&self.db, id, text, now).await?;

        if !self.queue.offer(id) {
            // Row is pending in the store; the reaper's stale scan re-offers it.
            tracing::warn!(job_id = %id, "submitted job not enqueued, queue full");
        }

        metrics::counter!("jobs_submitted_total").increment(1);
        tracing::info!(job_id = %id, bytes = raw.len(), "enqueued job");
        Ok(id)
    }

    /// Snapshot of a job's user-visible attributes.
    pub async fn status_of(&self, id: Uuid) -> Result<Option<JobView>, StoreError> {
        store::get_view(&self.db, id).await
    }

    /// Client-facing outcome: done with a count, failed with attempts and
    /// error, or still in progress.
    pub async fn result_of(&self, id: Uuid) -> Result<Option<JobOutcome>, StoreError> {
        let Some(view) = store::get_view(&self.db, id).await? else {
            return Ok(None);
        };

        let outcome = match (view.status, view.result_chars) {
            (JobStatus::Done, Some(characters)) => JobOutcome::Done { characters },
            (JobStatus::Failed, _) => JobOutcome::Failed {
                attempts: view.attempts,
                error: view.last_error.unwrap_or_else(|| "unknown".to_string()),
            },
            (status, _) => JobOutcome::InProgress { status },
        };
        Ok(Some(outcome))
    }

    /// Newest-first job views.
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<JobView>, StoreError> {
        store::list_recent(&self.db, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::store::from_millis;
    use tempfile::TempDir;

    async fn service() -> (TempDir, JobService, SqlitePool) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}/jobs.db", dir.path().display());
        let pool = crate::db::init_pool(&url, 5).await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();

        let queue = Arc::new(JobQueue::new(16));
        let clock = Arc::new(ManualClock::new(from_millis(1_700_000_000_000)));
        let svc = JobService::new(pool.clone(), queue, clock, 64);
        (dir, svc, pool)
    }

    #[tokio::test]
    async fn submit_persists_and_enqueues() {
        let (_dir, svc, pool) = service().await;

        let id = svc.submit("hello".as_bytes()).await.unwrap();

        let view = store::get_view(&pool, id).await.unwrap().unwrap();
        assert_eq!(view.status, JobStatus::Pending);
        assert_eq!(store::fetch_text(&pool, id).await.unwrap().as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn submit_rejects_oversize_without_storing() {
        let (_dir, svc, pool) = service().await;

        let err = svc.submit(&[b'a'; 65]).await.unwrap_err();
        assert!(matches!(err, SubmitError::TooLarge { limit: 64 }));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn submit_rejects_invalid_utf8() {
        let (_dir, svc, _pool) = service().await;
        let err = svc.submit(&[0xff, 0xfe, 0x00]).await.unwrap_err();
        assert!(matches!(err, SubmitError::InvalidUtf8));
    }

    #[tokio::test]
    async fn result_of_maps_outcomes() {
        let (_dir, svc, pool) = service().await;

        assert!(svc.result_of(Uuid::new_v4()).await.unwrap().is_none());

        let id = svc.submit("abc".as_bytes()).await.unwrap();
        assert_eq!(
            svc.result_of(id).await.unwrap(),
            Some(JobOutcome::InProgress {
                status: JobStatus::Pending
            })
        );

        let t = from_millis(1_700_000_000_000);
        store::claim(&pool, id, "w-1", t + chrono::Duration::seconds(30), t)
            .await
            .unwrap();
        store::complete(&pool, id, 3, t).await.unwrap();
        assert_eq!(
            svc.result_of(id).await.unwrap(),
            Some(JobOutcome::Done { characters: 3 })
        );
    }
}
