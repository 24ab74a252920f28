use std::sync::Arc;

use sqlx::SqlitePool;

use crate::services::jobs::JobService;
use crate::services::queue::JobQueue;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub queue: Arc<JobQueue>,
    pub jobs: Arc<JobService>,
    pub max_text_bytes: usize,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        queue: Arc<JobQueue>,
        jobs: Arc<JobService>,
        max_text_bytes: usize,
    ) -> Self {
        Self {
            db,
            queue,
            jobs,
            max_text_bytes,
        }
    }
}
