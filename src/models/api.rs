use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Response body for POST /jobs.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub status: String,
}

/// Response body for GET /jobs/:job_id/status.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processing_by: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
}

/// Response body for GET /jobs/:job_id/result once the job is done.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobResultResponse {
    pub job_id: Uuid,
    pub status: String,
    pub characters: i64,
}

/// 202 body while a job is still in flight.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobPendingResponse {
    pub job_id: Uuid,
    pub status: String,
    pub detail: String,
}

/// 409 body for a permanently failed job.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobFailedResponse {
    pub job_id: Uuid,
    pub status: String,
    pub attempts: i64,
    pub error: String,
}

/// Full job view for GET /jobs/:job_id and GET /jobs.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobViewResponse {
    pub job_id: Uuid,
    pub status: String,
    pub result_chars: Option<i64>,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Generic error body for 4xx/5xx responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

impl ErrorResponse {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}
