use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::job::{JobStatus, JobView};

/// Stored error messages are capped so a pathological payload cannot bloat
/// the row.
const MAX_ERROR_CHARS: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job already exists")]
    AlreadyExists,

    #[error("malformed row: {0}")]
    Malformed(String),

    #[error("database error: {0}")]
    Unavailable(#[from] sqlx::Error),
}

pub fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn id_text(id: Uuid) -> String {
    id.simple().to_string()
}

fn truncate_error(error: &str) -> String {
    error.chars().take(MAX_ERROR_CHARS).collect()
}

/// Insert a new pending job.
pub async fn insert(
    pool: &SqlitePool,
    id: Uuid,
    text: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO jobs (id, status, text, result_chars, attempts, last_error,
                          processing_by, lease_until, created_at, updated_at)
        VALUES (?1, 'pending', ?2, NULL, 0, NULL, NULL, NULL, ?3, ?3)
        "#,
    )
    .bind(id_text(id))
    .bind(text)
    .bind(to_millis(now))
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            Err(StoreError::AlreadyExists)
        }
        Err(e) => Err(e.into()),
    }
}

/// Atomically claim a pending job under a lease.
///
/// The predicate is evaluated inside the storage engine's own transaction, so
/// two workers racing on the same id see exactly one success. This is the
/// sole primitive that grants exclusive execution rights.
pub async fn claim(
    pool: &SqlitePool,
    id: Uuid,
    worker_label: &str,
    lease_until: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
           SET status = 'started', processing_by = ?1, lease_until = ?2, updated_at = ?3
         WHERE id = ?4
           AND status = 'pending'
           AND (lease_until IS NULL OR lease_until < ?3)
        "#,
    )
    .bind(worker_label)
    .bind(to_millis(lease_until))
    .bind(to_millis(now))
    .bind(id_text(id))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Advance a claimed job from started to processing.
pub async fn mark_processing(
    pool: &SqlitePool,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        "UPDATE jobs SET status = 'processing', updated_at = ?1 WHERE id = ?2 AND status = 'started'",
    )
    .bind(to_millis(now))
    .bind(id_text(id))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Push the lease deadline out without changing status.
pub async fn extend_lease(
    pool: &SqlitePool,
    id: Uuid,
    new_lease_until: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
           SET lease_until = ?1, updated_at = ?2
         WHERE id = ?3 AND status IN ('started', 'processing')
        "#,
    )
    .bind(to_millis(new_lease_until))
    .bind(to_millis(now))
    .bind(id_text(id))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Finalize a claimed job with its character count.
pub async fn complete(
    pool: &SqlitePool,
    id: Uuid,
    result_chars: i64,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
           SET status = 'done', result_chars = ?1,
               processing_by = NULL, lease_until = NULL, updated_at = ?2
         WHERE id = ?3 AND status IN ('started', 'processing')
        "#,
    )
    .bind(result_chars)
    .bind(to_millis(now))
    .bind(id_text(id))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Count a failed attempt and return the job to pending.
pub async fn record_retry(
    pool: &SqlitePool,
    id: Uuid,
    error: &str,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
           SET attempts = attempts + 1, last_error = ?1, status = 'pending',
               processing_by = NULL, lease_until = NULL, updated_at = ?2
         WHERE id = ?3 AND status NOT IN ('done', 'failed')
        "#,
    )
    .bind(truncate_error(error))
    .bind(to_millis(now))
    .bind(id_text(id))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Mark a job permanently failed. `attempts` is not touched: the retry that
/// hit the cap already counted this execution.
pub async fn record_failed(
    pool: &SqlitePool,
    id: Uuid,
    error: &str,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
           SET status = 'failed', last_error = ?1,
               processing_by = NULL, lease_until = NULL, updated_at = ?2
         WHERE id = ?3 AND status NOT IN ('done', 'failed')
        "#,
    )
    .bind(truncate_error(error))
    .bind(to_millis(now))
    .bind(id_text(id))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Read a job's payload text.
pub async fn fetch_text(pool: &SqlitePool, id: Uuid) -> Result<Option<String>, StoreError> {
    let row = sqlx::query("SELECT text FROM jobs WHERE id = ?1")
        .bind(id_text(id))
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|r| r.get::<String, _>("text")))
}

/// Read the current attempts counter.
pub async fn get_attempts(pool: &SqlitePool, id: Uuid) -> Result<Option<i64>, StoreError> {
    let row = sqlx::query("SELECT attempts FROM jobs WHERE id = ?1")
        .bind(id_text(id))
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|r| r.get::<i64, _>("attempts")))
}

fn view_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<JobView, StoreError> {
    let id_str: String = row.get("id");
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| StoreError::Malformed(format!("bad job id {id_str}: {e}")))?;

    Ok(JobView {
        id,
        status: JobStatus::parse(row.get::<String, _>("status").as_str()),
        result_chars: row.get("result_chars"),
        attempts: row.get("attempts"),
        last_error: row.get("last_error"),
        processing_by: row.get("processing_by"),
        lease_until: row.get::<Option<i64>, _>("lease_until").map(from_millis),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    })
}

/// Read-only snapshot of all user-visible attributes.
pub async fn get_view(pool: &SqlitePool, id: Uuid) -> Result<Option<JobView>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT id, status, result_chars, attempts, last_error,
               processing_by, lease_until, created_at, updated_at
          FROM jobs
         WHERE id = ?1
        "#,
    )
    .bind(id_text(id))
    .fetch_optional(pool)
    .await?;

    row.map(|r| view_from_row(&r)).transpose()
}

/// Newest-first job views for the list endpoint.
pub async fn list_recent(pool: &SqlitePool, limit: i64) -> Result<Vec<JobView>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT id, status, result_chars, attempts, last_error,
               processing_by, lease_until, created_at, updated_at
          FROM jobs
         ORDER BY created_at DESC
         LIMIT ?1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(view_from_row).collect()
}

fn ids_from_rows(rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<Uuid>, StoreError> {
    rows.into_iter()
        .map(|r| {
            let id_str: String = r.get("id");
            Uuid::parse_str(&id_str)
                .map_err(|e| StoreError::Malformed(format!("bad job id {id_str}: {e}")))
        })
        .collect()
}

/// Ids of in-flight jobs whose lease has expired, oldest lease first.
pub async fn scan_expired_leases(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Uuid>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT id FROM jobs
         WHERE status IN ('started', 'processing')
           AND lease_until IS NOT NULL
           AND lease_until < ?1
         ORDER BY lease_until ASC
         LIMIT ?2
        "#,
    )
    .bind(to_millis(now))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    ids_from_rows(rows)
}

/// Return an expired in-flight job to pending, if it is still expired.
pub async fn reset_expired(
    pool: &SqlitePool,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
           SET status = 'pending', processing_by = NULL, lease_until = NULL, updated_at = ?1
         WHERE id = ?2
           AND status IN ('started', 'processing')
           AND lease_until IS NOT NULL
           AND lease_until < ?1
        "#,
    )
    .bind(to_millis(now))
    .bind(id_text(id))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Boot-time recovery: in-flight rows whose lease is missing or already
/// expired were abandoned by a previous process; return them to pending.
/// Rows with a still-live lease are left for the reaper.
pub async fn recover_startup(pool: &SqlitePool, now: DateTime<Utc>) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
           SET status = 'pending', processing_by = NULL, lease_until = NULL, updated_at = ?1
         WHERE status IN ('started', 'processing')
           AND (lease_until IS NULL OR lease_until < ?1)
        "#,
    )
    .bind(to_millis(now))
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Pending ids in submission order, used to rebuild the queue hint at boot.
pub async fn list_pending_ids(pool: &SqlitePool, limit: i64) -> Result<Vec<Uuid>, StoreError> {
    let rows = sqlx::query(
        "SELECT id FROM jobs WHERE status = 'pending' ORDER BY created_at ASC LIMIT ?1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    ids_from_rows(rows)
}

/// Pending ids that have not moved in a while — they may have fallen out of
/// the in-memory queue (dropped offer, restart). Re-offering a duplicate is
/// harmless: Claim is the sole grant of execution rights.
pub async fn scan_stale_pending(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Uuid>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT id FROM jobs
         WHERE status = 'pending' AND updated_at < ?1
         ORDER BY updated_at ASC
         LIMIT ?2
        "#,
    )
    .bind(to_millis(cutoff))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    ids_from_rows(rows)
}
