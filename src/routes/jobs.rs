use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::api::{
    CreateJobResponse, ErrorResponse, JobFailedResponse, JobPendingResponse, JobResultResponse,
    JobStatusResponse, JobViewResponse,
};
use crate::models::job::{JobOutcome, JobView};
use crate::services::jobs::SubmitError;

const DEFAULT_LIST_LIMIT: i64 = 20;
const MAX_LIST_LIMIT: i64 = 100;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn not_found() -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new("Job not found")),
    )
}

fn internal(detail: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new(format!("Internal error: {detail}"))),
    )
}

/// POST /jobs — upload a UTF-8 text file and enqueue a counting job.
pub async fn submit_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<CreateJobResponse>), ApiError> {
    let mut file_data: Option<Vec<u8>> = None;
    let limit = state.max_text_bytes;

    while let Some(mut field) = multipart.next_field().await.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(format!("Multipart error: {e}"))),
        )
    })? {
        if field.name() != Some("file") {
            continue;
        }

        // Stream the field so an oversized upload is rejected at the limit
        // instead of buffered whole.
        let mut data = Vec::new();
        loop {
            let chunk = field.chunk().await.map_err(|e| {
                (
                    StatusCode::BAD_REQUEST,
                    Json(ErrorResponse::new(format!("Failed to read file: {e}"))),
                )
            })?;
            let Some(chunk) = chunk else { break };
            if data.len() + chunk.len() > limit {
                return Err((
                    StatusCode::PAYLOAD_TOO_LARGE,
                    Json(ErrorResponse::new(format!(
                        "File too large (maximum {limit} bytes)"
                    ))),
                ));
            }
            data.extend_from_slice(&chunk);
        }
        file_data = Some(data);
    }

    let file_data = file_data.ok_or((
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse::new("Missing 'file' field in multipart upload")),
    ))?;

    let job_id = state.jobs.submit(&file_data).await.map_err(|e| match e {
        SubmitError::TooLarge { .. } => (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(ErrorResponse::new(e.to_string())),
        ),
        SubmitError::InvalidUtf8 => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(e.to_string())),
        ),
        SubmitError::Store(e) => internal(e),
    })?;

    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            job_id,
            status: "pending".to_string(),
        }),
    ))
}

/// GET /jobs/:job_id/status — lifecycle snapshot of a job.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let view = state
        .jobs
        .status_of(job_id)
        .await
        .map_err(internal)?
        .ok_or_else(not_found)?;

    Ok(Json(JobStatusResponse {
        job_id: view.id,
        status: view.status.as_str().to_string(),
        created_at: view.created_at,
        updated_at: view.updated_at,
        processing_by: view.processing_by,
        lease_until: view.lease_until,
    }))
}

/// GET /jobs/:job_id/result — 200 once done, 202 in flight, 409 failed.
pub async fn get_job_result(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let outcome = state
        .jobs
        .result_of(job_id)
        .await
        .map_err(internal)?
        .ok_or_else(not_found)?;

    let response = match outcome {
        JobOutcome::Done { characters } => (
            StatusCode::OK,
            Json(JobResultResponse {
                job_id,
                status: "done".to_string(),
                characters,
            }),
        )
            .into_response(),
        JobOutcome::InProgress { status } => (
            StatusCode::ACCEPTED,
            Json(JobPendingResponse {
                job_id,
                status: status.as_str().to_string(),
                detail: "Result not ready".to_string(),
            }),
        )
            .into_response(),
        JobOutcome::Failed { attempts, error } => (
            StatusCode::CONFLICT,
            Json(JobFailedResponse {
                job_id,
                status: "failed".to_string(),
                attempts,
                error,
            }),
        )
            .into_response(),
    };
    Ok(response)
}

fn view_response(view: JobView) -> JobViewResponse {
    JobViewResponse {
        job_id: view.id,
        status: view.status.as_str().to_string(),
        result_chars: view.result_chars,
        attempts: view.attempts,
        last_error: view.last_error,
        created_at: view.created_at,
        updated_at: view.updated_at,
    }
}

/// GET /jobs/:job_id — full job view.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobViewResponse>, ApiError> {
    let view = state
        .jobs
        .status_of(job_id)
        .await
        .map_err(internal)?
        .ok_or_else(not_found)?;

    Ok(Json(view_response(view)))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

/// GET /jobs — newest jobs first.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<JobViewResponse>>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let views = state.jobs.list_recent(limit).await.map_err(internal)?;
    Ok(Json(views.into_iter().map(view_response).collect()))
}
