use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{Job, JobCounts, JobListFilter, JobPatch, JobStatus};
use crate::AppState;

#[derive(Deserialize)]
pub struct ListQuery {
    status: Option<String>,
    filename: Option<String>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    session_id: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Serialize)]
pub struct ListResponse {
    jobs: Vec<Job>,
    total: i64,
    limit: i64,
    offset: i64,
}

pub async fn list(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Result<Json<ListResponse>> {
    let status = match query.status.as_deref() {
        None | Some("all") | Some("") => None,
        Some(raw) => {
            let mut statuses = Vec::new();
            for part in raw.split(',') {
                statuses.push(part.parse::<JobStatus>().map_err(AppError::Validation)?);
            }
            Some(statuses)
        }
    };

    let limit = query.limit.unwrap_or(20);
    let offset = query.offset.unwrap_or(0);

    let filter = JobListFilter {
        status,
        session_id: query.session_id,
        filename_contains: query.filename,
        start_date: query.start_date,
        end_date: query.end_date,
        limit,
        offset,
    };

    let (jobs, total) = state.repo.list(&filter).await?;
    Ok(Json(ListResponse { jobs, total, limit, offset }))
}

pub async fn counts(State(state): State<AppState>) -> Result<Json<JobCounts>> {
    Ok(Json(state.repo.counts().await?))
}

pub async fn get_one(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Job>> {
    state
        .repo
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound { resource: format!("job {id}") })
}

#[derive(Serialize)]
pub struct DeleteResponse {
    success: bool,
}

pub async fn delete_one(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<DeleteResponse>> {
    let Some(job) = state.repo.get(&id).await? else {
        return Err(AppError::NotFound { resource: format!("job {id}") });
    };

    state.artifacts.delete_job_artifacts(&job.original_path, job.compressed_path.as_deref()).await?;
    state.repo.delete(&id).await?;

    Ok(Json(DeleteResponse { success: true }))
}

pub async fn retry(State(state): State<AppState>, Path(id): Path<String>) -> Result<(StatusCode, Json<Job>)> {
    let Some(job) = state.repo.get(&id).await? else {
        return Err(AppError::NotFound { resource: format!("job {id}") });
    };

    if job.status != JobStatus::Failed {
        return Err(AppError::Validation("only failed jobs can be retried".to_string()));
    }

    let patch = JobPatch {
        status: Some(JobStatus::Queued),
        progress: Some(0),
        compressed_path: Some(None),
        compressed_size: Some(None),
        compressed_width: Some(None),
        compressed_height: Some(None),
        reduction_percent: Some(None),
        started_at: Some(None),
        completed_at: Some(None),
        expires_at: Some(None),
        error_message: Some(None),
    };
    state.repo.update(&id, &patch).await?;
    state.workers.submit(id.clone()).await;

    let refreshed = state
        .repo
        .get(&id)
        .await?
        .ok_or_else(|| AppError::NotFound { resource: format!("job {id}") })?;

    Ok((StatusCode::OK, Json(refreshed)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_patch_clears_lifecycle_fields_only() {
        let patch = JobPatch {
            status: Some(JobStatus::Queued),
            progress: Some(0),
            compressed_path: Some(None),
            compressed_size: Some(None),
            compressed_width: Some(None),
            compressed_height: Some(None),
            reduction_percent: Some(None),
            started_at: Some(None),
            completed_at: Some(None),
            expires_at: Some(None),
            error_message: Some(None),
        };
        assert_eq!(patch.status, Some(JobStatus::Queued));
        assert_eq!(patch.compressed_size, Some(None));
    }
}
