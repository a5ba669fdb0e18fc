use std::collections::HashMap;

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{CompressionOptions, Job, JobPatch, JobStatus};
use crate::AppState;

#[derive(Serialize)]
pub struct UploadedJobRef {
    id: String,
    filename: String,
}

#[derive(Serialize)]
pub struct UploadErrorEntry {
    filename: String,
    error: String,
}

#[derive(Serialize)]
pub struct UploadResponse {
    jobs: Vec<UploadedJobRef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<UploadErrorEntry>,
}

pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>)> {
    let mut global_options = CompressionOptions::default();
    let mut per_file_options: HashMap<String, CompressionOptions> = HashMap::new();
    let mut files: Vec<(String, Vec<u8>)> = Vec::new();
    let mut session_id: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| AppError::Validation(e.to_string()))? {
        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "files" => {
                let filename = field.file_name().unwrap_or("upload.gif").to_string();
                let bytes = field.bytes().await.map_err(|e| AppError::Validation(e.to_string()))?;
                files.push((filename, bytes.to_vec()));
            }
            "options" => {
                let text = field.text().await.map_err(|e| AppError::Validation(e.to_string()))?;
                global_options = serde_json::from_str(&text)
                    .map_err(|e| AppError::Validation(format!("invalid options: {e}")))?;
            }
            "perFileOptions" => {
                let text = field.text().await.map_err(|e| AppError::Validation(e.to_string()))?;
                per_file_options = serde_json::from_str(&text)
                    .map_err(|e| AppError::Validation(format!("invalid perFileOptions: {e}")))?;
            }
            "sessionId" => {
                session_id = Some(field.text().await.map_err(|e| AppError::Validation(e.to_string()))?);
            }
            _ => {
                let _ = field.bytes().await;
            }
        }
    }

    if files.is_empty() {
        return Err(AppError::Validation("no files provided".to_string()));
    }

    let mut job_refs = Vec::new();
    let mut errors = Vec::new();

    for (filename, bytes) in files {
        match process_one(&state, &filename, bytes, &global_options, &per_file_options, session_id.as_deref()).await {
            Ok(job_ref) => job_refs.push(job_ref),
            Err(e) => errors.push(UploadErrorEntry { filename, error: e.to_string() }),
        }
    }

    if job_refs.is_empty() {
        return Ok((StatusCode::BAD_REQUEST, Json(UploadResponse { jobs: job_refs, errors })));
    }

    Ok((StatusCode::CREATED, Json(UploadResponse { jobs: job_refs, errors })))
}

async fn process_one(
    state: &AppState,
    filename: &str,
    bytes: Vec<u8>,
    global_options: &CompressionOptions,
    per_file_options: &HashMap<String, CompressionOptions>,
    session_id: Option<&str>,
) -> Result<UploadedJobRef> {
    if bytes.len() as u64 > state.config.max_upload_bytes {
        return Err(AppError::Validation(format!(
            "{filename} exceeds the maximum upload size of {} bytes",
            state.config.max_upload_bytes
        )));
    }
    if !is_animated_image(filename) {
        return Err(AppError::Validation(format!("{filename} is not an animated image")));
    }

    let options = per_file_options.get(filename).cloned().unwrap_or_else(|| global_options.clone());
    options.validate().map_err(AppError::Validation)?;

    let job_id = Uuid::new_v4().to_string();

    // The job record is visible as `uploading` for the duration of the artifact
    // write and probe, before it ever occupies a worker-pool slot as `queued`.
    let job = Job {
        id: job_id.clone(),
        session_id: session_id.map(|s| s.to_string()),
        status: JobStatus::Uploading,
        progress: 0,
        original_filename: filename.to_string(),
        original_size: bytes.len() as i64,
        original_path: String::new(),
        original_width: None,
        original_height: None,
        options,
        compressed_path: None,
        compressed_size: None,
        compressed_width: None,
        compressed_height: None,
        reduction_percent: None,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        expires_at: None,
        error_message: None,
    };
    state.repo.create(&job).await?;

    let original_path = state.artifacts.put_original(&job_id, filename, &bytes).await?;
    let info = state.executor.probe(&original_path).await;

    state
        .repo
        .update(
            &job_id,
            &JobPatch {
                status: Some(JobStatus::Queued),
                original_path: Some(original_path),
                original_width: Some(if info.width > 0 { Some(info.width as i32) } else { None }),
                original_height: Some(if info.height > 0 { Some(info.height as i32) } else { None }),
                ..Default::default()
            },
        )
        .await?;
    state.workers.submit(job_id.clone()).await;

    Ok(UploadedJobRef { id: job_id, filename: filename.to_string() })
}

fn is_animated_image(filename: &str) -> bool {
    let guess = mime_guess::from_path(filename).first();
    match guess {
        Some(mime) => mime.type_() == mime::IMAGE && filename.to_lowercase().ends_with(".gif"),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_gif_extension() {
        assert!(is_animated_image("cat.gif"));
        assert!(is_animated_image("CAT.GIF"));
    }

    #[test]
    fn rejects_non_gif_extension() {
        assert!(!is_animated_image("cat.png"));
        assert!(!is_animated_image("cat"));
    }
}
