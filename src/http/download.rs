use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::Path;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Deserialize;
use zip::write::FileOptions;
use zip::ZipWriter;

use crate::error::{AppError, Result};
use crate::models::JobStatus;
use crate::AppState;

fn stem_and_ext(filename: &str) -> (String, String) {
    let path = Path::new(filename);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(filename).to_string();
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("gif").to_string();
    (stem, ext)
}

pub async fn download_compressed(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Response> {
    let job = state.repo.get(&id).await?.ok_or_else(|| AppError::NotFound { resource: format!("job {id}") })?;
    let Some(path) = &job.compressed_path else {
        return Err(AppError::NotFound { resource: format!("compressed artifact for job {id}") });
    };

    let bytes = state.artifacts.open(path).await?;
    let (stem, ext) = stem_and_ext(&job.original_filename);
    let filename = format!("{stem}-compressed.{ext}");

    Ok((
        [
            (header::CONTENT_TYPE, "image/gif".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"")),
        ],
        bytes,
    )
        .into_response())
}

pub async fn download_original(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Response> {
    let job = state.repo.get(&id).await?.ok_or_else(|| AppError::NotFound { resource: format!("job {id}") })?;
    let bytes = state.artifacts.open(&job.original_path).await?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/gif".to_string()),
            (header::CONTENT_DISPOSITION, format!("inline; filename=\"{}\"", job.original_filename)),
        ],
        bytes,
    )
        .into_response())
}

#[derive(Deserialize)]
pub struct ZipQuery {
    ids: String,
}

pub async fn download_zip(State(state): State<AppState>, Query(query): Query<ZipQuery>) -> Result<Response> {
    let ids: Vec<&str> = query.ids.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    if ids.is_empty() {
        return Err(AppError::Validation("ids query parameter is required".to_string()));
    }

    let mut buffer = Cursor::new(Vec::new());
    let mut writer = ZipWriter::new(&mut buffer);
    let options = FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .compression_level(Some(5));

    let mut name_counts: HashMap<String, i32> = HashMap::new();
    let mut entries_written = 0;

    for id in ids {
        let Some(job) = state.repo.get(id).await? else { continue };
        if job.status != JobStatus::Completed {
            continue;
        }
        let Some(path) = &job.compressed_path else { continue };
        let Ok(bytes) = state.artifacts.open(path).await else { continue };

        let (stem, ext) = stem_and_ext(&job.original_filename);
        let base_name = format!("{stem}-compressed.{ext}");
        let entry_name = disambiguate(&base_name, &mut name_counts);

        writer.start_file(entry_name, options).map_err(AppError::from)?;
        writer.write_all(&bytes).map_err(AppError::Io)?;
        entries_written += 1;
    }

    if entries_written == 0 {
        return Err(AppError::Validation("no completed jobs among the requested ids".to_string()));
    }

    writer.finish().map_err(AppError::from)?;
    let bytes = buffer.into_inner();

    let archive_name = format!("compressed-gifs-{}.zip", Utc::now().format("%Y-%m-%d"));

    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{archive_name}\"")),
        ],
        bytes,
    )
        .into_response())
}

/// First use of a base name passes through unchanged; subsequent collisions
/// get `-1`, `-2`, ... spliced before the extension.
fn disambiguate(base_name: &str, counts: &mut HashMap<String, i32>) -> String {
    let count = counts.entry(base_name.to_string()).or_insert(0);
    let name = if *count == 0 {
        base_name.to_string()
    } else {
        let (stem, ext) = stem_and_ext(base_name);
        format!("{stem}-{count}.{ext}")
    };
    *count += 1;
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disambiguate_leaves_first_occurrence_untouched() {
        let mut counts = HashMap::new();
        assert_eq!(disambiguate("x-compressed.gif", &mut counts), "x-compressed.gif");
    }

    #[test]
    fn disambiguate_suffixes_subsequent_collisions() {
        let mut counts = HashMap::new();
        assert_eq!(disambiguate("x-compressed.gif", &mut counts), "x-compressed.gif");
        assert_eq!(disambiguate("x-compressed.gif", &mut counts), "x-compressed-1.gif");
        assert_eq!(disambiguate("x-compressed.gif", &mut counts), "x-compressed-2.gif");
    }

    #[test]
    fn stem_and_ext_splits_correctly() {
        assert_eq!(stem_and_ext("cat.gif"), ("cat".to_string(), "gif".to_string()));
    }
}
