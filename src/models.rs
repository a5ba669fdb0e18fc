//! Domain types shared across the repository, executor, predictor, and HTTP layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Uploading,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Uploading => "uploading",
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploading" => Ok(JobStatus::Uploading),
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropFrames {
    None,
    N2,
    N3,
    N4,
}

impl DropFrames {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropFrames::None => "none",
            DropFrames::N2 => "n2",
            DropFrames::N3 => "n3",
            DropFrames::N4 => "n4",
        }
    }

    /// The N in "keep every Nth frame", or None when frame dropping is off.
    pub fn stride(&self) -> Option<u32> {
        match self {
            DropFrames::None => None,
            DropFrames::N2 => Some(2),
            DropFrames::N3 => Some(3),
            DropFrames::N4 => Some(4),
        }
    }
}

impl std::str::FromStr for DropFrames {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(DropFrames::None),
            "n2" => Ok(DropFrames::N2),
            "n3" => Ok(DropFrames::N3),
            "n4" => Ok(DropFrames::N4),
            other => Err(format!("unknown drop_frames value: {other}")),
        }
    }
}

/// Frozen per-job compression parameters. Immutable after job creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionOptions {
    pub compression_level: u32,
    pub drop_frames: DropFrames,
    pub reduce_colors: bool,
    pub number_of_colors: u32,
    pub optimize_transparency: bool,
    pub undo_optimizations: bool,
    pub resize_enabled: bool,
    pub target_width: Option<u32>,
    pub target_height: Option<u32>,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            compression_level: 40,
            drop_frames: DropFrames::None,
            reduce_colors: false,
            number_of_colors: 256,
            optimize_transparency: true,
            undo_optimizations: false,
            resize_enabled: false,
            target_width: None,
            target_height: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue(pub String);

impl CompressionOptions {
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=200).contains(&self.compression_level) {
            return Err("compression_level must be in [1, 200]".to_string());
        }
        if self.reduce_colors && !(2..=256).contains(&self.number_of_colors) {
            return Err("number_of_colors must be in [2, 256]".to_string());
        }
        if self.resize_enabled && self.target_width.is_none() && self.target_height.is_none() {
            return Err("resize_enabled requires target_width and/or target_height".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub session_id: Option<String>,
    pub status: JobStatus,
    pub progress: i32,

    pub original_filename: String,
    pub original_size: i64,
    pub original_path: String,
    pub original_width: Option<i32>,
    pub original_height: Option<i32>,

    pub options: CompressionOptions,

    pub compressed_path: Option<String>,
    pub compressed_size: Option<i64>,
    pub compressed_width: Option<i32>,
    pub compressed_height: Option<i32>,
    pub reduction_percent: Option<f64>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Job {
    /// A job occupies a worker-pool slot iff it is queued or processing.
    pub fn is_in_pool(&self) -> bool {
        matches!(self.status, JobStatus::Queued | JobStatus::Processing)
    }
}

/// Probed information about a GIF: logical screen size, frame count, byte size.
#[derive(Debug, Clone, Copy, Default)]
pub struct GifInfo {
    pub width: u32,
    pub height: u32,
    pub frames: u32,
    pub size_bytes: u64,
}

/// Append-only (features, elapsed_ms) sample recorded for every completed job.
#[derive(Debug, Clone)]
pub struct PredictionSample {
    pub job_id: String,
    pub total_pixels: f64,
    pub target_pixels: f64,
    pub frames: f64,
    pub file_size_bytes: f64,
    pub target_width: f64,
    pub target_height: f64,
    pub number_of_colors: f64,
    pub compression_level: f64,
    pub reduce_colors: bool,
    pub optimize_transparency: bool,
    pub undo_optimizations: bool,
    pub drop_frames: DropFrames,
    pub actual_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// A coarse bucket's learned exponential-moving-average residual.
#[derive(Debug, Clone)]
pub struct ResidualEntry {
    pub key: String,
    pub ema: f64,
    pub count: i64,
    pub updated_at: DateTime<Utc>,
}

/// Filters accepted by `JobRepository::list`.
#[derive(Debug, Clone, Default)]
pub struct JobListFilter {
    pub status: Option<Vec<JobStatus>>,
    pub session_id: Option<String>,
    pub filename_contains: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobCounts {
    pub all: i64,
    pub uploading: i64,
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

/// A partial update applied to a job record. `Option<Option<T>>` distinguishes
/// "leave field alone" (`None`) from "clear the field" (`Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<i32>,
    pub original_path: Option<String>,
    pub original_width: Option<Option<i32>>,
    pub original_height: Option<Option<i32>>,
    pub compressed_path: Option<Option<String>>,
    pub compressed_size: Option<Option<i64>>,
    pub compressed_width: Option<Option<i32>>,
    pub compressed_height: Option<Option<i32>>,
    pub reduction_percent: Option<Option<f64>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub expires_at: Option<Option<DateTime<Utc>>>,
    pub error_message: Option<Option<String>>,
}
