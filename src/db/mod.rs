//! The job repository: a single-writer embedded SQLite store fronting the
//! jobs table and the predictor's training/residual tables.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::info;

use crate::error::{AppError, Result};
use crate::models::{
    CompressionOptions, DropFrames, Job, JobCounts, JobListFilter, JobPatch, JobStatus,
    PredictionSample, ResidualEntry,
};

#[derive(Clone)]
pub struct JobRepository {
    pool: SqlitePool,
}

impl JobRepository {
    pub async fn connect(database_path: &str, max_connections: u32, migrate_on_start: bool) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(database_path).parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{database_path}"))
            .map_err(|e| AppError::Database(sqlx::Error::Configuration(e.into())))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let repo = Self { pool };
        if migrate_on_start {
            repo.migrate().await?;
        }
        info!("job repository ready at {}", database_path);
        Ok(repo)
    }

    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let repo = Self { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                session_id TEXT,
                status TEXT NOT NULL,
                progress INTEGER NOT NULL,
                original_filename TEXT NOT NULL,
                original_size INTEGER NOT NULL,
                original_path TEXT NOT NULL,
                original_width INTEGER,
                original_height INTEGER,
                options_json TEXT NOT NULL,
                compressed_path TEXT,
                compressed_size INTEGER,
                compressed_width INTEGER,
                compressed_height INTEGER,
                reduction_percent REAL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                expires_at TEXT,
                error_message TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_session_id ON jobs(session_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at DESC)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_expires_at ON jobs(expires_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS prediction_samples (
                job_id TEXT PRIMARY KEY,
                total_pixels REAL NOT NULL,
                target_pixels REAL NOT NULL,
                frames REAL NOT NULL,
                file_size_bytes REAL NOT NULL,
                target_width REAL NOT NULL,
                target_height REAL NOT NULL,
                number_of_colors REAL NOT NULL,
                compression_level REAL NOT NULL,
                reduce_colors INTEGER NOT NULL,
                optimize_transparency INTEGER NOT NULL,
                undo_optimizations INTEGER NOT NULL,
                drop_frames TEXT NOT NULL,
                actual_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS prediction_residuals (
                key TEXT PRIMARY KEY,
                ema REAL NOT NULL,
                count INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn create(&self, job: &Job) -> Result<()> {
        let options_json = serde_json::to_string(&job.options)
            .map_err(|e| AppError::Internal(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, session_id, status, progress, original_filename, original_size,
                original_path, original_width, original_height, options_json,
                compressed_path, compressed_size, compressed_width, compressed_height,
                reduction_percent, created_at, started_at, completed_at, expires_at, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.session_id)
        .bind(job.status.as_str())
        .bind(job.progress)
        .bind(&job.original_filename)
        .bind(job.original_size)
        .bind(&job.original_path)
        .bind(job.original_width)
        .bind(job.original_height)
        .bind(options_json)
        .bind(&job.compressed_path)
        .bind(job.compressed_size)
        .bind(job.compressed_width)
        .bind(job.compressed_height)
        .bind(job.reduction_percent)
        .bind(job.created_at.to_rfc3339())
        .bind(job.started_at.map(|t| t.to_rfc3339()))
        .bind(job.completed_at.map(|t| t.to_rfc3339()))
        .bind(job.expires_at.map(|t| t.to_rfc3339()))
        .bind(&job.error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_job(&r)).transpose()
    }

    pub async fn update(&self, id: &str, patch: &JobPatch) -> Result<()> {
        let Some(mut job) = self.get(id).await? else {
            return Ok(());
        };

        if let Some(status) = patch.status {
            job.status = status;
        }
        if let Some(progress) = patch.progress {
            job.progress = progress;
        }
        if let Some(ref v) = patch.original_path {
            job.original_path = v.clone();
        }
        if let Some(v) = patch.original_width {
            job.original_width = v;
        }
        if let Some(v) = patch.original_height {
            job.original_height = v;
        }
        if let Some(ref v) = patch.compressed_path {
            job.compressed_path = v.clone();
        }
        if let Some(v) = patch.compressed_size {
            job.compressed_size = v;
        }
        if let Some(v) = patch.compressed_width {
            job.compressed_width = v;
        }
        if let Some(v) = patch.compressed_height {
            job.compressed_height = v;
        }
        if let Some(v) = patch.reduction_percent {
            job.reduction_percent = v;
        }
        if let Some(v) = patch.started_at {
            job.started_at = v;
        }
        if let Some(v) = patch.completed_at {
            job.completed_at = v;
        }
        if let Some(v) = patch.expires_at {
            job.expires_at = v;
        }
        if let Some(ref v) = patch.error_message {
            job.error_message = v.clone();
        }

        sqlx::query(
            r#"
            UPDATE jobs SET
                status = ?, progress = ?, original_path = ?, original_width = ?, original_height = ?,
                compressed_path = ?, compressed_size = ?,
                compressed_width = ?, compressed_height = ?, reduction_percent = ?,
                started_at = ?, completed_at = ?, expires_at = ?, error_message = ?
            WHERE id = ?
            "#,
        )
        .bind(job.status.as_str())
        .bind(job.progress)
        .bind(&job.original_path)
        .bind(job.original_width)
        .bind(job.original_height)
        .bind(&job.compressed_path)
        .bind(job.compressed_size)
        .bind(job.compressed_width)
        .bind(job.compressed_height)
        .bind(job.reduction_percent)
        .bind(job.started_at.map(|t| t.to_rfc3339()))
        .bind(job.completed_at.map(|t| t.to_rfc3339()))
        .bind(job.expires_at.map(|t| t.to_rfc3339()))
        .bind(&job.error_message)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list(&self, filter: &JobListFilter) -> Result<(Vec<Job>, i64)> {
        // Built as a single dynamic query with optional predicates; parameters
        // are still bound positionally, never interpolated into the string.
        let mut where_clauses: Vec<String> = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        if let Some(statuses) = &filter.status {
            if !statuses.is_empty() {
                let placeholders = statuses.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
                where_clauses.push(format!("status IN ({placeholders})"));
                for s in statuses {
                    binds.push(s.as_str().to_string());
                }
            }
        }
        if let Some(session_id) = &filter.session_id {
            where_clauses.push("session_id = ?".to_string());
            binds.push(session_id.clone());
        }
        if let Some(filename) = &filter.filename_contains {
            where_clauses.push("original_filename LIKE ?".to_string());
            binds.push(format!("%{filename}%"));
        }
        if let Some(start) = &filter.start_date {
            where_clauses.push("created_at >= ?".to_string());
            binds.push(start.to_rfc3339());
        }
        if let Some(end) = &filter.end_date {
            where_clauses.push("created_at <= ?".to_string());
            binds.push(end.to_rfc3339());
        }

        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_clauses.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) as count FROM jobs {where_sql}");
        let mut count_query = sqlx::query(&count_sql);
        for b in &binds {
            count_query = count_query.bind(b);
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?.get("count");

        let limit = if filter.limit > 0 { filter.limit } else { 20 };
        let offset = filter.offset.max(0);

        let list_sql =
            format!("SELECT * FROM jobs {where_sql} ORDER BY created_at DESC LIMIT ? OFFSET ?");
        let mut list_query = sqlx::query(&list_sql);
        for b in &binds {
            list_query = list_query.bind(b);
        }
        list_query = list_query.bind(limit).bind(offset);

        let rows = list_query.fetch_all(&self.pool).await?;
        let jobs = rows.iter().map(row_to_job).collect::<Result<Vec<_>>>()?;

        Ok((jobs, total))
    }

    pub async fn counts(&self) -> Result<JobCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) as count FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = JobCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            counts.all += count;
            match status.as_str() {
                "uploading" => counts.uploading = count,
                "queued" => counts.queued = count,
                "processing" => counts.processing = count,
                "completed" => counts.completed = count,
                "failed" => counts.failed = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    pub async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE expires_at IS NOT NULL AND expires_at < ?")
            .bind(now.to_rfc3339())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    /// Jobs left in `processing` by a prior process that crashed or was killed.
    pub async fn stuck_processing(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE status = 'processing'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    pub async fn insert_sample(&self, sample: &PredictionSample) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO prediction_samples (
                job_id, total_pixels, target_pixels, frames, file_size_bytes,
                target_width, target_height, number_of_colors, compression_level,
                reduce_colors, optimize_transparency, undo_optimizations, drop_frames,
                actual_ms, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&sample.job_id)
        .bind(sample.total_pixels)
        .bind(sample.target_pixels)
        .bind(sample.frames)
        .bind(sample.file_size_bytes)
        .bind(sample.target_width)
        .bind(sample.target_height)
        .bind(sample.number_of_colors)
        .bind(sample.compression_level)
        .bind(sample.reduce_colors)
        .bind(sample.optimize_transparency)
        .bind(sample.undo_optimizations)
        .bind(sample.drop_frames.as_str())
        .bind(sample.actual_ms)
        .bind(sample.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_residual(&self, key: &str, ema: f64, count: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO prediction_residuals (key, ema, count, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET ema = excluded.ema, count = excluded.count, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(ema)
        .bind(count)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_residual(&self, key: &str) -> Result<Option<ResidualEntry>> {
        let row = sqlx::query("SELECT * FROM prediction_residuals WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_residual(&r)).transpose()
    }

    pub async fn all_residuals(&self) -> Result<Vec<ResidualEntry>> {
        let rows = sqlx::query("SELECT * FROM prediction_residuals")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_residual).collect()
    }

    pub async fn sample_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM prediction_samples")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("count"))
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Internal(format!("bad timestamp {raw}: {e}")))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(&s)).transpose()
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    let status_str: String = row.get("status");
    let status = JobStatus::from_str(&status_str).map_err(AppError::Internal)?;

    let options_json: String = row.get("options_json");
    let options: CompressionOptions =
        serde_json::from_str(&options_json).map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(Job {
        id: row.get("id"),
        session_id: row.get("session_id"),
        status,
        progress: row.get("progress"),
        original_filename: row.get("original_filename"),
        original_size: row.get("original_size"),
        original_path: row.get("original_path"),
        original_width: row.get("original_width"),
        original_height: row.get("original_height"),
        options,
        compressed_path: row.get("compressed_path"),
        compressed_size: row.get("compressed_size"),
        compressed_width: row.get("compressed_width"),
        compressed_height: row.get("compressed_height"),
        reduction_percent: row.get("reduction_percent"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        started_at: parse_opt_ts(row.get("started_at"))?,
        completed_at: parse_opt_ts(row.get("completed_at"))?,
        expires_at: parse_opt_ts(row.get("expires_at"))?,
        error_message: row.get("error_message"),
    })
}

fn row_to_residual(row: &sqlx::sqlite::SqliteRow) -> Result<ResidualEntry> {
    Ok(ResidualEntry {
        key: row.get("key"),
        ema: row.get("ema"),
        count: row.get("count"),
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CompressionOptions;
    use uuid::Uuid;

    fn sample_job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            session_id: Some("session-a".to_string()),
            status: JobStatus::Queued,
            progress: 0,
            original_filename: "a.gif".to_string(),
            original_size: 1000,
            original_path: "/tmp/a.gif".to_string(),
            original_width: Some(100),
            original_height: Some(100),
            options: CompressionOptions::default(),
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
        }
    }

    #[tokio::test]
    async fn create_get_roundtrip() {
        let repo = JobRepository::in_memory().await.unwrap();
        let job = sample_job(&Uuid::new_v4().to_string());
        repo.create(&job).await.unwrap();

        let fetched = repo.get(&job.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.options, job.options);
        assert_eq!(fetched.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn update_applies_patch_and_preserves_rest() {
        let repo = JobRepository::in_memory().await.unwrap();
        let job = sample_job(&Uuid::new_v4().to_string());
        repo.create(&job).await.unwrap();

        let patch = JobPatch {
            status: Some(JobStatus::Completed),
            progress: Some(100),
            compressed_size: Some(Some(500)),
            ..Default::default()
        };
        repo.update(&job.id, &patch).await.unwrap();

        let fetched = repo.get(&job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Completed);
        assert_eq!(fetched.progress, 100);
        assert_eq!(fetched.compressed_size, Some(500));
        assert_eq!(fetched.original_filename, "a.gif");
    }

    #[tokio::test]
    async fn update_can_fill_in_original_path_after_upload_completes() {
        let repo = JobRepository::in_memory().await.unwrap();
        let mut job = sample_job(&Uuid::new_v4().to_string());
        job.status = JobStatus::Uploading;
        job.original_path = String::new();
        job.original_width = None;
        job.original_height = None;
        repo.create(&job).await.unwrap();

        let patch = JobPatch {
            status: Some(JobStatus::Queued),
            original_path: Some("/data/uploads/abc.gif".to_string()),
            original_width: Some(Some(320)),
            original_height: Some(Some(240)),
            ..Default::default()
        };
        repo.update(&job.id, &patch).await.unwrap();

        let fetched = repo.get(&job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Queued);
        assert_eq!(fetched.original_path, "/data/uploads/abc.gif");
        assert_eq!(fetched.original_width, Some(320));
        assert_eq!(fetched.original_height, Some(240));
    }

    #[tokio::test]
    async fn list_filters_by_session_and_counts_match() {
        let repo = JobRepository::in_memory().await.unwrap();
        let a = sample_job(&Uuid::new_v4().to_string());
        let mut b = sample_job(&Uuid::new_v4().to_string());
        b.session_id = Some("session-b".to_string());
        repo.create(&a).await.unwrap();
        repo.create(&b).await.unwrap();

        let filter = JobListFilter {
            session_id: Some("session-a".to_string()),
            limit: 20,
            ..Default::default()
        };
        let (jobs, total) = repo.list(&filter).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, a.id);

        let (_, unfiltered_total) = repo.list(&JobListFilter { limit: 20, ..Default::default() }).await.unwrap();
        assert_eq!(unfiltered_total, 2);
    }

    #[tokio::test]
    async fn delete_removes_job() {
        let repo = JobRepository::in_memory().await.unwrap();
        let job = sample_job(&Uuid::new_v4().to_string());
        repo.create(&job).await.unwrap();

        assert!(repo.delete(&job.id).await.unwrap());
        assert!(repo.get(&job.id).await.unwrap().is_none());
        assert!(!repo.delete(&job.id).await.unwrap());
    }

    #[tokio::test]
    async fn residual_upsert_and_fetch() {
        let repo = JobRepository::in_memory().await.unwrap();
        repo.upsert_residual("drop_frames=n2", 0.1, 1).await.unwrap();
        repo.upsert_residual("drop_frames=n2", 0.25, 2).await.unwrap();

        let entry = repo.get_residual("drop_frames=n2").await.unwrap().unwrap();
        assert_eq!(entry.count, 2);
        assert!((entry.ema - 0.25).abs() < 1e-9);
    }
}
