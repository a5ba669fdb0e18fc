//! Periodic sweep that deletes expired artifacts/job records, plus a
//! one-shot startup sweep that fails any job left `processing` by a
//! process that crashed or was restarted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::artifact::ArtifactStore;
use crate::db::JobRepository;
use crate::error::Result;
use crate::eventbus::{EventBus, JobStatusEvent};
use crate::models::{JobPatch, JobStatus};

pub struct Reaper {
    repo: Arc<JobRepository>,
    artifacts: Arc<ArtifactStore>,
    bus: Arc<EventBus>,
    interval: Duration,
}

impl Reaper {
    pub fn new(repo: Arc<JobRepository>, artifacts: Arc<ArtifactStore>, bus: Arc<EventBus>, interval: Duration) -> Self {
        Self { repo, artifacts, bus, interval }
    }

    /// Runs once immediately, converting any job stuck `processing` at boot
    /// into `failed` — no worker could possibly still be running it, since
    /// the process just started.
    pub async fn startup_sweep(&self) -> Result<()> {
        let stuck = self.repo.stuck_processing().await?;
        if !stuck.is_empty() {
            warn!(count = stuck.len(), "found jobs stuck processing at startup");
        }
        for job in stuck {
            self.repo
                .update(
                    &job.id,
                    &JobPatch {
                        status: Some(JobStatus::Failed),
                        progress: Some(0),
                        completed_at: Some(Some(Utc::now())),
                        error_message: Some(Some("interrupted".to_string())),
                        ..Default::default()
                    },
                )
                .await?;
            self.bus.publish_job_status(JobStatusEvent {
                job_id: job.id.clone(),
                status: JobStatus::Failed,
                progress: 0,
                compressed_size: None,
                compressed_width: None,
                compressed_height: None,
                reduction_percent: None,
                error_message: Some("interrupted".to_string()),
            });
        }

        self.sweep_expired().await
    }

    /// Spawns the recurring tick loop; returns its join handle so callers
    /// can hold onto it (or drop it, since it runs for the process lifetime).
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.tick().await; // first tick fires immediately; we already swept at startup
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_expired().await {
                    error!(error = %e, "reaper sweep failed, will retry next tick");
                }
            }
        })
    }

    async fn sweep_expired(&self) -> Result<()> {
        let expired = self.repo.expired(Utc::now()).await?;
        for job in expired {
            if let Err(e) = self.artifacts.delete(&job.original_path).await {
                warn!(job_id = %job.id, error = %e, "failed to delete expired original artifact");
            }
            if let Some(path) = &job.compressed_path {
                if let Err(e) = self.artifacts.delete(path).await {
                    warn!(job_id = %job.id, error = %e, "failed to delete expired compressed artifact");
                }
            }
            if self.repo.delete(&job.id).await? {
                info!(job_id = %job.id, "reaped expired job");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CompressionOptions, Job};

    fn sample_job(id: &str, status: JobStatus, expires_at: Option<chrono::DateTime<Utc>>) -> Job {
        Job {
            id: id.to_string(),
            session_id: None,
            status,
            progress: 0,
            original_filename: "a.gif".to_string(),
            original_size: 10,
            original_path: "/tmp/does-not-exist.gif".to_string(),
            original_width: None,
            original_height: None,
            options: CompressionOptions::default(),
            compressed_path: None,
            compressed_size: None,
            compressed_width: None,
            compressed_height: None,
            reduction_percent: None,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
            expires_at,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn startup_sweep_fails_stuck_processing_jobs() {
        let repo = Arc::new(JobRepository::in_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let artifacts = Arc::new(ArtifactStore::new(dir.path().join("up"), dir.path().join("out")).await.unwrap());
        let bus = Arc::new(EventBus::new());
        let reaper = Reaper::new(repo.clone(), artifacts, bus, Duration::from_secs(60));

        let job = sample_job("job-1", JobStatus::Processing, None);
        repo.create(&job).await.unwrap();

        reaper.startup_sweep().await.unwrap();

        let fetched = repo.get("job-1").await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Failed);
        assert_eq!(fetched.error_message.as_deref(), Some("interrupted"));
    }

    #[tokio::test]
    async fn sweep_expired_removes_job_record() {
        let repo = Arc::new(JobRepository::in_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let artifacts = Arc::new(ArtifactStore::new(dir.path().join("up"), dir.path().join("out")).await.unwrap());
        let bus = Arc::new(EventBus::new());
        let reaper = Reaper::new(repo.clone(), artifacts, bus, Duration::from_secs(60));

        let past = Utc::now() - chrono::Duration::seconds(5);
        let job = sample_job("job-2", JobStatus::Completed, Some(past));
        repo.create(&job).await.unwrap();

        reaper.startup_sweep().await.unwrap();

        assert!(repo.get("job-2").await.unwrap().is_none());
    }
}
