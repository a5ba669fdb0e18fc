//! Bounded worker pool: admits jobs FIFO, runs at most `concurrency` of them
//! at once, and animates progress for the duration of each external-tool
//! invocation since the tool itself reports none.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};

use crate::db::JobRepository;
use crate::error::Result;
use crate::eventbus::{EventBus, JobStatusEvent, QueueStatusEvent};
use crate::models::{CompressionOptions, JobPatch, JobStatus};
use crate::{artifact::ArtifactStore, executor::CompressionExecutor, predictor::Predictor};

const MIN_TICK_MS: f64 = 50.0;
const MAX_TICK_MS: f64 = 3000.0;
const MIN_INCREMENT: f64 = 1.0;
const MAX_INCREMENT: f64 = 25.0;
const ANIMATOR_CAP: u32 = 99;

/// Displayed progress maps an internal 0..100 animator value into 25..99;
/// upload itself occupies 0..25, completion is a hard jump to 100.
fn displayed_progress(internal: u32) -> i32 {
    (25.0 + internal.min(ANIMATOR_CAP) as f64 * (74.0 / ANIMATOR_CAP as f64)).round() as i32
}

/// Larger total pixel counts tick more slowly (inverse-log pacing).
fn tick_interval_ms(total_pixels: f64, options: &CompressionOptions) -> u64 {
    let work_log = total_pixels.max(1.0).ln();
    let level_penalty = 1.0 + options.compression_level as f64 / 100.0;
    let mut multiplier = level_penalty;
    if options.optimize_transparency {
        multiplier *= 1.1;
    }
    if options.undo_optimizations {
        multiplier *= 1.2;
    }
    if options.reduce_colors {
        multiplier *= 1.1;
    }
    let base = 40.0 + work_log * 25.0;
    (base * multiplier).clamp(MIN_TICK_MS, MAX_TICK_MS) as u64
}

/// Larger total pixel counts tick with smaller increments.
fn tick_increment(total_pixels: f64) -> u32 {
    let work_log = total_pixels.max(1.0).ln();
    (400.0 / work_log.max(1.0)).clamp(MIN_INCREMENT, MAX_INCREMENT) as u32
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct WorkerStatus {
    pub concurrency: usize,
    pub active: usize,
    pub pending: usize,
}

struct Inner {
    repo: Arc<JobRepository>,
    artifacts: Arc<ArtifactStore>,
    executor: Arc<CompressionExecutor>,
    predictor: Arc<Predictor>,
    bus: Arc<EventBus>,
    max_concurrency: usize,
    concurrency: AtomicUsize,
    active: AtomicUsize,
    queue: Mutex<VecDeque<String>>,
    notify: Notify,
    retention: Option<Duration>,
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl WorkerPool {
    pub fn new(
        repo: Arc<JobRepository>,
        artifacts: Arc<ArtifactStore>,
        executor: Arc<CompressionExecutor>,
        predictor: Arc<Predictor>,
        bus: Arc<EventBus>,
        default_concurrency: usize,
        max_concurrency: usize,
        retention: Option<Duration>,
    ) -> Self {
        let inner = Arc::new(Inner {
            repo,
            artifacts,
            executor,
            predictor,
            bus,
            max_concurrency,
            concurrency: AtomicUsize::new(default_concurrency.clamp(1, max_concurrency)),
            active: AtomicUsize::new(0),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            retention,
        });

        let dispatcher = inner.clone();
        tokio::spawn(async move { dispatch_loop(dispatcher).await });

        Self { inner }
    }

    /// Enqueues a job id; returns once accepted, not once it starts running.
    pub async fn submit(&self, job_id: String) {
        self.inner.queue.lock().await.push_back(job_id);
        self.inner.notify.notify_one();
        self.publish_queue_status();
    }

    pub fn set_concurrency(&self, n: usize) -> usize {
        let clamped = n.clamp(1, self.inner.max_concurrency);
        self.inner.concurrency.store(clamped, Ordering::SeqCst);
        self.inner.notify.notify_one();
        self.publish_queue_status();
        clamped
    }

    pub async fn status(&self) -> WorkerStatus {
        WorkerStatus {
            concurrency: self.inner.concurrency.load(Ordering::SeqCst),
            active: self.inner.active.load(Ordering::SeqCst),
            pending: self.inner.queue.lock().await.len(),
        }
    }

    fn publish_queue_status(&self) {
        let concurrency = self.inner.concurrency.load(Ordering::SeqCst);
        let active = self.inner.active.load(Ordering::SeqCst);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let pending = inner.queue.lock().await.len();
            inner.bus.publish_queue_status(QueueStatusEvent { concurrency, active, pending });
        });
    }
}

async fn dispatch_loop(inner: Arc<Inner>) {
    loop {
        let concurrency = inner.concurrency.load(Ordering::SeqCst);
        let active = inner.active.load(Ordering::SeqCst);

        if active >= concurrency {
            inner.notify.notified().await;
            continue;
        }

        let job_id = {
            let mut queue = inner.queue.lock().await;
            queue.pop_front()
        };

        let Some(job_id) = job_id else {
            inner.notify.notified().await;
            continue;
        };

        inner.active.fetch_add(1, Ordering::SeqCst);
        publish_queue_status_now(&inner).await;

        let worker_inner = inner.clone();
        tokio::spawn(async move {
            if let Err(e) = run_job(&worker_inner, &job_id).await {
                error!(job_id = %job_id, error = %e, "job execution failed unexpectedly");
            }
            worker_inner.active.fetch_sub(1, Ordering::SeqCst);
            worker_inner.notify.notify_one();
            publish_queue_status_now(&worker_inner).await;
        });
    }
}

async fn publish_queue_status_now(inner: &Arc<Inner>) {
    let concurrency = inner.concurrency.load(Ordering::SeqCst);
    let active = inner.active.load(Ordering::SeqCst);
    let pending = inner.queue.lock().await.len();
    inner.bus.publish_queue_status(QueueStatusEvent { concurrency, active, pending });
}

async fn run_job(inner: &Arc<Inner>, job_id: &str) -> Result<()> {
    let Some(job) = inner.repo.get(job_id).await? else {
        warn!(job_id, "job vanished before dispatch");
        return Ok(());
    };

    let started_at = Utc::now();
    inner
        .repo
        .update(
            job_id,
            &JobPatch {
                status: Some(JobStatus::Processing),
                progress: Some(displayed_progress(0)),
                started_at: Some(Some(started_at)),
                ..Default::default()
            },
        )
        .await?;
    publish_job_event(inner, job_id, JobStatus::Processing, displayed_progress(0), None);

    let info = inner.executor.probe(&job.original_path).await;
    let estimate_ms = inner.predictor.predict(&info, &job.options, job.original_size as u64).await?;
    info!(job_id, estimate_ms, "starting compression");

    let total_pixels = info.frames as f64 * info.width as f64 * info.height as f64;
    let output_path = inner.artifacts.compressed_path(job_id);
    let output_path_str = output_path.to_string_lossy().into_owned();

    let compress_fut =
        inner.executor.compress(&job.original_path, &output_path_str, &job.options, &info);
    tokio::pin!(compress_fut);

    let mut internal: u32 = 0;
    let outcome = loop {
        let tick_ms = tick_interval_ms(total_pixels, &job.options);
        tokio::select! {
            biased;
            result = &mut compress_fut => break result,
            _ = tokio::time::sleep(Duration::from_millis(tick_ms)) => {
                internal = (internal + tick_increment(total_pixels)).min(ANIMATOR_CAP);
                let displayed = displayed_progress(internal);
                inner.repo.update(job_id, &JobPatch { progress: Some(displayed), ..Default::default() }).await?;
                publish_job_event(inner, job_id, JobStatus::Processing, displayed, None);
            }
        }
    };

    let actual_ms = (Utc::now() - started_at).num_milliseconds().max(0);

    match outcome {
        Ok(result) => {
            let reduction_percent = if job.original_size > 0 {
                round1(100.0 * (job.original_size - result.compressed_size) as f64 / job.original_size as f64)
            } else {
                0.0
            };
            let expires_at = inner.retention.map(|ttl| Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default());

            inner
                .repo
                .update(
                    job_id,
                    &JobPatch {
                        status: Some(JobStatus::Completed),
                        progress: Some(100),
                        compressed_path: Some(Some(result.compressed_path.clone())),
                        compressed_size: Some(Some(result.compressed_size)),
                        compressed_width: Some(Some(result.compressed_width)),
                        compressed_height: Some(Some(result.compressed_height)),
                        reduction_percent: Some(Some(reduction_percent)),
                        completed_at: Some(Some(Utc::now())),
                        expires_at: Some(expires_at),
                        ..Default::default()
                    },
                )
                .await?;

            publish_job_event_full(
                inner,
                job_id,
                JobStatus::Completed,
                100,
                Some(result.compressed_size),
                Some(result.compressed_width),
                Some(result.compressed_height),
                Some(reduction_percent),
                None,
            );

            inner
                .predictor
                .record_completion(job_id, &info, &job.options, job.original_size as u64, actual_ms)
                .await?;
        }
        Err(e) => {
            let message = e.to_string();
            inner
                .repo
                .update(
                    job_id,
                    &JobPatch {
                        status: Some(JobStatus::Failed),
                        progress: Some(0),
                        completed_at: Some(Some(Utc::now())),
                        error_message: Some(Some(message.clone())),
                        ..Default::default()
                    },
                )
                .await?;
            publish_job_event(inner, job_id, JobStatus::Failed, 0, Some(message));
        }
    }

    Ok(())
}

fn publish_job_event(inner: &Arc<Inner>, job_id: &str, status: JobStatus, progress: i32, error_message: Option<String>) {
    publish_job_event_full(inner, job_id, status, progress, None, None, None, None, error_message);
}

#[allow(clippy::too_many_arguments)]
fn publish_job_event_full(
    inner: &Arc<Inner>,
    job_id: &str,
    status: JobStatus,
    progress: i32,
    compressed_size: Option<i64>,
    compressed_width: Option<i32>,
    compressed_height: Option<i32>,
    reduction_percent: Option<f64>,
    error_message: Option<String>,
) {
    inner.bus.publish_job_status(JobStatusEvent {
        job_id: job_id.to_string(),
        status,
        progress,
        compressed_size,
        compressed_width,
        compressed_height,
        reduction_percent,
        error_message,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displayed_progress_maps_zero_to_twenty_five() {
        assert_eq!(displayed_progress(0), 25);
    }

    #[test]
    fn displayed_progress_caps_at_ninety_nine() {
        assert_eq!(displayed_progress(100), 99);
    }

    #[test]
    fn larger_work_ticks_slower_with_smaller_increments() {
        let opts = CompressionOptions::default();
        let small = tick_interval_ms(1_000.0, &opts);
        let large = tick_interval_ms(50_000_000.0, &opts);
        assert!(large > small);

        let small_inc = tick_increment(1_000.0);
        let large_inc = tick_increment(50_000_000.0);
        assert!(large_inc < small_inc);
    }

    #[test]
    fn round1_rounds_to_one_decimal_place() {
        assert_eq!(round1(33.333), 33.3);
        assert_eq!(round1(33.36), 33.4);
    }
}
