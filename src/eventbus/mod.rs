//! In-process pub/sub fan-out for job and queue status events.
//!
//! Two channel shapes: one `broadcast` channel per job id (`job-status/<id>`)
//! and one shared channel for queue-wide status (`queue-status`). There is
//! no replay buffer — subscribers only see events published after they
//! subscribe; clients reconcile by polling REST on (re)connect.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::JobStatus;

const JOB_CHANNEL_CAPACITY: usize = 64;
const QUEUE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusEvent {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed_width: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed_height: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduction_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl JobStatusEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueStatusEvent {
    pub concurrency: usize,
    pub active: usize,
    pub pending: usize,
}

/// Every event the bus can emit, tagged so a single WebSocket fan-out can
/// multiplex both shapes to every connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BusEvent {
    #[serde(rename = "JOB_STATUS_UPDATE")]
    JobStatus { #[serde(rename = "jobId")] job_id: String, data: JobStatusEvent },
    #[serde(rename = "QUEUE_UPDATE")]
    QueueStatus { data: QueueStatusEvent },
}

pub struct EventBus {
    job_channels: DashMap<String, broadcast::Sender<JobStatusEvent>>,
    queue_tx: broadcast::Sender<QueueStatusEvent>,
    /// Fan-out used by WebSocket handlers to receive every event, of either shape.
    global_tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (queue_tx, _) = broadcast::channel(QUEUE_CHANNEL_CAPACITY);
        let (global_tx, _) = broadcast::channel(JOB_CHANNEL_CAPACITY * 4);
        Self { job_channels: DashMap::new(), queue_tx, global_tx }
    }

    pub fn subscribe_job(&self, job_id: &str) -> broadcast::Receiver<JobStatusEvent> {
        self.job_channels
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(JOB_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_queue(&self) -> broadcast::Receiver<QueueStatusEvent> {
        self.queue_tx.subscribe()
    }

    /// Subscribes to every event published on the bus, job or queue shaped —
    /// what WebSocket connections use, since clients filter by jobId themselves.
    pub fn subscribe_all(&self) -> broadcast::Receiver<BusEvent> {
        self.global_tx.subscribe()
    }

    /// Publish never blocks the caller on a slow subscriber: `broadcast`
    /// drops the oldest buffered message for a lagging receiver rather than
    /// waiting, and terminal events are still delivered because the sender
    /// holds the message until every receiver with room has taken it.
    pub fn publish_job_status(&self, event: JobStatusEvent) {
        let sender = self
            .job_channels
            .entry(event.job_id.clone())
            .or_insert_with(|| broadcast::channel(JOB_CHANNEL_CAPACITY).0)
            .clone();

        let terminal = event.is_terminal();
        debug!(job_id = %event.job_id, status = ?event.status, terminal, "publishing job status");

        // A send error just means no one is currently subscribed; that's fine,
        // REST polling is the source of truth for reconnecting clients.
        let _ = sender.send(event.clone());
        let _ = self.global_tx.send(BusEvent::JobStatus { job_id: event.job_id.clone(), data: event });

        if terminal {
            // Drop the per-job channel once its terminal event has gone out;
            // a fresh subscribe (e.g. a retry) gets a brand new channel.
            self.job_channels.remove(&event.job_id.clone());
        }
    }

    pub fn publish_queue_status(&self, event: QueueStatusEvent) {
        let _ = self.queue_tx.send(event);
        let _ = self.global_tx.send(BusEvent::QueueStatus { data: event });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn job_subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_job("job-1");

        bus.publish_job_status(JobStatusEvent {
            job_id: "job-1".to_string(),
            status: JobStatus::Processing,
            progress: 50,
            compressed_size: None,
            compressed_width: None,
            compressed_height: None,
            reduction_percent: None,
            error_message: None,
        });

        let received = rx.recv().await.unwrap();
        assert_eq!(received.progress, 50);
    }

    #[tokio::test]
    async fn queue_subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_queue();
        bus.publish_queue_status(QueueStatusEvent { concurrency: 2, active: 1, pending: 3 });
        let received = rx.recv().await.unwrap();
        assert_eq!(received.active, 1);
    }

    #[tokio::test]
    async fn global_subscriber_sees_both_shapes() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_all();

        bus.publish_queue_status(QueueStatusEvent { concurrency: 2, active: 0, pending: 0 });
        bus.publish_job_status(JobStatusEvent {
            job_id: "job-2".to_string(),
            status: JobStatus::Completed,
            progress: 100,
            compressed_size: Some(500),
            compressed_width: Some(10),
            compressed_height: Some(10),
            reduction_percent: Some(50.0),
            error_message: None,
        });

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, BusEvent::QueueStatus { .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, BusEvent::JobStatus { .. }));
    }

    #[tokio::test]
    async fn subscribing_without_prior_publisher_still_works() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_job("fresh-job");
        bus.publish_job_status(JobStatusEvent {
            job_id: "fresh-job".to_string(),
            status: JobStatus::Failed,
            progress: 0,
            compressed_size: None,
            compressed_width: None,
            compressed_height: None,
            reduction_percent: None,
            error_message: Some("boom".to_string()),
        });
        let received = rx.recv().await.unwrap();
        assert_eq!(received.error_message.as_deref(), Some("boom"));
    }
}
