//! Job lifecycle events and the forwarder that delivers them.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::ids::{EventId, JobId, TaskId};

use super::finding::Finding;
use super::job::JobStatus;

/// Metadata envelope attached to every lifecycle event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    /// Envelope schema version.
    pub version: u16,
    /// Unique per event.
    pub event_id: EventId,
    /// Job the event belongs to.
    pub job_id: JobId,
    /// Emission time.
    pub emitted_at: DateTime<Utc>,
}

impl EventMeta {
    /// Fresh envelope for `job_id`, stamped now.
    pub fn new(job_id: JobId) -> Self {
        Self {
            version: 1,
            event_id: EventId::new(),
            job_id,
            emitted_at: Utc::now(),
        }
    }
}

/// Lifecycle notification payloads.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanEventPayload {
    /// Tasks were queued.
    Started {
        /// Target as requested.
        target_ref: String,
        /// Scanners the job runs.
        scanners: Vec<String>,
        /// Task count.
        total_tasks: usize,
    },
    /// A task settled.
    Progress {
        /// Percent of tasks finished.
        progress: u8,
        /// Human-readable stage.
        stage: String,
        /// Tasks finished so far.
        finished_tasks: usize,
        /// Task count.
        total_tasks: usize,
    },
    /// One finding of a settled task.
    FindingFound {
        /// Task that produced it.
        task_id: TaskId,
        /// The finding.
        finding: Finding,
    },
    /// Every task settled.
    Completed {
        /// Findings across all tasks.
        findings_count: usize,
        /// Tasks that ended `Failed`.
        failed_tasks: usize,
    },
    /// The job could not run.
    Failed {
        /// Job-level error message.
        error: String,
    },
    /// The job was cancelled.
    Cancelled {
        /// Status at the time of cancellation.
        previous_status: JobStatus,
    },
}

/// A payload in its envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanEvent {
    /// Envelope.
    pub meta: EventMeta,
    /// What happened.
    pub payload: ScanEventPayload,
}

impl ScanEvent {
    /// Wraps `payload` in a fresh envelope.
    pub fn new(job_id: JobId, payload: ScanEventPayload) -> Self {
        Self {
            meta: EventMeta::new(job_id),
            payload,
        }
    }

    /// The payload's serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self.payload {
            ScanEventPayload::Started { .. } => "started",
            ScanEventPayload::Progress { .. } => "progress",
            ScanEventPayload::FindingFound { .. } => "finding_found",
            ScanEventPayload::Completed { .. } => "completed",
            ScanEventPayload::Failed { .. } => "failed",
            ScanEventPayload::Cancelled { .. } => "cancelled",
        }
    }
}

/// Destination for lifecycle events (message broker, websocket fan-out, ...).
///
/// Delivery is at-most-once; errors are logged by the caller and dropped.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivers one event.
    async fn publish(&self, event: ScanEvent) -> Result<()>;
}

/// Non-blocking front of an [`EventSink`].
///
/// `emit` only pushes onto an unbounded channel; a dedicated task forwards
/// events to the sink in emission order.
#[derive(Clone)]
pub struct EventForwarder {
    tx: mpsc::UnboundedSender<ScanEvent>,
}

impl fmt::Debug for EventForwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventForwarder")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl EventForwarder {
    /// Starts the forwarding task. On `shutdown` it drains what is queued
    /// and exits.
    pub fn spawn(
        sink: Arc<dyn EventSink>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<ScanEvent>();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    maybe = rx.recv() => match maybe {
                        Some(event) => forward(sink.as_ref(), event).await,
                        None => break,
                    },
                    _ = shutdown.cancelled() => {
                        while let Ok(event) = rx.try_recv() {
                            forward(sink.as_ref(), event).await;
                        }
                        break;
                    }
                }
            }
            tracing::debug!("event forwarder stopped");
        });
        (Self { tx }, handle)
    }

    /// Queues `event`; never blocks.
    pub fn emit(&self, event: ScanEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event dropped; forwarder already stopped");
        }
    }
}

async fn forward(sink: &dyn EventSink, event: ScanEvent) {
    let job_id = event.meta.job_id;
    let kind = event.kind();
    if let Err(err) = sink.publish(event).await {
        tracing::warn!(job = %job_id, kind, error = %err, "event sink rejected event");
    }
}
