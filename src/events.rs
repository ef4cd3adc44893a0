//! Notification bus for pipeline observability.
//!
//! Job state changes, stage transitions, and approval decisions publish
//! [`PipelineNotification`]s. Sinks fan the stream out in-process (tracing
//! log, in-memory capture for tests), and external consumers — the WebSocket
//! collaborator lives outside this crate — subscribe to a channel.
//!
//! ```text
//! queues / orchestrator / hitl
//!     │ bus.publish(...)
//!     ▼
//! NotificationBus
//!     ├── TracingSink        (server logs)
//!     ├── MemorySink         (tests)
//!     └── subscribe()        (flume receiver for push transports)
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// One observable pipeline event, scoped to a project.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PipelineNotification {
    pub event_type: String,
    pub project_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_key: Option<String>,
    pub details: Value,
    pub at: DateTime<Utc>,
}

impl PipelineNotification {
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        project_id: Uuid,
        stage_key: Option<String>,
        details: Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            project_id,
            stage_key,
            details,
            at: Utc::now(),
        }
    }
}

/// Abstraction over an output target consuming notifications.
pub trait NotificationSink: Send + Sync {
    fn handle(&self, notification: &PipelineNotification);

    /// Stable, human-friendly identifier for this sink instance.
    fn name(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// Sink that logs every notification through `tracing`.
#[derive(Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn handle(&self, notification: &PipelineNotification) {
        tracing::info!(
            event_type = %notification.event_type,
            project_id = %notification.project_id,
            stage_key = notification.stage_key.as_deref().unwrap_or(""),
            "pipeline event"
        );
    }
}

/// In-memory sink for testing and snapshots.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<PipelineNotification>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all captured notifications. Clones the buffer so callers
    /// can inspect state without holding the lock.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PipelineNotification> {
        self.entries.lock().clone()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl NotificationSink for MemorySink {
    fn handle(&self, notification: &PipelineNotification) {
        self.entries.lock().push(notification.clone());
    }
}

/// Central fan-out point. Cheap to clone; all clones share sinks and
/// subscribers.
#[derive(Clone)]
pub struct NotificationBus {
    sinks: Arc<Mutex<Vec<Box<dyn NotificationSink>>>>,
    subscribers: Arc<Mutex<Vec<flume::Sender<PipelineNotification>>>>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::with_sink(TracingSink)
    }
}

impl NotificationBus {
    #[must_use]
    pub fn with_sink<S: NotificationSink + 'static>(sink: S) -> Self {
        Self::with_sinks(vec![Box::new(sink)])
    }

    #[must_use]
    pub fn with_sinks(sinks: Vec<Box<dyn NotificationSink>>) -> Self {
        Self {
            sinks: Arc::new(Mutex::new(sinks)),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn add_sink<S: NotificationSink + 'static>(&self, sink: S) {
        self.sinks.lock().push(Box::new(sink));
    }

    /// Subscribe to the live stream. Disconnected receivers are pruned on the
    /// next publish.
    #[must_use]
    pub fn subscribe(&self) -> flume::Receiver<PipelineNotification> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, notification: PipelineNotification) {
        for sink in self.sinks.lock().iter() {
            sink.handle(&notification);
        }
        self.subscribers
            .lock()
            .retain(|tx| tx.send(notification.clone()).is_ok());
    }

    /// Convenience wrapper used by the queues and orchestrator.
    pub fn emit(
        &self,
        event_type: &str,
        project_id: Uuid,
        stage_key: Option<&str>,
        details: Value,
    ) {
        self.publish(PipelineNotification::new(
            event_type,
            project_id,
            stage_key.map(str::to_string),
            details,
        ));
    }
}
