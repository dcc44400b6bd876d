//! Best-effort side channels: progress notifications and the activity
//! ledger. Failures here are logged and swallowed; they never affect
//! the run's outcome.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use mx_core::ledger::ActivityLedger;
use mx_core::types::{ActivityRecord, AgentTask, NotificationEvent, NotificationType};

// ---------------------------------------------------------------------------
// Sink trait + implementations
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
#[error("notification sink error: {0}")]
pub struct SinkError(pub String);

/// Transport seam for progress events. Production deployments put a
/// message bus behind this; tests use a channel.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, subject: &str, event: &NotificationEvent) -> Result<(), SinkError>;
}

/// Sink that only logs. The default when no bus is configured.
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn publish(&self, subject: &str, event: &NotificationEvent) -> Result<(), SinkError> {
        debug!(
            subject,
            notification_type = event.notification_type.as_str(),
            message = %event.message,
            "notification"
        );
        Ok(())
    }
}

/// Sink delivering into a flume channel, for in-process consumers and
/// tests. A full or disconnected channel is a sink error.
pub struct ChannelSink {
    tx: flume::Sender<(String, NotificationEvent)>,
}

impl ChannelSink {
    pub fn new(tx: flume::Sender<(String, NotificationEvent)>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn publish(&self, subject: &str, event: &NotificationEvent) -> Result<(), SinkError> {
        self.tx
            .try_send((subject.to_string(), event.clone()))
            .map_err(|e| SinkError(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

const PUBLISH_ATTEMPTS: u32 = 2;

/// Publishes progress events on behalf of one workflow run.
///
/// Subjects follow `{prefix}.{company}.{project}.{task}.{type}` so
/// consumers can subscribe at any granularity. Publishing is retried
/// once, then the failure is logged and dropped.
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    subject_prefix: String,
    workflow_id: Uuid,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>, subject_prefix: impl Into<String>, workflow_id: Uuid) -> Self {
        Self {
            sink,
            subject_prefix: subject_prefix.into(),
            workflow_id,
        }
    }

    fn subject(&self, task: &AgentTask, notification_type: NotificationType) -> String {
        format!(
            "{}.{}.{}.{}.{}",
            self.subject_prefix,
            task.company_id,
            task.project_id,
            task.id,
            notification_type.as_str()
        )
    }

    /// Fire-and-forget publish. Never fails the caller.
    pub async fn publish(
        &self,
        task: &AgentTask,
        notification_type: NotificationType,
        message: impl Into<String>,
        details: serde_json::Value,
    ) {
        let event = NotificationEvent {
            workflow_id: self.workflow_id,
            company_id: task.company_id.clone(),
            project_id: task.project_id.clone(),
            task_id: task.id,
            notification_type,
            message: message.into(),
            details,
            timestamp: Utc::now(),
        };
        let subject = self.subject(task, notification_type);

        for attempt in 1..=PUBLISH_ATTEMPTS {
            match self.sink.publish(&subject, &event).await {
                Ok(()) => return,
                Err(e) if attempt < PUBLISH_ATTEMPTS => {
                    debug!(subject = %subject, error = %e, "publish failed, retrying");
                }
                Err(e) => {
                    warn!(subject = %subject, error = %e, "dropping notification");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Best-effort wrapper over the activity ledger. `None` disables
/// recording entirely.
pub struct Recorder {
    ledger: Option<Arc<ActivityLedger>>,
}

impl Recorder {
    pub fn new(ledger: Arc<ActivityLedger>) -> Self {
        Self {
            ledger: Some(ledger),
        }
    }

    pub fn disabled() -> Self {
        Self { ledger: None }
    }

    pub fn record(&self, record: ActivityRecord) {
        let Some(ledger) = &self.ledger else { return };
        if let Err(e) = ledger.append(&record) {
            warn!(
                task_id = %record.task_id,
                kind = record.kind.as_str(),
                error = %e,
                "failed to record activity"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
