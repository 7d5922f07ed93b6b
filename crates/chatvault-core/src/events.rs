//! Server event types, envelope schema, and event bus for OCR progress fan-out.
//!
//! The queue engine publishes [`ServerEvent`]s through the [`ProgressSink`]
//! trait. [`EventBus`] wraps each one in an [`EventEnvelope`] addressed to an
//! audience role and broadcasts it; the WebSocket layer subscribes and forwards
//! envelopes to connected clients holding that role.
//!
//! Publishing never fails. With no subscribers the envelope is dropped, and a
//! slow subscriber sees `Lagged` instead of blocking the queue.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::traits::ProgressSink;
use crate::{OcrDocumentStatus, OcrJobCounts, OcrJobMode, OcrJobStatus};

// ============================================================================
// Event Envelope
// ============================================================================

/// Actor metadata for event attribution.
#[derive(Debug, Clone, Serialize)]
pub struct EventActor {
    /// Actor type: `"system"` or `"user"`.
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl EventActor {
    /// Background processing (poller, retries, stale recovery).
    pub fn system() -> Self {
        Self {
            kind: "system".to_string(),
            id: None,
        }
    }

    /// An operator acting through the job API.
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            kind: "user".to_string(),
            id: Some(id.into()),
        }
    }
}

/// Versioned event envelope.
///
/// `event_type` uses dot-namespaced names (e.g. `"ocr.job.progress"`).
/// Consumers should ignore unknown fields.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// Unique event identifier (UUIDv7 for temporal ordering).
    pub event_id: Uuid,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    /// Role allowed to receive this event.
    pub audience: String,
    pub actor: EventActor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub payload_version: u32,
    pub payload: ServerEvent,
}

impl EventEnvelope {
    /// Envelope with a system actor.
    pub fn new(audience: impl Into<String>, event: ServerEvent) -> Self {
        Self::with_actor(audience, event, EventActor::system())
    }

    pub fn with_actor(audience: impl Into<String>, event: ServerEvent, actor: EventActor) -> Self {
        Self {
            event_id: crate::uuid_utils::new_v7(),
            event_type: event.namespaced_event_type().to_string(),
            occurred_at: Utc::now(),
            audience: audience.into(),
            actor,
            entity_type: event.entity_type().map(String::from),
            entity_id: event.entity_id().map(|id| id.to_string()),
            payload_version: 1,
            payload: event,
        }
    }
}

// ============================================================================
// Server Event (domain payloads)
// ============================================================================

/// OCR queue events, serialized with a `type` tag field, e.g.
/// `{"type":"OcrJobProgress","job_id":"...","status":"running",...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// A job was created and its documents enqueued.
    OcrJobCreated {
        job_id: Uuid,
        mode: OcrJobMode,
        #[serde(skip_serializing_if = "Option::is_none")]
        group_id: Option<Uuid>,
        queued_count: i64,
    },
    /// Aggregates of a job were recomputed.
    OcrJobProgress {
        job_id: Uuid,
        status: OcrJobStatus,
        counts: OcrJobCounts,
    },
    /// A job was cancelled by an operator.
    OcrJobCancelled { job_id: Uuid, skipped: i64 },
    /// Failed documents of a job were requeued.
    OcrJobRetried { job_id: Uuid, retried: i64 },
    /// A document reached a new state.
    OcrDocumentUpdated {
        document_id: Uuid,
        media_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        job_id: Option<Uuid>,
        status: OcrDocumentStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ServerEvent {
    pub fn namespaced_event_type(&self) -> &'static str {
        match self {
            ServerEvent::OcrJobCreated { .. } => "ocr.job.created",
            ServerEvent::OcrJobProgress { .. } => "ocr.job.progress",
            ServerEvent::OcrJobCancelled { .. } => "ocr.job.cancelled",
            ServerEvent::OcrJobRetried { .. } => "ocr.job.retried",
            ServerEvent::OcrDocumentUpdated { .. } => "ocr.document.updated",
        }
    }

    pub fn entity_type(&self) -> Option<&'static str> {
        match self {
            ServerEvent::OcrDocumentUpdated { .. } => Some("ocr_document"),
            _ => Some("ocr_job"),
        }
    }

    pub fn entity_id(&self) -> Option<Uuid> {
        match self {
            ServerEvent::OcrJobCreated { job_id, .. }
            | ServerEvent::OcrJobProgress { job_id, .. }
            | ServerEvent::OcrJobCancelled { job_id, .. }
            | ServerEvent::OcrJobRetried { job_id, .. } => Some(*job_id),
            ServerEvent::OcrDocumentUpdated { document_id, .. } => Some(*document_id),
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Broadcast-based event bus distributing enveloped events to subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to `audience` with a system actor.
    pub fn emit(&self, audience: &str, event: ServerEvent) {
        self.send(EventEnvelope::new(audience, event));
    }

    /// Emit an event attributed to `actor`.
    pub fn emit_as(&self, audience: &str, event: ServerEvent, actor: EventActor) {
        self.send(EventEnvelope::with_actor(audience, event, actor));
    }

    fn send(&self, envelope: EventEnvelope) {
        let subscriber_count = self.tx.receiver_count();
        tracing::debug!(
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            audience = %envelope.audience,
            subscriber_count,
            "EventBus emit"
        );
        let _ = self.tx.send(envelope);
    }

    /// Subscribe to receive enveloped events.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl ProgressSink for EventBus {
    fn publish(&self, audience: &str, event: ServerEvent) {
        self.emit(audience, event);
    }

    fn publish_as(&self, audience: &str, event: ServerEvent, actor: EventActor) {
        self.emit_as(audience, event, actor);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(job_id: Uuid) -> ServerEvent {
        ServerEvent::OcrJobProgress {
            job_id,
            status: OcrJobStatus::Running,
            counts: OcrJobCounts {
                total: 3,
                queued: 1,
                processing: 1,
                succeeded: 1,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_event_bus_emit_subscribe() {
        let bus = EventBus::new(32);
        let mut rx = bus.subscribe();
        let job_id = Uuid::now_v7();

        bus.emit("admin", progress(job_id));

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event_type, "ocr.job.progress");
        assert_eq!(envelope.audience, "admin");
        assert_eq!(envelope.actor.kind, "system");
        assert_eq!(envelope.entity_type.as_deref(), Some("ocr_job"));
        assert_eq!(envelope.entity_id, Some(job_id.to_string()));
        assert_eq!(envelope.payload_version, 1);
    }

    #[tokio::test]
    async fn test_event_bus_multiple_subscribers() {
        let bus = EventBus::new(32);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(
            "admin",
            ServerEvent::OcrJobCancelled {
                job_id: Uuid::nil(),
                skipped: 4,
            },
        );

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert!(matches!(e1.payload, ServerEvent::OcrJobCancelled { skipped: 4, .. }));
        assert!(matches!(e2.payload, ServerEvent::OcrJobCancelled { .. }));
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        let sink: &dyn ProgressSink = &bus;
        sink.publish("admin", progress(Uuid::nil()));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_as_keeps_user_actor() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let sink: &dyn ProgressSink = &bus;

        sink.publish_as(
            "admin",
            ServerEvent::OcrJobRetried {
                job_id: Uuid::nil(),
                retried: 2,
            },
            EventActor::user("operator-1"),
        );

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.actor.kind, "user");
        assert_eq!(envelope.actor.id.as_deref(), Some("operator-1"));
        assert_eq!(envelope.event_type, "ocr.job.retried");
    }

    #[tokio::test]
    async fn test_lagged_receiver_does_not_block_emit() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for _ in 0..5 {
            bus.emit("admin", progress(Uuid::nil()));
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected Lagged, got {:?}", other.map(|e| e.event_type)),
        }
    }

    #[test]
    fn test_progress_event_json_shape() {
        let json = serde_json::to_value(progress(Uuid::nil())).unwrap();
        assert_eq!(json["type"], "OcrJobProgress");
        assert_eq!(json["status"], "running");
        assert_eq!(json["counts"]["total"], 3);
        assert_eq!(json["counts"]["succeeded"], 1);
    }

    #[test]
    fn test_document_event_omits_empty_fields() {
        let event = ServerEvent::OcrDocumentUpdated {
            document_id: Uuid::nil(),
            media_id: Uuid::nil(),
            job_id: None,
            status: OcrDocumentStatus::Skipped,
            error: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "skipped");
        assert!(json.get("job_id").is_none());
        assert!(json.get("error").is_none());
        assert_eq!(event.entity_type(), Some("ocr_document"));
        assert_eq!(event.namespaced_event_type(), "ocr.document.updated");
    }
}
