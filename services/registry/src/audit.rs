//! Audit events for mutating requests.
//!
//! Sinks are best-effort: a sink failure is logged and never fails the
//! request which produced the event.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::access::Actor;

/// The push step an audit event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Image metadata stored
    PutImageJson,
    /// Image layer stored
    PutImageLayer,
    /// Image checksum verified
    PutImageChecksum,
    /// Repository created or updated
    PutRepository,
    /// Tag set
    PutTag,
    /// Repository push finalized
    PutRepositoryImages,
}

impl AuditAction {
    /// The snake_case name of the action.
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::PutImageJson => "put_image_json",
            AuditAction::PutImageLayer => "put_image_layer",
            AuditAction::PutImageChecksum => "put_image_checksum",
            AuditAction::PutRepository => "put_repository",
            AuditAction::PutTag => "put_tag",
            AuditAction::PutRepositoryImages => "put_repository_images",
        }
    }
}

/// One audited mutation.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Unique event id
    pub id: Uuid,
    /// What was done
    pub action: AuditAction,
    /// Who did it
    pub actor: String,
    /// The image id, `namespace/name`, or `namespace/name:tag` acted on
    pub entity: String,
    /// Request headers, serialized as a JSON object
    pub headers: String,
    /// When the mutation completed
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    /// Create an event stamped with a fresh id and the current time.
    pub fn new(
        action: AuditAction,
        actor: &Actor,
        entity: impl Into<String>,
        headers: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            actor: actor.name().to_string(),
            entity: entity.into(),
            headers: headers.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Error returned by an audit sink.
#[derive(Debug, thiserror::Error)]
#[error("audit sink {sink} failed: {message}")]
pub struct AuditError {
    sink: &'static str,
    message: String,
}

impl AuditError {
    /// Create an error for the named sink.
    pub fn new(sink: &'static str, message: impl Into<String>) -> Self {
        Self {
            sink,
            message: message.into(),
        }
    }
}

/// Receives audit events.
///
/// The registry awaits `record` before answering the request, so an event is
/// stored by the time its mutation is acknowledged. Errors are logged and
/// never fail the mutation. A sink backed by slow I/O should hand events to
/// its own queue and return.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist one event.
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// Emits each event as a `tracing` event on the `audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait::async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        tracing::info!(
            target: "audit",
            id = %event.id,
            action = event.action.as_str(),
            actor = %event.actor,
            entity = %event.entity,
            headers = %event.headers,
            timestamp = %event.timestamp,
            "audit"
        );
        Ok(())
    }
}

/// Keeps events in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<parking_lot::Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of every event recorded so far.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}

#[async_trait::async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.events.lock().push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_sink_keeps_events() {
        let sink = MemoryAuditSink::new();
        let shared: Arc<dyn AuditSink> = Arc::new(sink.clone());

        shared
            .record(AuditEvent::new(
                AuditAction::PutTag,
                &Actor::new("ci"),
                "library/busybox:latest",
                "{}",
            ))
            .await
            .unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].actor, "ci");
        assert_eq!(events[0].action.as_str(), "put_tag");
        assert_eq!(
            serde_json::to_value(events[0].action).unwrap(),
            serde_json::json!("put_tag")
        );
    }
}
