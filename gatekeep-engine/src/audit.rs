//! Audit sink implementations
//!
//! Recording is best-effort by contract: no sink here can fail the caller,
//! and the decision path never reads events back.

use async_trait::async_trait;
use gatekeep_core::{AuditEvent, AuditSink};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Audit sink that emits events to the tracing log stream
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) {
        info!(
            target: "audit",
            event_id = %event.id,
            actor = event.actor.as_deref().unwrap_or("anonymous"),
            action = %event.action,
            resource = event.resource_id.as_deref().unwrap_or("-"),
            permission = event.permission.as_deref().unwrap_or("-"),
            tenant = event.tenant_id.as_deref().unwrap_or("-"),
            outcome = %event.outcome,
            reason = event.reason.as_deref().unwrap_or("-"),
            "audit event"
        );
    }
}

/// In-memory audit sink that captures events for inspection in tests
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditSink {
    events: Arc<RwLock<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }

    pub async fn clear(&self) {
        self.events.write().await.clear();
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) {
        self.events.write().await.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatekeep_core::AuditOutcome;

    #[tokio::test]
    async fn memory_sink_captures_events() {
        let sink = MemoryAuditSink::new();
        sink.record(AuditEvent::decision(
            Some("alice"),
            "check_permission",
            "doc-1",
            "read",
            "t1",
            true,
            "owner",
        ))
        .await;

        let events = sink.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, AuditOutcome::Allowed);
        assert_eq!(events[0].actor.as_deref(), Some("alice"));
    }
}
