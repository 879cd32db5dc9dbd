//! Audit sink on the `audit` tracing target

use uuid::Uuid;

use crate::core::AuditSink;

/// Writes audit entries as structured tracing events. Route the `audit`
/// target to its own layer to persist them separately.
#[derive(Debug, Default, Clone)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, actor: Uuid, action: &str, description: &str, metadata: serde_json::Value) {
        tracing::info!(
            target: "audit",
            actor = %actor,
            action,
            metadata = %metadata,
            "{}",
            description
        );
    }
}
