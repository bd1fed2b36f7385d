//! Audit trail for backup activity.

use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::errors::Result;
use crate::models::Actor;

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub action: String,
    pub actor: Option<Actor>,
    pub details: serde_json::Value,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<()>;
}

/// Writes the entry on a detached task. A failure is logged and never reaches the caller.
pub fn spawn_audit(sink: Arc<dyn AuditSink>, entry: AuditEntry) -> JoinHandle<()> {
    tokio::spawn(async move {
        let action = entry.action.clone();
        if let Err(e) = sink.record(entry).await {
            warn!("Failed to write audit entry '{}': {}", action, e);
        }
    })
}

#[derive(Clone)]
pub struct PgAuditLog {
    pool: PgPool,
}

impl PgAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditLog {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_logs (id, action, actor_id, actor_name, details)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(&entry.action)
        .bind(entry.actor.as_ref().map(|a| a.id))
        .bind(entry.actor.as_ref().map(|a| a.name.as_str()))
        .bind(&entry.details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use crate::testing::RecordingAudit;
    use serde_json::json;

    struct BrokenSink;

    #[async_trait]
    impl AuditSink for BrokenSink {
        async fn record(&self, _entry: AuditEntry) -> Result<()> {
            Err(AppError::Storage("audit table unavailable".to_string()))
        }
    }

    fn entry() -> AuditEntry {
        AuditEntry {
            action: "backup.completed".to_string(),
            actor: None,
            details: json!({ "size": 10 }),
        }
    }

    #[tokio::test]
    async fn test_audit_failure_is_swallowed() {
        let handle = spawn_audit(Arc::new(BrokenSink), entry());
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn test_audit_entry_is_delivered() -> anyhow::Result<()> {
        let sink = Arc::new(RecordingAudit::default());
        spawn_audit(sink.clone(), entry()).await?;
        let entries = sink.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "backup.completed");
        Ok(())
    }
}
