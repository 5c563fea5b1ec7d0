//! Append-only audit trail for pipeline stages.
//!
//! Writes are awaited but bounded by a timeout. A failed or slow write is
//! logged and counted; it never fails the stage that produced it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::store::{AuditEntry, AuditLevel, AuditStage, Database};

/// Identifiers attached to every audit entry of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditScope {
    pub workspace_id: String,
    pub interaction_id: Option<String>,
    pub agent_id: Option<String>,
}

impl AuditScope {
    pub fn new(workspace_id: impl Into<String>, interaction_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            interaction_id: Some(interaction_id.into()),
            agent_id: None,
        }
    }

    /// Same scope narrowed to one agent pipeline.
    pub fn for_agent(&self, agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            ..self.clone()
        }
    }
}

pub struct AuditLog {
    db: Arc<dyn Database>,
    timeout: Duration,
    failures: AtomicU64,
}

impl AuditLog {
    pub fn new(db: Arc<dyn Database>, timeout: Duration) -> Self {
        Self {
            db,
            timeout,
            failures: AtomicU64::new(0),
        }
    }

    /// Number of entries that could not be written.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub async fn record(
        &self,
        scope: &AuditScope,
        stage: AuditStage,
        level: AuditLevel,
        message: impl Into<String>,
        detail: serde_json::Value,
    ) {
        let entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            workspace_id: scope.workspace_id.clone(),
            interaction_id: scope.interaction_id.clone(),
            agent_id: scope.agent_id.clone(),
            stage,
            level,
            message: message.into(),
            detail,
            created_at: Utc::now(),
        };

        let error = match tokio::time::timeout(self.timeout, self.db.append_audit(&entry)).await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", self.timeout),
        };
        self.failures.fetch_add(1, Ordering::Relaxed);
        warn!(
            stage = %stage,
            interaction_id = ?scope.interaction_id,
            error = %error,
            "Failed to write audit entry"
        );
    }
}
