//! Unified `Database` trait: single async interface for all persistence.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::tools::ToolBinding;

/// A tenant: owner of agents, bindings, and a reply-service endpoint.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub id: String,
    /// Owner whose provider credentials are used for action calls.
    pub user_id: String,
    pub reply_url: Option<String>,
    pub reply_token: Option<SecretString>,
}

/// Per (user, provider) secret bundle. Shared by every binding of the provider.
#[derive(Debug, Clone)]
pub struct ProviderCredential {
    pub user_id: String,
    pub provider: String,
    /// JSON object, kept opaque until the call that needs it.
    pub secret: SecretString,
}

/// Pipeline stage an audit entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStage {
    Verify,
    Resolve,
    Plan,
    Execute,
    Dispatch,
}

impl AuditStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verify => "verify",
            Self::Resolve => "resolve",
            Self::Plan => "plan",
            Self::Execute => "execute",
            Self::Dispatch => "dispatch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "verify" => Some(Self::Verify),
            "resolve" => Some(Self::Resolve),
            "plan" => Some(Self::Plan),
            "execute" => Some(Self::Execute),
            "dispatch" => Some(Self::Dispatch),
            _ => None,
        }
    }
}

impl fmt::Display for AuditStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    Info,
    Warn,
    Error,
}

impl AuditLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// One row of the append-only audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub workspace_id: String,
    pub interaction_id: Option<String>,
    pub agent_id: Option<String>,
    pub stage: AuditStage,
    pub level: AuditLevel,
    pub message: String,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of an interaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionStatus {
    Received,
    Executed,
    Processed,
}

impl InteractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Executed => "executed",
            Self::Processed => "processed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "executed" => Self::Executed,
            "processed" => Self::Processed,
            _ => Self::Received,
        }
    }
}

/// Final write after a successful downstream dispatch.
#[derive(Debug, Clone)]
pub struct InteractionCompletion {
    pub agent_id: String,
    pub outbound_request: serde_json::Value,
    pub response: String,
    pub results: serde_json::Value,
    pub plan: serde_json::Value,
}

/// The mutable per-email record.
#[derive(Debug, Clone)]
pub struct InteractionRecord {
    pub id: String,
    pub workspace_id: String,
    pub message_id: Option<String>,
    pub raw_request: serde_json::Value,
    pub results: Option<serde_json::Value>,
    pub plan: Option<serde_json::Value>,
    pub outbound_request: Option<serde_json::Value>,
    pub response: Option<String>,
    pub handled_by: Option<String>,
    pub status: InteractionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Workspaces ──────────────────────────────────────────────────

    async fn upsert_workspace(&self, workspace: &Workspace) -> Result<(), DatabaseError>;

    async fn get_workspace(&self, id: &str) -> Result<Option<Workspace>, DatabaseError>;

    // ── Agents ──────────────────────────────────────────────────────

    /// Map a mailbox address to an agent. Addresses are stored lower-cased.
    async fn add_agent_mailbox(
        &self,
        workspace_id: &str,
        agent_id: &str,
        address: &str,
    ) -> Result<(), DatabaseError>;

    /// Distinct agent ids in the workspace owning any of the given addresses.
    async fn agents_for_addresses(
        &self,
        workspace_id: &str,
        addresses: &[String],
    ) -> Result<Vec<String>, DatabaseError>;

    // ── Tool bindings ───────────────────────────────────────────────

    async fn upsert_tool_binding(
        &self,
        workspace_id: &str,
        binding: &ToolBinding,
    ) -> Result<(), DatabaseError>;

    async fn link_agent_binding(
        &self,
        agent_id: &str,
        binding_id: &str,
        active: bool,
    ) -> Result<(), DatabaseError>;

    /// Binding ids with an active association to the agent.
    async fn active_binding_ids(&self, agent_id: &str) -> Result<Vec<String>, DatabaseError>;

    /// Active binding records among the given ids.
    async fn tool_bindings_by_ids(&self, ids: &[String]) -> Result<Vec<ToolBinding>, DatabaseError>;

    // ── Credentials ─────────────────────────────────────────────────

    async fn upsert_provider_credential(
        &self,
        user_id: &str,
        provider: &str,
        secret: &serde_json::Value,
    ) -> Result<(), DatabaseError>;

    async fn get_provider_credential(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<ProviderCredential>, DatabaseError>;

    // ── Audit log ───────────────────────────────────────────────────

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), DatabaseError>;

    /// Entries for one interaction, oldest first.
    async fn list_audit(&self, interaction_id: &str) -> Result<Vec<AuditEntry>, DatabaseError>;

    // ── Interactions ────────────────────────────────────────────────

    /// Create (or reset, for a replayed message id) the interaction record.
    /// Returns its id.
    async fn record_interaction(
        &self,
        workspace_id: &str,
        message_id: Option<&str>,
        raw_request: &serde_json::Value,
    ) -> Result<String, DatabaseError>;

    /// Intermediate write of raw execution results.
    async fn update_interaction_results(
        &self,
        id: &str,
        results: &serde_json::Value,
    ) -> Result<(), DatabaseError>;

    /// Final write after a successful dispatch; marks the record processed.
    async fn finalize_interaction(
        &self,
        id: &str,
        completion: &InteractionCompletion,
    ) -> Result<(), DatabaseError>;

    async fn get_interaction(&self, id: &str) -> Result<Option<InteractionRecord>, DatabaseError>;
}
