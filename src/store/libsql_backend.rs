//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    AuditEntry, AuditLevel, AuditStage, Database, InteractionCompletion, InteractionRecord,
    InteractionStatus, ProviderCredential, Workspace,
};
use crate::tools::ToolBinding;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn to_json_text(value: &serde_json::Value) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Parse a JSON column, treating NULL or garbage as JSON null.
fn parse_json(s: Option<String>) -> serde_json::Value {
    s.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(serde_json::Value::Null)
}

fn opt_json(s: Option<String>) -> Option<serde_json::Value> {
    s.and_then(|s| serde_json::from_str(&s).ok())
}

const BINDING_COLUMNS: &str =
    "id, name, provider, action, instructions, input_schema, output_schema, active";

/// Column order matches BINDING_COLUMNS.
fn row_to_binding(row: &libsql::Row) -> Result<ToolBinding, libsql::Error> {
    let active: i64 = row.get(7)?;
    Ok(ToolBinding {
        id: row.get(0)?,
        name: row.get(1)?,
        provider: row.get(2)?,
        action: row.get(3)?,
        instructions: row.get::<String>(4).unwrap_or_default(),
        input_schema: parse_json(row.get::<String>(5).ok()),
        output_schema: parse_json(row.get::<String>(6).ok()),
        active: active != 0,
    })
}

const AUDIT_COLUMNS: &str =
    "id, workspace_id, interaction_id, agent_id, stage, level, message, detail, created_at";

/// `None` for a row whose stage this build does not know.
fn row_to_audit(row: &libsql::Row) -> Result<Option<AuditEntry>, libsql::Error> {
    let stage: String = row.get(4)?;
    let Some(stage) = AuditStage::parse(&stage) else {
        tracing::warn!(stage = %stage, "Skipping audit row with unknown stage");
        return Ok(None);
    };
    let level: String = row.get(5)?;
    let created: String = row.get(8)?;
    Ok(Some(AuditEntry {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        interaction_id: row.get::<String>(2).ok(),
        agent_id: row.get::<String>(3).ok(),
        stage,
        level: AuditLevel::parse(&level),
        message: row.get(6)?,
        detail: parse_json(row.get::<String>(7).ok()),
        created_at: parse_datetime(&created),
    }))
}

const INTERACTION_COLUMNS: &str = "id, workspace_id, message_id, raw_request, results, plan, \
     outbound_request, response, handled_by, status, created_at, updated_at";

fn row_to_interaction(row: &libsql::Row) -> Result<InteractionRecord, libsql::Error> {
    let status: String = row.get(9)?;
    let created: String = row.get(10)?;
    let updated: String = row.get(11)?;
    Ok(InteractionRecord {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        message_id: row.get::<String>(2).ok(),
        raw_request: parse_json(row.get::<String>(3).ok()),
        results: opt_json(row.get::<String>(4).ok()),
        plan: opt_json(row.get::<String>(5).ok()),
        outbound_request: opt_json(row.get::<String>(6).ok()),
        response: row.get::<String>(7).ok(),
        handled_by: row.get::<String>(8).ok(),
        status: InteractionStatus::parse(&status),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Workspaces ──────────────────────────────────────────────────

    async fn upsert_workspace(&self, workspace: &Workspace) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO workspaces (id, user_id, reply_url, reply_token, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    user_id = excluded.user_id,
                    reply_url = excluded.reply_url,
                    reply_token = excluded.reply_token,
                    updated_at = excluded.updated_at",
                params![
                    workspace.id.as_str(),
                    workspace.user_id.as_str(),
                    opt_text(workspace.reply_url.as_deref()),
                    opt_text(workspace.reply_token.as_ref().map(|t| t.expose_secret())),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_workspace: {e}")))?;
        Ok(())
    }

    async fn get_workspace(&self, id: &str) -> Result<Option<Workspace>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, user_id, reply_url, reply_token FROM workspaces WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_workspace: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let workspace = Workspace {
                    id: row
                        .get(0)
                        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
                    user_id: row
                        .get(1)
                        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
                    reply_url: row.get::<String>(2).ok(),
                    reply_token: row.get::<String>(3).ok().map(SecretString::from),
                };
                Ok(Some(workspace))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_workspace: {e}"))),
        }
    }

    // ── Agents ──────────────────────────────────────────────────────

    async fn add_agent_mailbox(
        &self,
        workspace_id: &str,
        agent_id: &str,
        address: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO agent_mailboxes (workspace_id, agent_id, address)
                 VALUES (?1, ?2, ?3)",
                params![workspace_id, agent_id, address.trim().to_lowercase()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_agent_mailbox: {e}")))?;
        Ok(())
    }

    async fn agents_for_addresses(
        &self,
        workspace_id: &str,
        addresses: &[String],
    ) -> Result<Vec<String>, DatabaseError> {
        let mut agents = BTreeSet::new();
        for address in addresses {
            let mut rows = self
                .conn()
                .query(
                    "SELECT DISTINCT agent_id FROM agent_mailboxes
                     WHERE workspace_id = ?1 AND address = ?2",
                    params![workspace_id, address.as_str()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("agents_for_addresses: {e}")))?;
            while let Ok(Some(row)) = rows.next().await {
                match row.get::<String>(0) {
                    Ok(agent_id) => {
                        agents.insert(agent_id);
                    }
                    Err(e) => tracing::warn!("Skipping mailbox row: {e}"),
                }
            }
        }
        Ok(agents.into_iter().collect())
    }

    // ── Tool bindings ───────────────────────────────────────────────

    async fn upsert_tool_binding(
        &self,
        workspace_id: &str,
        binding: &ToolBinding,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO tool_bindings (id, workspace_id, name, provider, action, instructions,
                    input_schema, output_schema, active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    provider = excluded.provider,
                    action = excluded.action,
                    instructions = excluded.instructions,
                    input_schema = excluded.input_schema,
                    output_schema = excluded.output_schema,
                    active = excluded.active,
                    updated_at = excluded.updated_at",
                params![
                    binding.id.as_str(),
                    workspace_id,
                    binding.name.as_str(),
                    binding.provider.as_str(),
                    binding.action.as_str(),
                    binding.instructions.as_str(),
                    to_json_text(&binding.input_schema)?,
                    to_json_text(&binding.output_schema)?,
                    i64::from(binding.active),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_tool_binding: {e}")))?;
        debug!(id = %binding.id, name = %binding.name, "Tool binding stored");
        Ok(())
    }

    async fn link_agent_binding(
        &self,
        agent_id: &str,
        binding_id: &str,
        active: bool,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO agent_tool_bindings (agent_id, binding_id, active)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(agent_id, binding_id) DO UPDATE SET active = excluded.active",
                params![agent_id, binding_id, i64::from(active)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("link_agent_binding: {e}")))?;
        Ok(())
    }

    async fn active_binding_ids(&self, agent_id: &str) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT binding_id FROM agent_tool_bindings
                 WHERE agent_id = ?1 AND active = 1 ORDER BY binding_id",
                params![agent_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("active_binding_ids: {e}")))?;

        let mut ids = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row.get::<String>(0) {
                Ok(id) => ids.push(id),
                Err(e) => tracing::warn!("Skipping binding association row: {e}"),
            }
        }
        Ok(ids)
    }

    async fn tool_bindings_by_ids(&self, ids: &[String]) -> Result<Vec<ToolBinding>, DatabaseError> {
        let mut bindings = Vec::with_capacity(ids.len());
        for id in ids {
            let mut rows = self
                .conn()
                .query(
                    &format!(
                        "SELECT {BINDING_COLUMNS} FROM tool_bindings WHERE id = ?1 AND active = 1"
                    ),
                    params![id.as_str()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("tool_bindings_by_ids: {e}")))?;
            if let Ok(Some(row)) = rows.next().await {
                match row_to_binding(&row) {
                    Ok(binding) => bindings.push(binding),
                    Err(e) => tracing::warn!(id = %id, "Skipping tool binding row: {e}"),
                }
            }
        }
        Ok(bindings)
    }

    // ── Credentials ─────────────────────────────────────────────────

    async fn upsert_provider_credential(
        &self,
        user_id: &str,
        provider: &str,
        secret: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO provider_credentials (user_id, provider, secret, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, provider) DO UPDATE SET
                    secret = excluded.secret,
                    updated_at = excluded.updated_at",
                params![user_id, provider, to_json_text(secret)?, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_provider_credential: {e}")))?;
        Ok(())
    }

    async fn get_provider_credential(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<ProviderCredential>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT secret FROM provider_credentials WHERE user_id = ?1 AND provider = ?2",
                params![user_id, provider],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_provider_credential: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let secret: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(ProviderCredential {
                    user_id: user_id.to_string(),
                    provider: provider.to_string(),
                    secret: SecretString::from(secret),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_provider_credential: {e}"))),
        }
    }

    // ── Audit log ───────────────────────────────────────────────────

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO audit_log (id, workspace_id, interaction_id, agent_id, stage, level,
                    message, detail, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    entry.id.as_str(),
                    entry.workspace_id.as_str(),
                    opt_text(entry.interaction_id.as_deref()),
                    opt_text(entry.agent_id.as_deref()),
                    entry.stage.as_str(),
                    entry.level.as_str(),
                    entry.message.as_str(),
                    to_json_text(&entry.detail)?,
                    entry.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_audit: {e}")))?;
        Ok(())
    }

    async fn list_audit(&self, interaction_id: &str) -> Result<Vec<AuditEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE interaction_id = ?1
                     ORDER BY created_at ASC, rowid ASC"
                ),
                params![interaction_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_audit: {e}")))?;

        let mut entries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_audit(&row) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping audit row: {e}"),
            }
        }
        Ok(entries)
    }

    // ── Interactions ────────────────────────────────────────────────

    async fn record_interaction(
        &self,
        workspace_id: &str,
        message_id: Option<&str>,
        raw_request: &serde_json::Value,
    ) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO interactions (id, workspace_id, message_id, raw_request, status,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'received', ?5, ?5)
             ON CONFLICT(workspace_id, message_id) DO UPDATE SET
                raw_request = excluded.raw_request,
                results = NULL,
                plan = NULL,
                outbound_request = NULL,
                response = NULL,
                handled_by = NULL,
                status = 'received',
                updated_at = excluded.updated_at",
            params![
                id.clone(),
                workspace_id,
                opt_text(message_id),
                to_json_text(raw_request)?,
                now,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_interaction: {e}")))?;

        let Some(message_id) = message_id else {
            return Ok(id);
        };

        // A replayed message id keeps its original record id.
        let mut rows = conn
            .query(
                "SELECT id FROM interactions WHERE workspace_id = ?1 AND message_id = ?2",
                params![workspace_id, message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_interaction: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => row
                .get::<String>(0)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}"))),
            Ok(None) => Err(DatabaseError::NotFound {
                entity: "interaction".into(),
                id: message_id.to_string(),
            }),
            Err(e) => Err(DatabaseError::Query(format!("record_interaction: {e}"))),
        }
    }

    async fn update_interaction_results(
        &self,
        id: &str,
        results: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let updated = self
            .conn()
            .execute(
                // A sibling agent may already have finalized the record.
                "UPDATE interactions SET
                    results = CASE WHEN status = 'processed' THEN results ELSE ?1 END,
                    status = CASE WHEN status = 'processed' THEN status ELSE 'executed' END,
                    updated_at = ?2
                 WHERE id = ?3",
                params![to_json_text(results)?, now, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_interaction_results: {e}")))?;
        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "interaction".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn finalize_interaction(
        &self,
        id: &str,
        completion: &InteractionCompletion,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let updated = self
            .conn()
            .execute(
                "UPDATE interactions SET
                    handled_by = ?1,
                    outbound_request = ?2,
                    response = ?3,
                    results = ?4,
                    plan = ?5,
                    status = 'processed',
                    updated_at = ?6
                 WHERE id = ?7",
                params![
                    completion.agent_id.as_str(),
                    to_json_text(&completion.outbound_request)?,
                    completion.response.as_str(),
                    to_json_text(&completion.results)?,
                    to_json_text(&completion.plan)?,
                    now,
                    id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finalize_interaction: {e}")))?;
        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "interaction".into(),
                id: id.to_string(),
            });
        }
        debug!(id, agent_id = %completion.agent_id, "Interaction processed");
        Ok(())
    }

    async fn get_interaction(&self, id: &str) -> Result<Option<InteractionRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {INTERACTION_COLUMNS} FROM interactions WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_interaction: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let record = row_to_interaction(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_interaction: {e}"))),
        }
    }
}
