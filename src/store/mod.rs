//! Persistence layer: libSQL-backed storage for workspaces, bindings,
//! credentials, interactions, and the audit log.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    AuditEntry, AuditLevel, AuditStage, Database, InteractionCompletion, InteractionRecord,
    InteractionStatus, ProviderCredential, Workspace,
};
