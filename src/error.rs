//! Error types for mailplan.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },
}

/// Pipeline-level errors that escape `EmailProcessor::process`.
///
/// Everything past the fan-out point is captured into the outcome instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Unknown workspace: {0}")]
    UnknownWorkspace(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM setup failed: {0}")]
    Llm(#[from] LlmError),
}

/// Failure of a single plan step. Poisons only the steps that depend on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    #[error("No credentials stored for provider {provider}")]
    MissingCredential { provider: String },

    #[error("Credentials for provider {provider} are not a JSON object")]
    MalformedCredential { provider: String },

    #[error("Execution secret is not configured")]
    MissingSecret,

    #[error("Failed to load credentials for provider {provider}: {reason}")]
    CredentialLookup { provider: String, reason: String },

    #[error("Step {step} references step {referenced}, which has not run yet")]
    ForwardReference { step: usize, referenced: usize },

    #[error("Step {step} depends on step {referenced}, which failed")]
    FailedDependency { step: usize, referenced: usize },

    #[error("Step {step} could not resolve '{path}' in the output of step {referenced}")]
    UnresolvedPlaceholder {
        step: usize,
        referenced: usize,
        path: String,
    },

    #[error("Tool {name} is not in the catalog")]
    UnknownTool { name: String },

    #[error("HTTP {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("{tool} succeeded (HTTP {status}) but returned an unparseable body: {body}")]
    UnparseableSuccess {
        tool: String,
        status: u16,
        body: String,
    },

    #[error("Request failed: {0}")]
    Network(String),

    #[error("Request timed out after {timeout:?}")]
    Timeout { timeout: Duration },
}

/// Downstream dispatch errors. Fail only the affected agent pipeline.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Reply service is not configured for workspace {workspace_id}")]
    NotConfigured { workspace_id: String },

    #[error("Reply service rejected the request: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Reply service request failed: {0}")]
    Network(String),

    #[error("Failed to serialize dispatch payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
