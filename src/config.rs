//! Configuration types.
//!
//! Everything is read once at startup and injected into the orchestrator.
//! Nothing inside the pipeline touches the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig, RetryConfig};

/// Default model when `LLM_MODEL` is unset.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Execution tier (provider action calls).
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Base URL; calls go to `{base_url}/mcp/{provider}/{action}`.
    pub base_url: String,
    /// Shared internal secret sent as a header on every action call.
    pub shared_secret: Option<SecretString>,
    pub timeout: Duration,
}

/// Plan generator settings.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Email body is truncated to this many characters before prompting.
    pub max_body_chars: usize,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_body_chars: 4000,
            temperature: 0.0,
            max_tokens: 2048,
        }
    }
}

/// Downstream reply-service defaults.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Used when the workspace has no reply URL of its own.
    pub default_url: Option<String>,
    pub default_token: Option<SecretString>,
    pub timeout: Duration,
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// `None` when no model credential is configured.
    pub llm: Option<LlmConfig>,
    pub llm_timeout: Duration,
    pub llm_retry: RetryConfig,
    pub planner: PlannerConfig,
    pub execution: ExecutionConfig,
    pub dispatch: DispatchConfig,
    /// Upper bound for a single audit-log write.
    pub audit_timeout: Duration,
}

impl OrchestratorConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = match non_empty(&lookup, "LLM_BACKEND").as_deref() {
            None | Some("anthropic") => LlmBackend::Anthropic,
            Some("openai") => LlmBackend::OpenAi,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "LLM_BACKEND".into(),
                    message: format!("unknown backend '{other}' (expected anthropic or openai)"),
                });
            }
        };

        let backend_key_var = match backend {
            LlmBackend::Anthropic => "ANTHROPIC_API_KEY",
            LlmBackend::OpenAi => "OPENAI_API_KEY",
        };
        let api_key =
            non_empty(&lookup, "LLM_API_KEY").or_else(|| non_empty(&lookup, backend_key_var));
        let model = non_empty(&lookup, "LLM_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let llm = api_key.map(|key| LlmConfig {
            backend,
            api_key: SecretString::from(key),
            model,
        });

        let base_url = non_empty(&lookup, "EXECUTION_BASE_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("EXECUTION_BASE_URL".into()))?;

        let retry_defaults = RetryConfig::default();
        let llm_retry = RetryConfig {
            max_attempts: parse_or(&lookup, "LLM_MAX_RETRIES", retry_defaults.max_attempts)?
                .max(1),
            ..retry_defaults
        };

        let planner_defaults = PlannerConfig::default();
        let planner = PlannerConfig {
            max_body_chars: parse_or(
                &lookup,
                "PLAN_MAX_BODY_CHARS",
                planner_defaults.max_body_chars,
            )?,
            ..planner_defaults
        };

        Ok(Self {
            llm,
            llm_timeout: Duration::from_secs(parse_or(&lookup, "LLM_TIMEOUT_SECS", 60)?),
            llm_retry,
            planner,
            execution: ExecutionConfig {
                base_url: base_url.trim_end_matches('/').to_string(),
                shared_secret: non_empty(&lookup, "EXECUTION_SHARED_SECRET")
                    .map(SecretString::from),
                timeout: Duration::from_secs(parse_or(&lookup, "ACTION_TIMEOUT_SECS", 30)?),
            },
            dispatch: DispatchConfig {
                default_url: non_empty(&lookup, "REPLY_SERVICE_URL"),
                default_token: non_empty(&lookup, "REPLY_SERVICE_TOKEN").map(SecretString::from),
                timeout: Duration::from_secs(parse_or(&lookup, "DISPATCH_TIMEOUT_SECS", 30)?),
            },
            audit_timeout: Duration::from_millis(parse_or(&lookup, "AUDIT_TIMEOUT_MS", 2000)?),
        })
    }
}

/// HTTP server and process settings for the binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    /// When set, logs are also written to daily-rolling files here.
    pub log_dir: Option<PathBuf>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            port: parse_or(&lookup, "MAILPLAN_PORT", 8080)?,
            db_path: non_empty(&lookup, "MAILPLAN_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/mailplan.db")),
            log_dir: non_empty(&lookup, "MAILPLAN_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(lookup, key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
    }
}
