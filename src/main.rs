use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mailplan::config::{OrchestratorConfig, ServerConfig};
use mailplan::pipeline::EmailProcessor;
use mailplan::store::{Database, LibSqlBackend};
use mailplan::webhook::webhook_routes;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let server = ServerConfig::from_env().context("invalid server configuration")?;
    init_tracing(&server);

    let config = OrchestratorConfig::from_env().context("invalid orchestrator configuration")?;

    eprintln!("📬 mailplan v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Model: {}",
        config
            .llm
            .as_ref()
            .map(|l| l.model.as_str())
            .unwrap_or("(none, planning disabled)")
    );
    eprintln!("   Execution tier: {}", config.execution.base_url);
    eprintln!("   Database: {}", server.db_path.display());

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&server.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", server.db_path.display()))?,
    );

    // ── Pipeline ─────────────────────────────────────────────────────────
    let processor = Arc::new(EmailProcessor::from_config(Arc::clone(&db), &config)?);

    // ── HTTP server ──────────────────────────────────────────────────────
    let app = webhook_routes(processor);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", server.port))
        .await
        .with_context(|| format!("failed to bind port {}", server.port))?;
    eprintln!(
        "   Webhook: http://0.0.0.0:{}/webhooks/email/{{workspace_id}}\n",
        server.port
    );
    tracing::info!(port = server.port, "Webhook server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}

/// Stderr logging, plus daily-rolling files when a log directory is set.
fn init_tracing(server: &ServerConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match &server.log_dir {
        Some(log_dir) => {
            let _ = std::fs::create_dir_all(log_dir);
            let file_appender = tracing_appender::rolling::daily(log_dir, "mailplan.log");
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(file_appender)
                .json()
                .with_ansi(false);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init()
                .ok();
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .try_init()
                .ok();
        }
    }
}
