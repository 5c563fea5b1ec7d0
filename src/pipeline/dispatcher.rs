//! Downstream dispatch: forwards the final bundle to the reply service
//! and persists the terminal interaction state.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::pipeline::audit::{AuditLog, AuditScope};
use crate::pipeline::truncate_for_log;
use crate::pipeline::types::{ExecutionOutput, PlanStep};
use crate::pipeline::verifier::AuthenticitySignals;
use crate::store::{AuditLevel, AuditStage, Database, InteractionCompletion, Workspace};

/// Response body kept in error messages.
const MAX_ERROR_BODY_CHARS: usize = 500;

/// Body POSTed to the reply service.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchPayload {
    pub agent_id: String,
    pub interaction_id: String,
    /// Normalized email fields.
    pub email: serde_json::Value,
    pub sender_verified: bool,
    pub authenticity: AuthenticitySignals,
    pub plan: Vec<PlanStep>,
    pub results: Vec<ExecutionOutput>,
    pub digest: String,
}

/// A delivered dispatch.
#[derive(Debug, Clone)]
pub struct DispatchReceipt {
    pub status: u16,
    pub response: String,
    /// Set when delivery succeeded but the final record could not be saved.
    pub warning: Option<String>,
}

pub struct Dispatcher {
    client: reqwest::Client,
    config: DispatchConfig,
    db: Arc<dyn Database>,
    audit: Arc<AuditLog>,
}

impl Dispatcher {
    pub fn new(db: Arc<dyn Database>, config: DispatchConfig, audit: Arc<AuditLog>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            db,
            audit,
        }
    }

    /// Reply endpoint for the workspace, falling back to the configured default.
    fn endpoint<'a>(
        &'a self,
        workspace: &'a Workspace,
    ) -> Result<(&'a str, &'a SecretString), DispatchError> {
        let url = workspace
            .reply_url
            .as_deref()
            .or(self.config.default_url.as_deref());
        let token = workspace
            .reply_token
            .as_ref()
            .or(self.config.default_token.as_ref());
        match (url, token) {
            (Some(url), Some(token)) => Ok((url, token)),
            _ => Err(DispatchError::NotConfigured {
                workspace_id: workspace.id.clone(),
            }),
        }
    }

    /// Single delivery attempt, then the final interaction write.
    pub async fn dispatch(
        &self,
        scope: &AuditScope,
        workspace: &Workspace,
        payload: &DispatchPayload,
    ) -> Result<DispatchReceipt, DispatchError> {
        let (status, response) = match self.send(workspace, payload).await {
            Ok(delivered) => delivered,
            Err(e) => {
                error!(agent_id = %payload.agent_id, error = %e, "Dispatch failed");
                self.audit
                    .record(
                        scope,
                        AuditStage::Dispatch,
                        AuditLevel::Error,
                        "dispatch failed",
                        json!({ "error": e.to_string() }),
                    )
                    .await;
                return Err(e);
            }
        };

        let completion = InteractionCompletion {
            agent_id: payload.agent_id.clone(),
            outbound_request: serde_json::to_value(payload)?,
            response: response.clone(),
            results: serde_json::to_value(&payload.results)?,
            plan: serde_json::to_value(&payload.plan)?,
        };
        let warning = match self
            .db
            .finalize_interaction(&payload.interaction_id, &completion)
            .await
        {
            Ok(()) => None,
            Err(e) => {
                warn!(
                    interaction_id = %payload.interaction_id,
                    error = %e,
                    "Dispatched but failed to persist final state"
                );
                Some(format!("failed to persist final state: {e}"))
            }
        };

        info!(agent_id = %payload.agent_id, status, "Dispatched to reply service");
        self.audit
            .record(
                scope,
                AuditStage::Dispatch,
                if warning.is_some() {
                    AuditLevel::Warn
                } else {
                    AuditLevel::Info
                },
                "dispatched",
                json!({
                    "status": status,
                    "response": truncate_for_log(&response, MAX_ERROR_BODY_CHARS),
                    "warning": warning,
                }),
            )
            .await;

        Ok(DispatchReceipt {
            status,
            response,
            warning,
        })
    }

    async fn send(
        &self,
        workspace: &Workspace,
        payload: &DispatchPayload,
    ) -> Result<(u16, String), DispatchError> {
        let (url, token) = self.endpoint(workspace)?;
        let response = self
            .client
            .post(url)
            .timeout(self.config.timeout)
            .bearer_auth(token.expose_secret())
            .json(payload)
            .send()
            .await
            .map_err(|e| DispatchError::Network(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(DispatchError::Rejected {
                status: status.as_u16(),
                body: truncate_for_log(&body, MAX_ERROR_BODY_CHARS),
            });
        }
        Ok((status.as_u16(), body))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::Value;

    use super::*;
    use crate::store::{InteractionStatus, LibSqlBackend};

    type Received = Arc<Mutex<Vec<(Option<String>, Value)>>>;

    async fn reply(
        State(received): State<Received>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        received.lock().unwrap().push((auth, body));
        (StatusCode::OK, Json(json!({"reply": "queued"})))
    }

    async fn refuse() -> (StatusCode, &'static str) {
        (StatusCode::SERVICE_UNAVAILABLE, "maintenance")
    }

    async fn start_reply_service() -> (String, Received) {
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/reply", post(reply))
            .route("/down", post(refuse))
            .with_state(Arc::clone(&received));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://127.0.0.1:{port}"), received)
    }

    async fn setup(
        default_url: Option<String>,
    ) -> (Dispatcher, Arc<LibSqlBackend>, String) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let interaction_id = db
            .record_interaction("ws1", Some("<m1@x>"), &json!({}))
            .await
            .unwrap();
        let audit = Arc::new(AuditLog::new(db.clone(), Duration::from_secs(1)));
        let config = DispatchConfig {
            default_url,
            default_token: Some(SecretString::from("default-token".to_string())),
            timeout: Duration::from_secs(5),
        };
        (Dispatcher::new(db.clone(), config, audit), db, interaction_id)
    }

    fn workspace(reply_url: Option<String>) -> Workspace {
        Workspace {
            id: "ws1".into(),
            user_id: "user-1".into(),
            reply_url,
            reply_token: Some(SecretString::from("ws-token".to_string())),
        }
    }

    fn payload(interaction_id: &str) -> DispatchPayload {
        DispatchPayload {
            agent_id: "agent-a".into(),
            interaction_id: interaction_id.into(),
            email: json!({"sender": "a@x.com"}),
            sender_verified: true,
            authenticity: AuthenticitySignals::default(),
            plan: vec![],
            results: vec![],
            digest: "No action necessary.".into(),
        }
    }

    #[tokio::test]
    async fn delivers_with_bearer_and_finalizes() {
        let (base, received) = start_reply_service().await;
        let (dispatcher, db, id) = setup(None).await;
        let scope = AuditScope::new("ws1", id.clone()).for_agent("agent-a");

        let receipt = dispatcher
            .dispatch(&scope, &workspace(Some(format!("{base}/reply"))), &payload(&id))
            .await
            .unwrap();
        assert_eq!(receipt.status, 200);
        assert!(receipt.warning.is_none());

        let received = received.lock().unwrap();
        assert_eq!(received[0].0.as_deref(), Some("Bearer ws-token"));
        assert_eq!(received[0].1["digest"], "No action necessary.");
        assert_eq!(received[0].1["agent_id"], "agent-a");
        drop(received);

        let record = db.get_interaction(&id).await.unwrap().unwrap();
        assert_eq!(record.status, InteractionStatus::Processed);
        assert_eq!(record.handled_by.as_deref(), Some("agent-a"));
        assert!(record.response.unwrap().contains("queued"));
    }

    #[tokio::test]
    async fn falls_back_to_default_endpoint() {
        let (base, received) = start_reply_service().await;
        let (dispatcher, _db, id) = setup(Some(format!("{base}/reply"))).await;
        let scope = AuditScope::new("ws1", id.clone());
        let mut ws = workspace(None);
        ws.reply_token = None;

        dispatcher.dispatch(&scope, &ws, &payload(&id)).await.unwrap();
        assert_eq!(
            received.lock().unwrap()[0].0.as_deref(),
            Some("Bearer default-token")
        );
    }

    #[tokio::test]
    async fn non_success_fails_without_finalizing() {
        let (base, _received) = start_reply_service().await;
        let (dispatcher, db, id) = setup(None).await;
        let scope = AuditScope::new("ws1", id.clone());

        let err = dispatcher
            .dispatch(&scope, &workspace(Some(format!("{base}/down"))), &payload(&id))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Rejected { status: 503, .. }));

        let record = db.get_interaction(&id).await.unwrap().unwrap();
        assert_eq!(record.status, InteractionStatus::Received);
    }

    #[tokio::test]
    async fn missing_endpoint_is_configuration_error() {
        let (dispatcher, _db, id) = setup(None).await;
        let scope = AuditScope::new("ws1", id.clone());
        let err = dispatcher
            .dispatch(&scope, &workspace(None), &payload(&id))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotConfigured { .. }));
    }
}
