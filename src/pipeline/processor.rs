//! Email processor: the per-email orchestrator.
//!
//! Flow:
//! 1. Record the interaction, assess sender authenticity
//! 2. Resolve matched agents (none ⇒ soft no-op)
//! 3. Fan out one pipeline per agent and wait for all of them:
//!    catalog → plan → execute → digest → dispatch
//! 4. Aggregate into one `ProcessingOutcome`
//!
//! An unverified sender skips planning and execution; each matched agent
//! still dispatches the fixed "skipped" digest. One agent's failure never
//! affects its siblings.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{DatabaseError, PipelineError};
use crate::llm::{LlmProvider, create_resilient_provider};
use crate::pipeline::agents::AgentResolver;
use crate::pipeline::audit::{AuditLog, AuditScope};
use crate::pipeline::digest;
use crate::pipeline::dispatcher::{DispatchPayload, Dispatcher};
use crate::pipeline::executor::StepExecutor;
use crate::pipeline::planner::PlanGenerator;
use crate::pipeline::types::{
    AgentOutcome, AgentStatus, InboundEmailEvent, PlanResult, ProcessingOutcome, ProcessingState,
    SkipReason,
};
use crate::pipeline::verifier::{self, AuthenticitySignals};
use crate::store::{AuditLevel, AuditStage, Database, Workspace};
use crate::tools::{ActionClient, CatalogAssembler, HttpActionClient, ToolCatalog};

pub struct EmailProcessor {
    db: Arc<dyn Database>,
    agents: AgentResolver,
    catalogs: CatalogAssembler,
    planner: PlanGenerator,
    executor: StepExecutor,
    dispatcher: Dispatcher,
    audit: Arc<AuditLog>,
}

/// Per-email context shared by every agent pipeline.
struct RunContext<'a> {
    workspace: &'a Workspace,
    email: &'a InboundEmailEvent,
    interaction_id: &'a str,
    scope: &'a AuditScope,
    signals: AuthenticitySignals,
}

impl EmailProcessor {
    /// Wire the pipeline from explicit collaborators.
    pub fn new(
        db: Arc<dyn Database>,
        llm: Option<Arc<dyn LlmProvider>>,
        actions: Arc<dyn ActionClient>,
        config: &OrchestratorConfig,
    ) -> Self {
        let audit = Arc::new(AuditLog::new(Arc::clone(&db), config.audit_timeout));
        Self {
            agents: AgentResolver::new(Arc::clone(&db)),
            catalogs: CatalogAssembler::new(Arc::clone(&db)),
            planner: PlanGenerator::new(llm, config.planner.clone(), Arc::clone(&audit)),
            executor: StepExecutor::new(Arc::clone(&db), actions, Arc::clone(&audit)),
            dispatcher: Dispatcher::new(
                Arc::clone(&db),
                config.dispatch.clone(),
                Arc::clone(&audit),
            ),
            audit,
            db,
        }
    }

    /// Wire the pipeline with the real model and execution-tier clients.
    pub fn from_config(
        db: Arc<dyn Database>,
        config: &OrchestratorConfig,
    ) -> Result<Self, PipelineError> {
        let llm = match &config.llm {
            Some(llm) => Some(create_resilient_provider(
                llm,
                config.llm_retry.clone(),
                config.llm_timeout,
            )?),
            None => {
                warn!("No model credential configured; plan generation will fail");
                None
            }
        };
        if config.execution.shared_secret.is_none() {
            warn!("EXECUTION_SHARED_SECRET not set; every action call will fail");
        }
        let actions = Arc::new(HttpActionClient::new(&config.execution));
        Ok(Self::new(db, llm, actions, config))
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Process one inbound email for a workspace.
    ///
    /// Errors only for an unknown workspace or a store failure before the
    /// fan-out; everything later is captured in the outcome.
    pub async fn process(
        &self,
        workspace_id: &str,
        email: InboundEmailEvent,
    ) -> Result<ProcessingOutcome, PipelineError> {
        let workspace = self
            .db
            .get_workspace(workspace_id)
            .await?
            .ok_or_else(|| PipelineError::UnknownWorkspace(workspace_id.to_string()))?;

        let raw = serde_json::to_value(&email)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let interaction_id = self
            .db
            .record_interaction(workspace_id, email.message_id.as_deref(), &raw)
            .await?;
        let scope = AuditScope::new(workspace_id, interaction_id.clone());

        info!(
            workspace_id,
            interaction_id = %interaction_id,
            sender = %email.sender_address(),
            "Processing inbound email"
        );

        let mut warnings = Vec::new();
        let signals = verifier::assess(&email.headers, &email.sender_address());
        let verified = signals.is_verified();
        if verified {
            self.audit
                .record(&scope, AuditStage::Verify, AuditLevel::Info, "sender verified", json!(signals))
                .await;
        } else {
            let failures = signals.failures();
            warn!(interaction_id = %interaction_id, ?failures, "Sender not verified");
            self.audit
                .record(
                    &scope,
                    AuditStage::Verify,
                    AuditLevel::Warn,
                    "sender not verified",
                    json!({ "signals": signals, "failures": failures }),
                )
                .await;
            warnings.push(format!(
                "sender not verified ({}); planning and execution skipped",
                failures.join(", ")
            ));
        }

        let recipients = email.recipients();
        let agent_ids = self.agents.resolve(workspace_id, &recipients).await?;
        if agent_ids.is_empty() {
            warn!(interaction_id = %interaction_id, ?recipients, "No agents matched recipients");
            self.audit
                .record(
                    &scope,
                    AuditStage::Resolve,
                    AuditLevel::Warn,
                    "no agents matched",
                    json!({ "recipients": recipients }),
                )
                .await;
            warnings.push("no agents matched the recipients".to_string());
            return Ok(ProcessingOutcome {
                success: true,
                state: ProcessingState::NoAgentsMatched,
                message: "no agents matched".to_string(),
                interaction_id,
                sender_verified: verified,
                authenticity: signals,
                agents: Vec::new(),
                warnings,
                errors: Vec::new(),
            });
        }
        self.audit
            .record(
                &scope,
                AuditStage::Resolve,
                AuditLevel::Info,
                "agents matched",
                json!({ "agents": agent_ids }),
            )
            .await;

        let ctx = RunContext {
            workspace: &workspace,
            email: &email,
            interaction_id: &interaction_id,
            scope: &scope,
            signals,
        };
        let agents = join_all(agent_ids.iter().map(|agent_id| self.run_agent(&ctx, agent_id))).await;

        let mut errors = Vec::new();
        for agent in &agents {
            warnings.extend(agent.warnings.iter().map(|w| format!("{}: {w}", agent.agent_id)));
            if let Some(e) = &agent.error {
                errors.push(format!("{}: {e}", agent.agent_id));
            }
        }
        let done = agents
            .iter()
            .filter(|a| a.status == AgentStatus::Done)
            .count();
        let success = done > 0;
        let message = format!("processed {done} of {} matched agents", agents.len());
        if success {
            info!(interaction_id = %interaction_id, "{message}");
        } else {
            error!(interaction_id = %interaction_id, ?errors, "{message}");
        }

        Ok(ProcessingOutcome {
            success,
            state: if success {
                ProcessingState::Processed
            } else {
                ProcessingState::Failed
            },
            message,
            interaction_id,
            sender_verified: verified,
            authenticity: signals,
            agents,
            warnings,
            errors,
        })
    }

    /// One agent's pipeline. Never fails; failures land in the outcome.
    async fn run_agent(&self, ctx: &RunContext<'_>, agent_id: &str) -> AgentOutcome {
        let scope = ctx.scope.for_agent(agent_id);
        let mut warnings = Vec::new();

        let (plan, catalog) = if ctx.signals.is_verified() {
            let catalog = match self.catalogs.assemble(agent_id).await {
                Ok(catalog) => catalog,
                Err(e) => {
                    error!(agent_id, error = %e, "Failed to assemble tool catalog");
                    self.audit
                        .record(
                            &scope,
                            AuditStage::Plan,
                            AuditLevel::Error,
                            "tool catalog unavailable",
                            json!({ "error": e.to_string() }),
                        )
                        .await;
                    return AgentOutcome {
                        agent_id: agent_id.to_string(),
                        status: AgentStatus::Failed,
                        plan: Vec::new(),
                        results: Vec::new(),
                        digest: String::new(),
                        error: Some(format!("failed to load tool catalog: {e}")),
                        warnings,
                    };
                }
            };
            let plan = self.planner.generate(&scope, ctx.email, &catalog).await;
            (plan, catalog)
        } else {
            (PlanResult::Skipped(SkipReason::Unverified), ToolCatalog::default())
        };

        if let PlanResult::Failed(reason) = &plan {
            warnings.push(format!("plan generation failed: {reason}"));
        }

        let steps = plan.steps().to_vec();
        let results = self
            .executor
            .execute(&scope, &ctx.workspace.user_id, &steps, &catalog)
            .await;
        for output in results.iter().filter(|o| !o.is_success()) {
            warnings.push(format!(
                "step {} ({}) failed: {}",
                output.step,
                output.tool,
                output.error.as_deref().unwrap_or("unknown error")
            ));
        }

        let stored = match serde_json::to_value(&results) {
            Ok(value) => self
                .db
                .update_interaction_results(ctx.interaction_id, &value)
                .await
                .map_err(|e| format!("failed to store intermediate results: {e}")),
            Err(e) => Err(format!("failed to serialize results: {e}")),
        };
        if let Err(message) = stored {
            warn!(agent_id, error = %message, "Intermediate results not saved");
            self.audit
                .record(
                    &scope,
                    AuditStage::Execute,
                    AuditLevel::Error,
                    "intermediate results not saved",
                    json!({ "error": message }),
                )
                .await;
            warnings.push(message);
        }

        let digest = digest::render(&plan, &results, &catalog);
        let payload = DispatchPayload {
            agent_id: agent_id.to_string(),
            interaction_id: ctx.interaction_id.to_string(),
            email: ctx.email.normalized(),
            sender_verified: ctx.signals.is_verified(),
            authenticity: ctx.signals,
            plan: steps,
            results,
            digest,
        };

        let (status, error) = match self.dispatcher.dispatch(&scope, ctx.workspace, &payload).await {
            Ok(receipt) => {
                warnings.extend(receipt.warning);
                (AgentStatus::Done, None)
            }
            Err(e) => (AgentStatus::Failed, Some(format!("dispatch failed: {e}"))),
        };

        AgentOutcome {
            agent_id: agent_id.to_string(),
            status,
            plan: payload.plan,
            results: payload.results,
            digest: payload.digest,
            error,
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::error::ExecutionError;
    use crate::pipeline::types::EmailHeader;
    use crate::store::{
        AuditEntry, InteractionCompletion, InteractionRecord, LibSqlBackend, ProviderCredential,
    };
    use crate::tools::{ActionResponse, ToolBinding};

    /// Fails every call; these tests never reach the execution tier.
    struct NoActions;

    #[async_trait]
    impl ActionClient for NoActions {
        async fn invoke(
            &self,
            _provider: &str,
            _action: &str,
            _args: &Value,
            _auth: &Value,
        ) -> Result<ActionResponse, ExecutionError> {
            Err(ExecutionError::Network("unexpected call".into()))
        }
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig::from_lookup(|key| match key {
            "EXECUTION_BASE_URL" => Some("http://127.0.0.1:1".into()),
            _ => None,
        })
        .unwrap()
    }

    async fn processor() -> (EmailProcessor, Arc<LibSqlBackend>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.upsert_workspace(&Workspace {
            id: "ws1".into(),
            user_id: "user-1".into(),
            reply_url: None,
            reply_token: None,
        })
        .await
        .unwrap();
        let processor = EmailProcessor::new(db.clone(), None, Arc::new(NoActions), &config());
        (processor, db)
    }

    fn email(to: &str) -> InboundEmailEvent {
        InboundEmailEvent {
            sender: "alice@example.com".into(),
            to: vec![to.into()],
            subject: "hello".into(),
            text_body: Some("please help".into()),
            message_id: Some("<m1@example.com>".into()),
            ..Default::default()
        }
    }

    /// In-memory store that can be told to fail selected calls.
    struct FaultyStore {
        inner: LibSqlBackend,
        fail_catalog: bool,
        fail_results: bool,
    }

    fn injected(what: &str) -> DatabaseError {
        DatabaseError::Query(format!("{what}: injected failure"))
    }

    #[async_trait]
    impl Database for FaultyStore {
        async fn run_migrations(&self) -> Result<(), DatabaseError> {
            self.inner.run_migrations().await
        }
        async fn upsert_workspace(&self, workspace: &Workspace) -> Result<(), DatabaseError> {
            self.inner.upsert_workspace(workspace).await
        }
        async fn get_workspace(&self, id: &str) -> Result<Option<Workspace>, DatabaseError> {
            self.inner.get_workspace(id).await
        }
        async fn add_agent_mailbox(
            &self,
            workspace_id: &str,
            agent_id: &str,
            address: &str,
        ) -> Result<(), DatabaseError> {
            self.inner.add_agent_mailbox(workspace_id, agent_id, address).await
        }
        async fn agents_for_addresses(
            &self,
            workspace_id: &str,
            addresses: &[String],
        ) -> Result<Vec<String>, DatabaseError> {
            self.inner.agents_for_addresses(workspace_id, addresses).await
        }
        async fn upsert_tool_binding(
            &self,
            workspace_id: &str,
            binding: &ToolBinding,
        ) -> Result<(), DatabaseError> {
            self.inner.upsert_tool_binding(workspace_id, binding).await
        }
        async fn link_agent_binding(
            &self,
            agent_id: &str,
            binding_id: &str,
            active: bool,
        ) -> Result<(), DatabaseError> {
            self.inner.link_agent_binding(agent_id, binding_id, active).await
        }
        async fn active_binding_ids(&self, agent_id: &str) -> Result<Vec<String>, DatabaseError> {
            if self.fail_catalog {
                return Err(injected("active_binding_ids"));
            }
            self.inner.active_binding_ids(agent_id).await
        }
        async fn tool_bindings_by_ids(
            &self,
            ids: &[String],
        ) -> Result<Vec<ToolBinding>, DatabaseError> {
            self.inner.tool_bindings_by_ids(ids).await
        }
        async fn upsert_provider_credential(
            &self,
            user_id: &str,
            provider: &str,
            secret: &Value,
        ) -> Result<(), DatabaseError> {
            self.inner.upsert_provider_credential(user_id, provider, secret).await
        }
        async fn get_provider_credential(
            &self,
            user_id: &str,
            provider: &str,
        ) -> Result<Option<ProviderCredential>, DatabaseError> {
            self.inner.get_provider_credential(user_id, provider).await
        }
        async fn append_audit(&self, entry: &AuditEntry) -> Result<(), DatabaseError> {
            self.inner.append_audit(entry).await
        }
        async fn list_audit(&self, interaction_id: &str) -> Result<Vec<AuditEntry>, DatabaseError> {
            self.inner.list_audit(interaction_id).await
        }
        async fn record_interaction(
            &self,
            workspace_id: &str,
            message_id: Option<&str>,
            raw_request: &Value,
        ) -> Result<String, DatabaseError> {
            self.inner
                .record_interaction(workspace_id, message_id, raw_request)
                .await
        }
        async fn update_interaction_results(
            &self,
            id: &str,
            results: &Value,
        ) -> Result<(), DatabaseError> {
            if self.fail_results {
                return Err(injected("update_interaction_results"));
            }
            self.inner.update_interaction_results(id, results).await
        }
        async fn finalize_interaction(
            &self,
            id: &str,
            completion: &InteractionCompletion,
        ) -> Result<(), DatabaseError> {
            self.inner.finalize_interaction(id, completion).await
        }
        async fn get_interaction(
            &self,
            id: &str,
        ) -> Result<Option<InteractionRecord>, DatabaseError> {
            self.inner.get_interaction(id).await
        }
    }

    async fn faulty_processor(
        fail_catalog: bool,
        fail_results: bool,
    ) -> (EmailProcessor, Arc<FaultyStore>) {
        let db = Arc::new(FaultyStore {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            fail_catalog,
            fail_results,
        });
        db.upsert_workspace(&Workspace {
            id: "ws1".into(),
            user_id: "user-1".into(),
            reply_url: None,
            reply_token: None,
        })
        .await
        .unwrap();
        db.add_agent_mailbox("ws1", "agent-a", "support@acme.com")
            .await
            .unwrap();
        let processor = EmailProcessor::new(db.clone(), None, Arc::new(NoActions), &config());
        (processor, db)
    }

    fn verified_email(to: &str) -> InboundEmailEvent {
        InboundEmailEvent {
            headers: vec![
                EmailHeader::new("DKIM-Signature", "v=1; d=example.com; s=sel"),
                EmailHeader::new(
                    "Authentication-Results",
                    "mx.acme.com; dkim=pass header.d=example.com; spf=pass",
                ),
            ],
            ..email(to)
        }
    }

    #[tokio::test]
    async fn catalog_failure_is_audited() {
        let (processor, db) = faulty_processor(true, false).await;
        let outcome = processor
            .process("ws1", verified_email("support@acme.com"))
            .await
            .unwrap();
        assert!(outcome.sender_verified);
        assert!(outcome.errors[0].contains("failed to load tool catalog"));

        let entries = db.list_audit(&outcome.interaction_id).await.unwrap();
        let entry = entries
            .iter()
            .find(|e| e.message == "tool catalog unavailable")
            .expect("catalog failure audited");
        assert_eq!(entry.stage, AuditStage::Plan);
        assert_eq!(entry.level, AuditLevel::Error);
        assert_eq!(entry.agent_id.as_deref(), Some("agent-a"));
        assert!(entry.detail["error"].as_str().unwrap().contains("injected"));
    }

    #[tokio::test]
    async fn failed_intermediate_write_is_audited() {
        let (processor, db) = faulty_processor(false, true).await;
        let outcome = processor
            .process("ws1", email("support@acme.com"))
            .await
            .unwrap();
        assert!(
            outcome
                .warnings
                .iter()
                .any(|w| w.contains("failed to store intermediate results"))
        );

        let entries = db.list_audit(&outcome.interaction_id).await.unwrap();
        let entry = entries
            .iter()
            .find(|e| e.message == "intermediate results not saved")
            .expect("intermediate write failure audited");
        assert_eq!(entry.stage, AuditStage::Execute);
        assert_eq!(entry.level, AuditLevel::Error);
    }

    #[tokio::test]
    async fn unknown_workspace_is_an_error() {
        let (processor, _db) = processor().await;
        let err = processor
            .process("nope", email("support@acme.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownWorkspace(ref id) if id == "nope"));
    }

    #[tokio::test]
    async fn no_matching_agent_is_soft_success() {
        let (processor, db) = processor().await;
        let outcome = processor
            .process("ws1", email("nobody@acme.com"))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.state, ProcessingState::NoAgentsMatched);
        assert!(outcome.agents.is_empty());
        assert!(outcome.warnings.iter().any(|w| w.contains("no agents matched")));
        // Headers are missing, so the sender is also unverified.
        assert!(!outcome.sender_verified);

        let entries = db.list_audit(&outcome.interaction_id).await.unwrap();
        let stages: Vec<AuditStage> = entries.iter().map(|e| e.stage).collect();
        assert_eq!(stages, vec![AuditStage::Verify, AuditStage::Resolve]);
    }

    #[tokio::test]
    async fn dispatch_failure_fails_only_that_agent() {
        let (processor, db) = processor().await;
        db.add_agent_mailbox("ws1", "agent-a", "support@acme.com")
            .await
            .unwrap();

        let outcome = processor
            .process("ws1", email("support@acme.com"))
            .await
            .unwrap();
        // No reply endpoint configured anywhere.
        assert!(!outcome.success);
        assert_eq!(outcome.state, ProcessingState::Failed);
        assert_eq!(outcome.message, "processed 0 of 1 matched agents");
        assert_eq!(outcome.agents[0].digest, digest::SKIPPED_UNVERIFIED);
        assert!(outcome.errors[0].starts_with("agent-a: dispatch failed"));
    }
}
