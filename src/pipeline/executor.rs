//! Step executor: runs one agent's plan strictly in order.
//!
//! Per step:
//! 1. Provider credential for (user, provider), cached for the run
//! 2. Placeholder resolution against earlier outputs only; chaining
//!    errors are raised before any network call
//! 3. One remote action call
//! 4. Exactly one `ExecutionOutput` and one audit entry

use std::collections::HashMap;
use std::sync::Arc;

use secrecy::ExposeSecret;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::ExecutionError;
use crate::pipeline::audit::{AuditLog, AuditScope};
use crate::pipeline::placeholder::{Placeholder, Resolved, substitute};
use crate::pipeline::truncate_for_log;
use crate::pipeline::types::{ExecutionOutput, PlanStep, StepStatus};
use crate::store::{AuditLevel, AuditStage, Database};
use crate::tools::{ActionClient, ToolBinding, ToolCatalog};

/// Remote body kept in error messages.
const MAX_ERROR_BODY_CHARS: usize = 500;

pub struct StepExecutor {
    db: Arc<dyn Database>,
    client: Arc<dyn ActionClient>,
    audit: Arc<AuditLog>,
}

impl StepExecutor {
    pub fn new(db: Arc<dyn Database>, client: Arc<dyn ActionClient>, audit: Arc<AuditLog>) -> Self {
        Self { db, client, audit }
    }

    /// Execute `plan` sequentially. Returns one output per step.
    pub async fn execute(
        &self,
        scope: &AuditScope,
        user_id: &str,
        plan: &[PlanStep],
        catalog: &ToolCatalog,
    ) -> Vec<ExecutionOutput> {
        let mut credentials: HashMap<String, Result<Value, ExecutionError>> = HashMap::new();
        let mut outputs: Vec<ExecutionOutput> = Vec::with_capacity(plan.len());

        for (position, step) in plan.iter().enumerate() {
            let output = self
                .run_step(position, step, user_id, catalog, &outputs, &mut credentials)
                .await;

            let level = match output.status {
                StepStatus::Success => AuditLevel::Info,
                StepStatus::Error => AuditLevel::Error,
            };
            self.audit
                .record(
                    scope,
                    AuditStage::Execute,
                    level,
                    format!("step {position} ({}) {}", step.tool, output.status.as_str()),
                    json!({
                        "step": position,
                        "tool": step.tool,
                        "args": output.resolved_args,
                        "status": output.status,
                        "response": output.raw_response.as_deref().map(|r| truncate_for_log(r, MAX_ERROR_BODY_CHARS)),
                        "error": output.error,
                    }),
                )
                .await;
            outputs.push(output);
        }

        let failed = outputs.iter().filter(|o| !o.is_success()).count();
        info!(
            agent_id = ?scope.agent_id,
            steps = outputs.len(),
            failed,
            "Plan executed"
        );
        outputs
    }

    async fn run_step(
        &self,
        position: usize,
        step: &PlanStep,
        user_id: &str,
        catalog: &ToolCatalog,
        prior: &[ExecutionOutput],
        credentials: &mut HashMap<String, Result<Value, ExecutionError>>,
    ) -> ExecutionOutput {
        let raw_args = Value::Object(step.args.clone());
        let failed = |args: Value, error: ExecutionError, raw: Option<String>| ExecutionOutput {
            step: position,
            tool: step.tool.clone(),
            status: StepStatus::Error,
            resolved_args: args,
            response: None,
            raw_response: raw,
            error: Some(error.to_string()),
        };

        let Some(binding) = catalog.get(&step.tool) else {
            let error = ExecutionError::UnknownTool {
                name: step.tool.clone(),
            };
            return failed(raw_args, error, None);
        };

        let auth = match credentials.get(&binding.provider) {
            Some(cached) => cached.clone(),
            None => {
                let loaded = self.load_credential(user_id, &binding.provider).await;
                credentials.insert(binding.provider.clone(), loaded.clone());
                loaded
            }
        };
        let auth = match auth {
            Ok(auth) => auth,
            Err(error) => return failed(raw_args, error, None),
        };

        let args = match resolve_args(position, &raw_args, prior) {
            Ok(args) => args,
            Err(error) => {
                debug!(step = position, error = %error, "Chaining error");
                return failed(raw_args, error, None);
            }
        };

        match self.call(binding, &args, &auth).await {
            Ok((response, raw)) => ExecutionOutput {
                step: position,
                tool: step.tool.clone(),
                status: StepStatus::Success,
                resolved_args: args,
                response: Some(response),
                raw_response: Some(raw),
                error: None,
            },
            Err((error, raw)) => {
                warn!(step = position, tool = %step.tool, error = %error, "Step failed");
                failed(args, error, raw)
            }
        }
    }

    async fn load_credential(&self, user_id: &str, provider: &str) -> Result<Value, ExecutionError> {
        let credential = self
            .db
            .get_provider_credential(user_id, provider)
            .await
            .map_err(|e| ExecutionError::CredentialLookup {
                provider: provider.to_string(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| ExecutionError::MissingCredential {
                provider: provider.to_string(),
            })?;

        match serde_json::from_str::<Value>(credential.secret.expose_secret()) {
            Ok(value @ Value::Object(_)) => Ok(value),
            _ => Err(ExecutionError::MalformedCredential {
                provider: provider.to_string(),
            }),
        }
    }

    /// One remote call. Errors carry the raw body when one was received.
    async fn call(
        &self,
        binding: &ToolBinding,
        args: &Value,
        auth: &Value,
    ) -> Result<(Value, String), (ExecutionError, Option<String>)> {
        let response = self
            .client
            .invoke(&binding.provider, &binding.action, args, auth)
            .await
            .map_err(|e| (e, None))?;

        if !response.is_success() {
            let error = ExecutionError::Remote {
                status: response.status,
                body: truncate_for_log(&response.body, MAX_ERROR_BODY_CHARS),
            };
            return Err((error, Some(response.body)));
        }

        match serde_json::from_str::<Value>(&response.body) {
            Ok(parsed) => Ok((parsed, response.body)),
            Err(_) => {
                let error = ExecutionError::UnparseableSuccess {
                    tool: binding.name.clone(),
                    status: response.status,
                    body: truncate_for_log(&response.body, MAX_ERROR_BODY_CHARS),
                };
                Err((error, Some(response.body)))
            }
        }
    }
}

/// Resolve placeholders in `args` for the step at `position`. Each
/// placeholder reads only the single step it references, which must be
/// earlier and successful.
pub fn resolve_args(
    position: usize,
    args: &Value,
    prior: &[ExecutionOutput],
) -> Result<Value, ExecutionError> {
    let mut lookup = |placeholder: &Placeholder| -> Result<Value, ExecutionError> {
        let referenced = placeholder.step;
        let output = match prior.get(referenced) {
            Some(output) if referenced < position => output,
            _ => {
                return Err(ExecutionError::ForwardReference {
                    step: position,
                    referenced,
                });
            }
        };
        let Some(response) = output.response.as_ref().filter(|_| output.is_success()) else {
            return Err(ExecutionError::FailedDependency {
                step: position,
                referenced,
            });
        };
        match placeholder.resolve(response) {
            Resolved::Found(value) => Ok(value.clone()),
            Resolved::NotFound => Err(ExecutionError::UnresolvedPlaceholder {
                step: position,
                referenced,
                path: placeholder.raw_path.clone(),
            }),
        }
    };
    substitute(args, &mut lookup)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::store::LibSqlBackend;
    use crate::tools::ActionResponse;

    /// Scripted action client: replies per action, records calls.
    struct ScriptedClient {
        replies: HashMap<String, ActionResponse>,
        calls: Mutex<Vec<(String, Value, Value)>>,
    }

    impl ScriptedClient {
        fn new(replies: &[(&str, u16, &str)]) -> Arc<Self> {
            Arc::new(Self {
                replies: replies
                    .iter()
                    .map(|(action, status, body)| {
                        (
                            action.to_string(),
                            ActionResponse {
                                status: *status,
                                body: body.to_string(),
                            },
                        )
                    })
                    .collect(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn called_actions(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|c| c.0.clone()).collect()
        }
    }

    #[async_trait]
    impl ActionClient for ScriptedClient {
        async fn invoke(
            &self,
            provider: &str,
            action: &str,
            args: &Value,
            auth: &Value,
        ) -> Result<ActionResponse, ExecutionError> {
            self.calls
                .lock()
                .unwrap()
                .push((format!("{provider}/{action}"), args.clone(), auth.clone()));
            self.replies
                .get(action)
                .cloned()
                .ok_or_else(|| ExecutionError::Network("connection refused".into()))
        }
    }

    fn binding(name: &str, provider: &str) -> ToolBinding {
        ToolBinding {
            id: format!("b-{name}"),
            name: name.into(),
            provider: provider.into(),
            action: name.into(),
            instructions: String::new(),
            input_schema: json!([]),
            output_schema: json!([]),
            active: true,
        }
    }

    fn step(index: usize, tool: &str, args: Value) -> PlanStep {
        let Value::Object(args) = args else {
            panic!("args must be an object")
        };
        PlanStep {
            index,
            tool: tool.into(),
            args,
        }
    }

    async fn setup(client: Arc<ScriptedClient>) -> (StepExecutor, Arc<LibSqlBackend>, ToolCatalog) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.upsert_provider_credential("user-1", "stripe", &json!({"api_key": "sk_live"}))
            .await
            .unwrap();
        db.upsert_provider_credential("user-1", "shop", &json!({"token": "t"}))
            .await
            .unwrap();
        let audit = Arc::new(AuditLog::new(db.clone(), Duration::from_secs(1)));
        let executor = StepExecutor::new(db.clone(), client, audit);
        let catalog = ToolCatalog::from_bindings(vec![
            binding("find_customer", "stripe"),
            binding("refund", "stripe"),
            binding("list_orders", "shop"),
            binding("unauthorized", "zendesk"),
        ]);
        (executor, db, catalog)
    }

    fn scope() -> AuditScope {
        AuditScope::new("ws1", "int-1").for_agent("agent-a")
    }

    #[tokio::test]
    async fn chains_outputs_between_steps() {
        let client = ScriptedClient::new(&[
            ("find_customer", 200, r#"{"id": "cus_123"}"#),
            ("refund", 200, r#"{"refunded": true}"#),
        ]);
        let (executor, db, catalog) = setup(client.clone()).await;
        let plan = vec![
            step(0, "find_customer", json!({"email": "a@x.com"})),
            step(1, "refund", json!({"customer": "{{steps[0].outputs.id}}", "amount": 500})),
        ];

        let outputs = executor.execute(&scope(), "user-1", &plan, &catalog).await;
        assert_eq!(outputs.len(), 2);
        assert!(outputs.iter().all(ExecutionOutput::is_success));
        assert_eq!(outputs[1].resolved_args["customer"], "cus_123");
        assert_eq!(outputs[1].resolved_args["amount"], 500);
        assert_eq!(outputs[1].response.as_ref().unwrap()["refunded"], true);

        let calls = client.calls.lock().unwrap();
        assert_eq!(calls[1].2["api_key"], "sk_live");
        drop(calls);

        assert_eq!(db.list_audit("int-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn indexed_path_and_out_of_range_index() {
        let client = ScriptedClient::new(&[
            ("list_orders", 200, r#"{"orders": [{"id": 101}, {"id": 102}]}"#),
            ("refund", 200, r#"{"ok": true}"#),
        ]);
        let (executor, _db, catalog) = setup(client.clone()).await;
        let plan = vec![
            step(0, "list_orders", json!({})),
            step(1, "refund", json!({"order": "{{steps[0].outputs.orders[1].id}}"})),
            step(2, "refund", json!({"order": "{{steps[0].outputs.orders[5].id}}"})),
        ];

        let outputs = executor.execute(&scope(), "user-1", &plan, &catalog).await;
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[1].resolved_args["order"], 102);
        assert_eq!(outputs[2].status, StepStatus::Error);
        assert!(outputs[2].error.as_ref().unwrap().contains("orders[5].id"));
        // Step 2 never reached the network.
        assert_eq!(client.called_actions(), vec!["shop/list_orders", "stripe/refund"]);
    }

    #[tokio::test]
    async fn forward_and_self_references_are_rejected() {
        let client = ScriptedClient::new(&[("refund", 200, "{}")]);
        let (executor, _db, catalog) = setup(client.clone()).await;
        let plan = vec![
            step(0, "refund", json!({"c": "{{steps[0].outputs.id}}"})),
            step(1, "refund", json!({"c": "{{steps[3].outputs.id}}"})),
        ];

        let outputs = executor.execute(&scope(), "user-1", &plan, &catalog).await;
        assert_eq!(outputs.len(), 2);
        assert!(outputs.iter().all(|o| o.status == StepStatus::Error));
        assert!(outputs[0].error.as_ref().unwrap().contains("has not run yet"));
        assert!(client.called_actions().is_empty());
    }

    #[tokio::test]
    async fn oversized_step_index_is_a_forward_reference() {
        let client = ScriptedClient::new(&[("refund", 200, "{}")]);
        let (executor, _db, catalog) = setup(client.clone()).await;
        let plan = vec![step(
            0,
            "refund",
            json!({"c": "{{steps[99999999999999999999999].outputs.id}}"}),
        )];

        let outputs = executor.execute(&scope(), "user-1", &plan, &catalog).await;
        assert_eq!(outputs[0].status, StepStatus::Error);
        assert!(outputs[0].error.as_ref().unwrap().contains("has not run yet"));
        assert!(client.called_actions().is_empty());
    }

    #[tokio::test]
    async fn dependency_on_failed_step_is_poisoned() {
        let client = ScriptedClient::new(&[
            ("find_customer", 500, r#"{"error": "boom"}"#),
            ("list_orders", 200, r#"{"orders": []}"#),
        ]);
        let (executor, _db, catalog) = setup(client.clone()).await;
        let plan = vec![
            step(0, "find_customer", json!({})),
            step(1, "refund", json!({"c": "{{steps[0].outputs.id}}"})),
            step(2, "list_orders", json!({})),
        ];

        let outputs = executor.execute(&scope(), "user-1", &plan, &catalog).await;
        assert_eq!(outputs[0].status, StepStatus::Error);
        assert!(outputs[0].response.is_none());
        let message = outputs[0].error.as_ref().unwrap();
        assert!(message.contains("HTTP 500"));
        assert!(message.contains("boom"));
        assert!(outputs[1].error.as_ref().unwrap().contains("which failed"));
        // Independent step still runs.
        assert!(outputs[2].is_success());
    }

    #[tokio::test]
    async fn non_json_success_is_an_error() {
        let client = ScriptedClient::new(&[("list_orders", 200, "<html>ok</html>")]);
        let (executor, _db, catalog) = setup(client).await;
        let plan = vec![step(0, "list_orders", json!({}))];
        let outputs = executor.execute(&scope(), "user-1", &plan, &catalog).await;
        assert_eq!(outputs[0].status, StepStatus::Error);
        assert!(outputs[0].error.as_ref().unwrap().contains("unparseable"));
        assert_eq!(outputs[0].raw_response.as_deref(), Some("<html>ok</html>"));
    }

    #[tokio::test]
    async fn missing_credential_and_unknown_tool() {
        let client = ScriptedClient::new(&[]);
        let (executor, _db, catalog) = setup(client.clone()).await;
        let plan = vec![
            step(0, "unauthorized", json!({})),
            step(1, "not_in_catalog", json!({})),
            step(2, "unauthorized", json!({})),
        ];
        let outputs = executor.execute(&scope(), "user-1", &plan, &catalog).await;
        assert_eq!(outputs.len(), 3);
        assert!(outputs[0].error.as_ref().unwrap().contains("zendesk"));
        assert!(outputs[1].error.as_ref().unwrap().contains("not in the catalog"));
        assert_eq!(outputs[2].error, outputs[0].error);
        assert!(client.called_actions().is_empty());
    }

    #[tokio::test]
    async fn network_failure_recorded_per_step() {
        let client = ScriptedClient::new(&[]);
        let (executor, _db, catalog) = setup(client).await;
        let plan = vec![step(0, "refund", json!({}))];
        let outputs = executor.execute(&scope(), "user-1", &plan, &catalog).await;
        assert_eq!(outputs[0].status, StepStatus::Error);
        assert!(outputs[0].error.as_ref().unwrap().contains("connection refused"));
        assert!(outputs[0].raw_response.is_none());
    }

    #[test]
    fn null_output_value_is_substituted() {
        let prior = vec![ExecutionOutput {
            step: 0,
            tool: "t".into(),
            status: StepStatus::Success,
            resolved_args: json!({}),
            response: Some(json!({"note": null})),
            raw_response: None,
            error: None,
        }];
        let args = resolve_args(1, &json!({"n": "{{steps[0].outputs.note}}"}), &prior).unwrap();
        assert_eq!(args["n"], Value::Null);
    }
}
