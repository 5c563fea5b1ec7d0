//! Plan generator: asks the model for an ordered list of tool calls.
//!
//! Flow:
//! 1. Short-circuit (no model call) on an empty catalog or empty body
//! 2. One completion request with the email and the serialized catalog
//! 3. Extract and validate the JSON plan against the catalog
//!
//! Every invocation is written to the audit log with the prompt, raw model
//! output, derived plan, and error detail.

use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};

use crate::config::PlannerConfig;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::audit::{AuditLog, AuditScope};
use crate::pipeline::placeholder::rewrite_references;
use crate::pipeline::truncate_for_log;
use crate::pipeline::types::{InboundEmailEvent, PlanResult, PlanStep, SkipReason};
use crate::store::{AuditLevel, AuditStage};
use crate::tools::ToolCatalog;

/// Model output kept in tracing fields.
const MAX_OUTPUT_LOG_CHARS: usize = 2000;

pub struct PlanGenerator {
    /// `None` when no model credential is configured.
    llm: Option<Arc<dyn LlmProvider>>,
    config: PlannerConfig,
    audit: Arc<AuditLog>,
}

impl PlanGenerator {
    pub fn new(
        llm: Option<Arc<dyn LlmProvider>>,
        config: PlannerConfig,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self { llm, config, audit }
    }

    /// Produce a plan for one agent. Never fails: generation problems
    /// come back as `PlanResult::Failed`.
    pub async fn generate(
        &self,
        scope: &AuditScope,
        email: &InboundEmailEvent,
        catalog: &ToolCatalog,
    ) -> PlanResult {
        let body = email.body();
        let skip = if catalog.is_empty() {
            Some(SkipReason::EmptyCatalog)
        } else if body.trim().is_empty() {
            Some(SkipReason::EmptyBody)
        } else {
            None
        };
        if let Some(reason) = skip {
            debug!(agent_id = ?scope.agent_id, ?reason, "Skipping plan generation");
            self.audit
                .record(
                    scope,
                    AuditStage::Plan,
                    AuditLevel::Info,
                    "plan generation skipped",
                    json!({ "reason": reason, "tools": catalog.len() }),
                )
                .await;
            return PlanResult::Skipped(reason);
        }

        let Some(llm) = &self.llm else {
            let reason = "no model credential configured".to_string();
            error!(agent_id = ?scope.agent_id, "Plan generation failed: {reason}");
            self.audit
                .record(
                    scope,
                    AuditStage::Plan,
                    AuditLevel::Error,
                    "plan generation failed",
                    json!({ "error": reason }),
                )
                .await;
            return PlanResult::Failed(reason);
        };

        let system = build_system_prompt();
        let user = build_user_prompt(email, &body, catalog, self.config.max_body_chars);
        let prompt = json!({ "system": system, "user": user });
        let request = CompletionRequest::new(vec![ChatMessage::system(system), ChatMessage::user(user)])
            .with_temperature(self.config.temperature)
            .with_max_tokens(self.config.max_tokens);

        info!(
            agent_id = ?scope.agent_id,
            model = llm.model_name(),
            tools = catalog.len(),
            "Requesting plan"
        );

        let response = match llm.complete(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(agent_id = ?scope.agent_id, error = %e, "Model call failed");
                let reason = format!("model call failed: {e}");
                self.audit
                    .record(
                        scope,
                        AuditStage::Plan,
                        AuditLevel::Error,
                        "plan generation failed",
                        json!({ "model": llm.model_name(), "prompt": prompt, "error": reason }),
                    )
                    .await;
                return PlanResult::Failed(reason);
            }
        };

        let cost = llm.cost_of(&response);
        let usage = json!({
            "model": llm.model_name(),
            "input_tokens": response.input_tokens,
            "output_tokens": response.output_tokens,
            "cost": cost.to_string(),
        });

        match parse_plan(&response.content, catalog) {
            Ok(parsed) => {
                for reason in &parsed.dropped {
                    warn!(agent_id = ?scope.agent_id, "Dropped plan step: {reason}");
                }
                info!(
                    agent_id = ?scope.agent_id,
                    steps = parsed.steps.len(),
                    dropped = parsed.dropped.len(),
                    "Plan generated"
                );
                let level = if parsed.dropped.is_empty() {
                    AuditLevel::Info
                } else {
                    AuditLevel::Warn
                };
                self.audit
                    .record(
                        scope,
                        AuditStage::Plan,
                        level,
                        "plan generated",
                        json!({
                            "prompt": prompt,
                            "raw_output": response.content,
                            "plan": parsed.steps,
                            "dropped": parsed.dropped,
                            "usage": usage,
                        }),
                    )
                    .await;
                PlanResult::Plan(parsed.steps)
            }
            Err(reason) => {
                warn!(
                    agent_id = ?scope.agent_id,
                    raw_output = %truncate_for_log(&response.content, MAX_OUTPUT_LOG_CHARS),
                    "Unparseable plan: {reason}"
                );
                let reason = format!("unparseable model output: {reason}");
                self.audit
                    .record(
                        scope,
                        AuditStage::Plan,
                        AuditLevel::Error,
                        "plan generation failed",
                        json!({
                            "prompt": prompt,
                            "raw_output": response.content,
                            "error": reason,
                            "usage": usage,
                        }),
                    )
                    .await;
                PlanResult::Failed(reason)
            }
        }
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_system_prompt() -> String {
    "You plan tool calls for an automated email assistant. Given an email and a catalog \
     of tools, decide which tools to call and in what order.\n\n\
     Respond with ONLY a JSON array. Each element is {\"tool\": \"<name>\", \"args\": {...}}.\n\n\
     Rules:\n\
     - Use only tool names from the catalog, and only the argument keys a tool declares\n\
     - Argument values are literals, or strings of the form \"{{steps[N].outputs.FIELD}}\" \
     to use an earlier step's output\n\
     - N is the zero-based index of an EARLIER step; never reference the current or a later step\n\
     - FIELD is one of that tool's declared outputs; nested fields and array indices are \
     allowed, e.g. \"{{steps[0].outputs.orders[1].id}}\"\n\
     - If no action is needed, respond with []"
        .to_string()
}

fn build_user_prompt(
    email: &InboundEmailEvent,
    body: &str,
    catalog: &ToolCatalog,
    max_body_chars: usize,
) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(&format!("From: {}\n", email.sender_address()));
    if !email.subject.is_empty() {
        prompt.push_str(&format!("Subject: {}\n", email.subject));
    }

    let body_preview: String = body.chars().take(max_body_chars).collect();
    prompt.push_str(&format!("\nEmail:\n{body_preview}\n"));

    let tools = serde_json::to_string_pretty(&catalog.prompt_json()).unwrap_or_default();
    prompt.push_str(&format!("\nTools:\n{tools}"));
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

/// A validated plan plus the reasons for any discarded entries.
#[derive(Debug, Default)]
pub struct ParsedPlan {
    pub steps: Vec<PlanStep>,
    pub dropped: Vec<String>,
}

/// Parse model output into plan steps.
///
/// Accepts a bare array or a `{"plan": [...]}` envelope, optionally wrapped
/// in markdown fences or prose. Entries that are not objects, lack a
/// `tool`, name a tool outside the catalog, or carry non-object `args` are
/// dropped. Kept steps are renumbered and their placeholder references
/// rewritten; a reference to a dropped step points at the referencing
/// step itself so execution rejects it.
pub fn parse_plan(raw: &str, catalog: &ToolCatalog) -> Result<ParsedPlan, String> {
    let json_str = extract_json(raw).ok_or("model output did not contain JSON")?;
    let value: Value =
        serde_json::from_str(&json_str).map_err(|e| format!("invalid JSON: {e}"))?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("plan") {
            Some(Value::Array(items)) => items,
            _ => return Err("expected a JSON array of steps".into()),
        },
        _ => return Err("expected a JSON array of steps".into()),
    };

    let mut remap: Vec<Option<usize>> = vec![None; items.len()];
    let mut kept = Vec::new();
    let mut dropped = Vec::new();
    for (original, item) in items.into_iter().enumerate() {
        match validate_step(item, catalog) {
            Ok(step) => {
                remap[original] = Some(kept.len());
                kept.push(step);
            }
            Err(reason) => dropped.push(format!("step {original}: {reason}")),
        }
    }

    let steps = kept
        .into_iter()
        .enumerate()
        .map(|(index, (tool, mut args))| {
            let remap_fn = |j: usize| remap.get(j).copied().flatten().unwrap_or(index);
            for value in args.values_mut() {
                rewrite_references(value, &remap_fn);
            }
            PlanStep { index, tool, args }
        })
        .collect();

    Ok(ParsedPlan { steps, dropped })
}

fn validate_step(item: Value, catalog: &ToolCatalog) -> Result<(String, Map<String, Value>), String> {
    let Value::Object(mut map) = item else {
        return Err("not an object".into());
    };
    let tool = match map.get("tool").and_then(Value::as_str) {
        Some(tool) => tool.to_string(),
        None => return Err("missing tool name".into()),
    };
    if !catalog.contains(&tool) {
        return Err(format!("unknown tool '{tool}'"));
    }
    let args = match map.remove("args") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(args)) => args,
        Some(_) => return Err(format!("args for '{tool}' is not an object")),
    };
    Ok((tool, args))
}

/// Extract a JSON array or object from model output (handles markdown wrapping).
fn extract_json(text: &str) -> Option<String> {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('[') || inner.starts_with('{') {
                return Some(inner.to_string());
            }
        }
    }

    // Outermost array and outermost object spans, earliest first. The first
    // one that parses wins, so stray braces in prose do not hide a plan.
    let mut candidates: Vec<(usize, &str)> = [('[', ']'), ('{', '}')]
        .into_iter()
        .filter_map(|(open, close)| {
            let start = trimmed.find(open)?;
            let end = trimmed.rfind(close)?;
            (end > start).then(|| (start, &trimmed[start..=end]))
        })
        .collect();
    candidates.sort_by_key(|(start, _)| *start);
    let candidates: Vec<&str> = candidates.into_iter().map(|(_, c)| c).collect();
    candidates
        .iter()
        .find(|c| serde_json::from_str::<Value>(c).is_ok())
        .or(candidates.first())
        .map(|c| c.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::error::LlmError;
    use crate::llm::provider::{CompletionResponse, FinishReason};
    use crate::store::{Database, LibSqlBackend};
    use crate::tools::ToolBinding;

    /// Returns a canned completion and records every request.
    struct ScriptedLlm {
        reply: Result<String, ()>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedLlm {
        fn replying(text: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(text.to_string()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                reply: Err(()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }

        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (dec!(0.001), dec!(0.002))
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.requests.lock().unwrap().push(request);
            match &self.reply {
                Ok(text) => Ok(CompletionResponse {
                    content: text.clone(),
                    input_tokens: 100,
                    output_tokens: 10,
                    finish_reason: FinishReason::Stop,
                    response_id: None,
                }),
                Err(()) => Err(LlmError::RequestFailed {
                    provider: "scripted".into(),
                    reason: "connection reset".into(),
                }),
            }
        }
    }

    fn binding(name: &str) -> ToolBinding {
        ToolBinding {
            id: format!("b-{name}"),
            name: name.into(),
            provider: "crm".into(),
            action: name.into(),
            instructions: format!("Use {name}"),
            input_schema: json!(["email"]),
            output_schema: json!(["id", "orders"]),
            active: true,
        }
    }

    fn catalog() -> ToolCatalog {
        ToolCatalog::from_bindings(vec![binding("lookup"), binding("refund")])
    }

    fn email(body: &str) -> InboundEmailEvent {
        InboundEmailEvent {
            sender: "Alice <alice@example.com>".into(),
            to: vec!["support@acme.com".into()],
            subject: "Refund please".into(),
            text_body: Some(body.into()),
            ..Default::default()
        }
    }

    async fn generator(llm: Option<Arc<dyn LlmProvider>>) -> (PlanGenerator, Arc<LibSqlBackend>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let audit = Arc::new(AuditLog::new(db.clone(), Duration::from_secs(1)));
        (PlanGenerator::new(llm, PlannerConfig::default(), audit), db)
    }

    fn scope() -> AuditScope {
        AuditScope::new("ws1", "int-1").for_agent("agent-a")
    }

    // ── Parsing ─────────────────────────────────────────────────────

    #[test]
    fn parses_fenced_array() {
        let raw = "Here you go:\n```json\n[{\"tool\": \"lookup\", \"args\": {\"email\": \"a@x.com\"}}]\n```";
        let parsed = parse_plan(raw, &catalog()).unwrap();
        assert_eq!(parsed.steps.len(), 1);
        assert_eq!(parsed.steps[0].tool, "lookup");
        assert_eq!(parsed.steps[0].args["email"], "a@x.com");
    }

    #[test]
    fn braces_in_prose_do_not_hide_the_plan() {
        let raw = "I will call {lookup} first, then: [{\"tool\": \"lookup\", \"args\": {\"email\": \"a@x.com\"}}]";
        let parsed = parse_plan(raw, &catalog()).unwrap();
        assert_eq!(parsed.steps.len(), 1);
        assert_eq!(parsed.steps[0].args["email"], "a@x.com");
    }

    #[test]
    fn unwraps_plan_envelope() {
        let raw = r#"{"plan": [{"tool": "lookup"}, {"tool": "refund", "args": null}]}"#;
        let parsed = parse_plan(raw, &catalog()).unwrap();
        assert_eq!(parsed.steps.len(), 2);
        assert!(parsed.steps[1].args.is_empty());
    }

    #[test]
    fn empty_array_is_a_valid_plan() {
        let parsed = parse_plan("[]", &catalog()).unwrap();
        assert!(parsed.steps.is_empty());
        assert!(parsed.dropped.is_empty());
    }

    #[test]
    fn drops_unknown_and_malformed_steps_and_renumbers() {
        let raw = r#"[
            {"tool": "delete_everything", "args": {}},
            {"tool": "lookup", "args": {"email": "a@x.com"}},
            "not a step",
            {"args": {}},
            {"tool": "refund", "args": "oops"},
            {"tool": "refund", "args": {"customer": "{{steps[1].outputs.id}}"}}
        ]"#;
        let parsed = parse_plan(raw, &catalog()).unwrap();
        assert_eq!(parsed.dropped.len(), 4);
        assert!(parsed.dropped[0].contains("unknown tool 'delete_everything'"));
        assert_eq!(parsed.steps.len(), 2);
        assert_eq!(parsed.steps[0].index, 0);
        assert_eq!(parsed.steps[1].index, 1);
        assert_eq!(parsed.steps[1].args["customer"], "{{steps[0].outputs.id}}");
    }

    #[test]
    fn reference_to_dropped_step_points_at_itself() {
        let raw = r#"[
            {"tool": "unknown"},
            {"tool": "refund", "args": {"customer": "{{steps[0].outputs.id}}"}}
        ]"#;
        let parsed = parse_plan(raw, &catalog()).unwrap();
        assert_eq!(parsed.steps.len(), 1);
        assert_eq!(parsed.steps[0].args["customer"], "{{steps[0].outputs.id}}");
    }

    #[test]
    fn rejects_non_plan_json() {
        assert!(parse_plan(r#"{"steps": []}"#, &catalog()).is_err());
        assert!(parse_plan("I cannot help with that.", &catalog()).is_err());
        assert!(parse_plan("[{\"tool\": ", &catalog()).is_err());
    }

    #[test]
    fn user_prompt_truncates_body_and_lists_tools() {
        let body = "x".repeat(5000);
        let prompt = build_user_prompt(&email(&body), &body, &catalog(), 100);
        assert!(prompt.contains("From: alice@example.com"));
        assert!(prompt.contains("Subject: Refund please"));
        assert!(prompt.contains("\"lookup\""));
        assert!(prompt.contains("\"orders\""));
        assert!(!prompt.contains(&"x".repeat(101)));
    }

    // ── Generation ──────────────────────────────────────────────────

    #[tokio::test]
    async fn empty_catalog_skips_model() {
        let llm = ScriptedLlm::replying("[]");
        let (planner, _db) = generator(Some(llm.clone())).await;
        let result = planner
            .generate(&scope(), &email("refund"), &ToolCatalog::default())
            .await;
        assert_eq!(result, PlanResult::Skipped(SkipReason::EmptyCatalog));
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn empty_body_skips_model() {
        let llm = ScriptedLlm::replying("[]");
        let (planner, _db) = generator(Some(llm.clone())).await;
        let result = planner.generate(&scope(), &email("  "), &catalog()).await;
        assert_eq!(result, PlanResult::Skipped(SkipReason::EmptyBody));
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn missing_model_is_generation_failure() {
        let (planner, db) = generator(None).await;
        let result = planner.generate(&scope(), &email("refund"), &catalog()).await;
        assert!(matches!(result, PlanResult::Failed(ref r) if r.contains("no model")));
        let entries = db.list_audit("int-1").await.unwrap();
        assert_eq!(entries[0].level, AuditLevel::Error);
    }

    #[tokio::test]
    async fn model_error_is_generation_failure() {
        let (planner, _db) = generator(Some(ScriptedLlm::failing())).await;
        let result = planner.generate(&scope(), &email("refund"), &catalog()).await;
        assert!(matches!(result, PlanResult::Failed(ref r) if r.contains("connection reset")));
    }

    #[tokio::test]
    async fn model_saying_no_action_is_empty_plan() {
        let (planner, _db) = generator(Some(ScriptedLlm::replying("[]"))).await;
        let result = planner.generate(&scope(), &email("thanks!"), &catalog()).await;
        assert_eq!(result, PlanResult::Plan(vec![]));
    }

    #[tokio::test]
    async fn successful_plan_is_audited_with_usage() {
        let llm = ScriptedLlm::replying(r#"[{"tool": "lookup", "args": {"email": "alice@example.com"}}]"#);
        let (planner, db) = generator(Some(llm.clone())).await;
        let result = planner.generate(&scope(), &email("refund"), &catalog()).await;
        assert_eq!(result.steps().len(), 1);

        let request = &llm.requests.lock().unwrap()[0];
        assert_eq!(request.temperature, Some(0.0));
        assert_eq!(request.messages.len(), 2);

        let entries = db.list_audit("int-1").await.unwrap();
        assert_eq!(entries.len(), 1);
        let detail = &entries[0].detail;
        assert_eq!(detail["plan"][0]["tool"], "lookup");
        assert_eq!(detail["usage"]["input_tokens"], 100);
        assert_eq!(detail["usage"]["cost"], "0.120");
        assert!(detail["prompt"]["user"].as_str().unwrap().contains("refund"));
    }
}
