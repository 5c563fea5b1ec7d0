//! Shared types for the email orchestration pipeline.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::pipeline::verifier::AuthenticitySignals;

// ── Inbound email ───────────────────────────────────────────────────

/// A raw header as delivered by the inbound mail provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailHeader {
    pub name: String,
    pub value: String,
}

impl EmailHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One inbound email, as posted to the webhook. Immutable once received.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundEmailEvent {
    #[serde(alias = "from")]
    pub sender: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default, alias = "text")]
    pub text_body: Option<String>,
    #[serde(default, alias = "html")]
    pub html_body: Option<String>,
    #[serde(default)]
    pub headers: Vec<EmailHeader>,
    #[serde(default)]
    pub message_id: Option<String>,
}

impl InboundEmailEvent {
    /// Normalized sender address (display name stripped, lower-cased).
    pub fn sender_address(&self) -> String {
        normalize_address(&self.sender).unwrap_or_else(|| self.sender.trim().to_lowercase())
    }

    /// Deduplicated, lower-cased union of to/cc/bcc. Entries without an
    /// address are dropped.
    pub fn recipients(&self) -> Vec<String> {
        let set: BTreeSet<String> = self
            .to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .flat_map(|field| field.split(','))
            .filter_map(normalize_address)
            .collect();
        set.into_iter().collect()
    }

    /// Plain-text body. Falls back to the HTML body reduced to text.
    pub fn body(&self) -> String {
        if let Some(text) = self.text_body.as_deref().filter(|t| !t.trim().is_empty()) {
            return text.trim().to_string();
        }
        self.html_body
            .as_deref()
            .map(html_to_text)
            .unwrap_or_default()
    }

    /// The normalized email fields forwarded downstream.
    pub fn normalized(&self) -> serde_json::Value {
        serde_json::json!({
            "sender": self.sender_address(),
            "recipients": self.recipients(),
            "subject": self.subject,
            "body": self.body(),
            "message_id": self.message_id,
        })
    }
}

/// Extract and lower-case the address from `addr` or `Name <addr>`.
pub fn normalize_address(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let addr = match (raw.rfind('<'), raw.rfind('>')) {
        (Some(start), Some(end)) if end > start => &raw[start + 1..end],
        _ => raw,
    };
    let addr = addr.trim().trim_matches('"').to_lowercase();
    if addr.contains('@') && !addr.contains(char::is_whitespace) {
        Some(addr)
    } else {
        None
    }
}

static SCRIPT_STYLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>")
        .expect("valid script/style regex")
});
static BREAK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<br\s*/?>|</(p|div|li|tr|h[1-6])>").expect("valid break regex")
});
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid tag regex"));

/// Reduce an HTML body to readable text.
pub fn html_to_text(html: &str) -> String {
    let text = SCRIPT_STYLE_RE.replace_all(html, "");
    let text = BREAK_RE.replace_all(&text, "\n");
    let text = TAG_RE.replace_all(&text, "");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Plans and execution ─────────────────────────────────────────────

/// One step of a generated plan. `index` is zero-based and equals the
/// step's position in the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub index: usize,
    pub tool: String,
    /// Literal values or `{{steps[j].outputs.PATH}}` placeholders.
    pub args: serde_json::Map<String, serde_json::Value>,
}

/// Why planning produced no steps without asking the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Sender failed authenticity verification.
    Unverified,
    /// The agent has no usable tool bindings.
    EmptyCatalog,
    /// The email has no body to plan from.
    EmptyBody,
}

/// Result of one planning call.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanResult {
    /// Validated plan; empty means the model decided no action is needed.
    Plan(Vec<PlanStep>),
    Skipped(SkipReason),
    /// Generation failed (network, model, parse). Distinct from an empty plan.
    Failed(String),
}

impl PlanResult {
    pub fn steps(&self) -> &[PlanStep] {
        match self {
            Self::Plan(steps) => steps,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Error,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Outcome of one plan step. Exactly one per step, even on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub step: usize,
    pub tool: String,
    pub status: StepStatus,
    /// Arguments after placeholder resolution; the raw plan args when
    /// resolution failed.
    pub resolved_args: serde_json::Value,
    /// Parsed JSON body on success.
    pub response: Option<serde_json::Value>,
    pub raw_response: Option<String>,
    pub error: Option<String>,
}

impl ExecutionOutput {
    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

// ── Outcomes ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Done,
    Failed,
}

/// Terminal state of one agent pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub agent_id: String,
    pub status: AgentStatus,
    pub plan: Vec<PlanStep>,
    pub results: Vec<ExecutionOutput>,
    pub digest: String,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

/// Email-level terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Processed,
    NoAgentsMatched,
    Failed,
}

/// Aggregate result for one inbound email across all matched agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingOutcome {
    pub success: bool,
    pub state: ProcessingState,
    pub message: String,
    pub interaction_id: String,
    pub sender_verified: bool,
    pub authenticity: AuthenticitySignals,
    pub agents: Vec<AgentOutcome>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}
