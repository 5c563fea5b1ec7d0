//! Email orchestration pipeline.
//!
//! verify → resolve agents → per-agent fan-out of
//! (catalog → plan → execute → digest → dispatch) → aggregate outcome.

pub mod agents;
pub mod audit;
pub mod digest;
pub mod dispatcher;
pub mod executor;
pub mod placeholder;
pub mod planner;
pub mod processor;
pub mod types;
pub mod verifier;

pub use agents::AgentResolver;
pub use audit::{AuditLog, AuditScope};
pub use dispatcher::{DispatchPayload, Dispatcher};
pub use executor::StepExecutor;
pub use planner::PlanGenerator;
pub use processor::EmailProcessor;
pub use types::{
    AgentOutcome, AgentStatus, EmailHeader, ExecutionOutput, InboundEmailEvent, PlanResult,
    PlanStep, ProcessingOutcome, ProcessingState, SkipReason, StepStatus,
};
pub use verifier::AuthenticitySignals;

/// Cut long text (model output, remote bodies) to `max_chars` characters.
pub(crate) fn truncate_for_log(input: &str, max_chars: usize) -> String {
    let char_count = input.chars().count();
    if char_count <= max_chars {
        return input.to_string();
    }
    let mut preview: String = input.chars().take(max_chars).collect();
    preview.push_str(&format!("... [truncated, total_chars={char_count}]"));
    preview
}
