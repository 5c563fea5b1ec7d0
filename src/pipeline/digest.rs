//! Digest rendering: one text block per executed step.

use crate::pipeline::types::{ExecutionOutput, PlanResult, SkipReason};
use crate::tools::ToolCatalog;

pub const NO_ACTION: &str = "No action necessary.";
pub const SKIPPED_UNVERIFIED: &str = "Skipped: sender not verified.";
pub const SKIPPED_NO_CATALOG: &str = "Skipped: no credentials or tool catalog configured.";
pub const GENERATION_FAILED: &str = "Plan generation failed; no actions were taken.";

/// Render the digest for a planning result and its execution outputs.
pub fn render(plan: &PlanResult, outputs: &[ExecutionOutput], catalog: &ToolCatalog) -> String {
    match plan {
        PlanResult::Skipped(SkipReason::Unverified) => SKIPPED_UNVERIFIED.to_string(),
        PlanResult::Skipped(SkipReason::EmptyCatalog) => SKIPPED_NO_CATALOG.to_string(),
        PlanResult::Skipped(SkipReason::EmptyBody) => NO_ACTION.to_string(),
        PlanResult::Failed(_) => GENERATION_FAILED.to_string(),
        PlanResult::Plan(_) if outputs.is_empty() => NO_ACTION.to_string(),
        PlanResult::Plan(_) => outputs
            .iter()
            .map(|output| render_block(output, catalog))
            .collect::<Vec<_>>()
            .join("\n\n"),
    }
}

fn render_block(output: &ExecutionOutput, catalog: &ToolCatalog) -> String {
    let instructions = catalog
        .get(&output.tool)
        .map(|b| b.instructions.as_str())
        .unwrap_or_default();
    let result = match (&output.response, &output.error) {
        (_, Some(error)) => error.clone(),
        (Some(response), None) => response.to_string(),
        (None, None) => String::new(),
    };
    format!(
        "Tool: {}\nInstructions: {}\nArguments: {}\nStatus: {}\nOutput: {}",
        output.tool,
        instructions,
        output.resolved_args,
        output.status.as_str(),
        result
    )
}
