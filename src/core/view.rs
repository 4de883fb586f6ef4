//! Reconstructed run summaries produced by replay.
//!
//! These types define stable, deterministic outputs: lists are recorded in
//! log order, and the same log bytes always reconstruct the same view.

use serde::Serialize;

use crate::core::ident::RunId;
use crate::core::phase::Phase;

/// Terminal state of a replayed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    /// The log has no terminal event yet.
    Running,
    Finished,
    Failed,
}

/// Terminal state of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Running,
    Finished,
    Failed,
}

/// Terminal state of a tool or LLM call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    Open,
    Completed,
    Failed,
}

/// One LLM round-trip within a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LlmCallView {
    pub outcome: CallOutcome,
}

/// One tool invocation within a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCallView {
    pub tool_name: String,
    pub outcome: CallOutcome,
    pub failure_reason: Option<String>,
}

/// One step of a run, with everything scoped to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepView {
    pub step_id: String,
    pub phase: Phase,
    pub outcome: StepOutcome,
    pub failure_reason: Option<String>,
    /// LLM calls in the order they were requested.
    pub llm_calls: Vec<LlmCallView>,
    /// Tool calls in the order they were issued.
    pub tool_calls: Vec<ToolCallView>,
    /// Workspace-relative artifact paths, lexically cleaned, in creation order.
    pub artifacts: Vec<String>,
}

/// Reconstructed view of one run, derived entirely from its log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunView {
    pub run_id: RunId,
    pub workspace_root: String,
    pub last_seq: u64,
    pub outcome: RunOutcome,
    pub failure_reason: Option<String>,
    /// Steps in the order they started.
    pub steps: Vec<StepView>,
}

impl RunView {
    /// Look up a step by id.
    pub fn step(&self, step_id: &str) -> Option<&StepView> {
        self.steps.iter().find(|step| step.step_id == step_id)
    }

    /// Number of started steps tagged with `phase`.
    pub fn attempts_in(&self, phase: Phase) -> usize {
        self.steps.iter().filter(|step| step.phase == phase).count()
    }
}
