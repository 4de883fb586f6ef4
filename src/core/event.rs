//! The closed event catalog written to and read from run logs.
//!
//! Twelve variants, fixed at compile time. Replay recognizes exactly these
//! tags and fails on anything else; there is no dynamic registration. The
//! discriminator and `seq` are only ever assigned by the log writer through
//! [`crate::core::format`].

use serde::{Deserialize, Serialize};

use crate::core::ident::RunId;
use crate::core::phase::Phase;

/// One fully-formed log record: envelope (`type`, `seq`, `run_id`) plus the
/// variant's payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "run.started")]
    RunStarted {
        seq: u64,
        run_id: RunId,
        workspace_root: String,
    },
    #[serde(rename = "run.finished")]
    RunFinished { seq: u64, run_id: RunId },
    #[serde(rename = "run.failed")]
    RunFailed {
        seq: u64,
        run_id: RunId,
        reason: String,
    },
    #[serde(rename = "step.started")]
    StepStarted {
        seq: u64,
        run_id: RunId,
        step_id: String,
        phase: Phase,
    },
    #[serde(rename = "step.finished")]
    StepFinished {
        seq: u64,
        run_id: RunId,
        step_id: String,
        phase: Phase,
    },
    #[serde(rename = "step.failed")]
    StepFailed {
        seq: u64,
        run_id: RunId,
        step_id: String,
        phase: Phase,
        reason: String,
    },
    #[serde(rename = "llm.requested")]
    LlmRequested {
        seq: u64,
        run_id: RunId,
        step_id: String,
    },
    #[serde(rename = "llm.responded")]
    LlmResponded {
        seq: u64,
        run_id: RunId,
        step_id: String,
    },
    #[serde(rename = "tool.called")]
    ToolCalled {
        seq: u64,
        run_id: RunId,
        step_id: String,
        tool_name: String,
    },
    #[serde(rename = "tool.returned")]
    ToolReturned {
        seq: u64,
        run_id: RunId,
        step_id: String,
        tool_name: String,
    },
    #[serde(rename = "tool.failed")]
    ToolFailed {
        seq: u64,
        run_id: RunId,
        step_id: String,
        tool_name: String,
        reason: String,
    },
    #[serde(rename = "artifact.created")]
    ArtifactCreated {
        seq: u64,
        run_id: RunId,
        step_id: String,
        path: String,
    },
}

impl Event {
    /// The string discriminator for this variant.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Event::RunStarted { .. } => "run.started",
            Event::RunFinished { .. } => "run.finished",
            Event::RunFailed { .. } => "run.failed",
            Event::StepStarted { .. } => "step.started",
            Event::StepFinished { .. } => "step.finished",
            Event::StepFailed { .. } => "step.failed",
            Event::LlmRequested { .. } => "llm.requested",
            Event::LlmResponded { .. } => "llm.responded",
            Event::ToolCalled { .. } => "tool.called",
            Event::ToolReturned { .. } => "tool.returned",
            Event::ToolFailed { .. } => "tool.failed",
            Event::ArtifactCreated { .. } => "artifact.created",
        }
    }

    /// Writer-assigned sequence number, strictly increasing within a run.
    pub fn seq(&self) -> u64 {
        match self {
            Event::RunStarted { seq, .. }
            | Event::RunFinished { seq, .. }
            | Event::RunFailed { seq, .. }
            | Event::StepStarted { seq, .. }
            | Event::StepFinished { seq, .. }
            | Event::StepFailed { seq, .. }
            | Event::LlmRequested { seq, .. }
            | Event::LlmResponded { seq, .. }
            | Event::ToolCalled { seq, .. }
            | Event::ToolReturned { seq, .. }
            | Event::ToolFailed { seq, .. }
            | Event::ArtifactCreated { seq, .. } => *seq,
        }
    }

    /// The run this event belongs to.
    pub fn run_id(&self) -> &RunId {
        match self {
            Event::RunStarted { run_id, .. }
            | Event::RunFinished { run_id, .. }
            | Event::RunFailed { run_id, .. }
            | Event::StepStarted { run_id, .. }
            | Event::StepFinished { run_id, .. }
            | Event::StepFailed { run_id, .. }
            | Event::LlmRequested { run_id, .. }
            | Event::LlmResponded { run_id, .. }
            | Event::ToolCalled { run_id, .. }
            | Event::ToolReturned { run_id, .. }
            | Event::ToolFailed { run_id, .. }
            | Event::ArtifactCreated { run_id, .. } => run_id,
        }
    }

    /// The step this event is scoped to, when it carries one.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Event::StepStarted { step_id, .. }
            | Event::StepFinished { step_id, .. }
            | Event::StepFailed { step_id, .. }
            | Event::LlmRequested { step_id, .. }
            | Event::LlmResponded { step_id, .. }
            | Event::ToolCalled { step_id, .. }
            | Event::ToolReturned { step_id, .. }
            | Event::ToolFailed { step_id, .. }
            | Event::ArtifactCreated { step_id, .. } => Some(step_id),
            Event::RunStarted { .. } | Event::RunFinished { .. } | Event::RunFailed { .. } => None,
        }
    }
}

/// Payload of a pending append: everything except the envelope fields the
/// log writer assigns (`seq` and the type tag; `run_id` is the log's own).
#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    RunStarted { workspace_root: String },
    RunFinished,
    RunFailed { reason: String },
    StepStarted { step_id: String, phase: Phase },
    StepFinished { step_id: String, phase: Phase },
    StepFailed { step_id: String, phase: Phase, reason: String },
    LlmRequested { step_id: String },
    LlmResponded { step_id: String },
    ToolCalled { step_id: String, tool_name: String },
    ToolReturned { step_id: String, tool_name: String },
    ToolFailed { step_id: String, tool_name: String, reason: String },
    ArtifactCreated { step_id: String, path: String },
}

impl EventBody {
    /// The string discriminator the materialized event will carry.
    pub fn type_tag(&self) -> &'static str {
        match self {
            EventBody::RunStarted { .. } => "run.started",
            EventBody::RunFinished => "run.finished",
            EventBody::RunFailed { .. } => "run.failed",
            EventBody::StepStarted { .. } => "step.started",
            EventBody::StepFinished { .. } => "step.finished",
            EventBody::StepFailed { .. } => "step.failed",
            EventBody::LlmRequested { .. } => "llm.requested",
            EventBody::LlmResponded { .. } => "llm.responded",
            EventBody::ToolCalled { .. } => "tool.called",
            EventBody::ToolReturned { .. } => "tool.returned",
            EventBody::ToolFailed { .. } => "tool.failed",
            EventBody::ArtifactCreated { .. } => "artifact.created",
        }
    }
}
