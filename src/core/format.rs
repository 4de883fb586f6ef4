//! Sole construction site for fully-formed events.
//!
//! One constructor per variant. Each takes the writer-assigned `seq`,
//! asserts its arguments, and returns the event with its type tag set.
//! Nothing else in the crate builds [`Event`] values for the log, which
//! keeps a mistyped discriminator or a partial payload impossible.

use crate::core::check;
use crate::core::event::{Event, EventBody};
use crate::core::ident::RunId;
use crate::core::phase::Phase;

pub fn run_started(seq: u64, run_id: &RunId, workspace_root: &str) -> Event {
    check::gt(seq, 0, "seq must be positive");
    check::not_empty(run_id.as_str(), "run_id must not be empty");
    check::not_empty(workspace_root, "workspace_root must not be empty");

    Event::RunStarted {
        seq,
        run_id: run_id.clone(),
        workspace_root: workspace_root.to_string(),
    }
}

pub fn run_finished(seq: u64, run_id: &RunId) -> Event {
    check::gt(seq, 0, "seq must be positive");
    check::not_empty(run_id.as_str(), "run_id must not be empty");

    Event::RunFinished {
        seq,
        run_id: run_id.clone(),
    }
}

pub fn run_failed(seq: u64, run_id: &RunId, reason: &str) -> Event {
    check::gt(seq, 0, "seq must be positive");
    check::not_empty(run_id.as_str(), "run_id must not be empty");
    check::not_empty(reason, "reason must not be empty");

    Event::RunFailed {
        seq,
        run_id: run_id.clone(),
        reason: reason.to_string(),
    }
}

pub fn step_started(seq: u64, run_id: &RunId, step_id: &str, phase: Phase) -> Event {
    check::gt(seq, 0, "seq must be positive");
    check::not_empty(run_id.as_str(), "run_id must not be empty");
    check::not_empty(step_id, "step_id must not be empty");
    check::gt(u64::from(phase.ordinal()), 0, "phase must be valid");

    Event::StepStarted {
        seq,
        run_id: run_id.clone(),
        step_id: step_id.to_string(),
        phase,
    }
}

pub fn step_finished(seq: u64, run_id: &RunId, step_id: &str, phase: Phase) -> Event {
    check::gt(seq, 0, "seq must be positive");
    check::not_empty(run_id.as_str(), "run_id must not be empty");
    check::not_empty(step_id, "step_id must not be empty");
    check::gt(u64::from(phase.ordinal()), 0, "phase must be valid");

    Event::StepFinished {
        seq,
        run_id: run_id.clone(),
        step_id: step_id.to_string(),
        phase,
    }
}

pub fn step_failed(seq: u64, run_id: &RunId, step_id: &str, phase: Phase, reason: &str) -> Event {
    check::gt(seq, 0, "seq must be positive");
    check::not_empty(run_id.as_str(), "run_id must not be empty");
    check::not_empty(step_id, "step_id must not be empty");
    check::gt(u64::from(phase.ordinal()), 0, "phase must be valid");
    check::not_empty(reason, "reason must not be empty");

    Event::StepFailed {
        seq,
        run_id: run_id.clone(),
        step_id: step_id.to_string(),
        phase,
        reason: reason.to_string(),
    }
}

pub fn llm_requested(seq: u64, run_id: &RunId, step_id: &str) -> Event {
    check::gt(seq, 0, "seq must be positive");
    check::not_empty(run_id.as_str(), "run_id must not be empty");
    check::not_empty(step_id, "step_id must not be empty");

    Event::LlmRequested {
        seq,
        run_id: run_id.clone(),
        step_id: step_id.to_string(),
    }
}

pub fn llm_responded(seq: u64, run_id: &RunId, step_id: &str) -> Event {
    check::gt(seq, 0, "seq must be positive");
    check::not_empty(run_id.as_str(), "run_id must not be empty");
    check::not_empty(step_id, "step_id must not be empty");

    Event::LlmResponded {
        seq,
        run_id: run_id.clone(),
        step_id: step_id.to_string(),
    }
}

pub fn tool_called(seq: u64, run_id: &RunId, step_id: &str, tool_name: &str) -> Event {
    check::gt(seq, 0, "seq must be positive");
    check::not_empty(run_id.as_str(), "run_id must not be empty");
    check::not_empty(step_id, "step_id must not be empty");
    check::not_empty(tool_name, "tool_name must not be empty");

    Event::ToolCalled {
        seq,
        run_id: run_id.clone(),
        step_id: step_id.to_string(),
        tool_name: tool_name.to_string(),
    }
}

pub fn tool_returned(seq: u64, run_id: &RunId, step_id: &str, tool_name: &str) -> Event {
    check::gt(seq, 0, "seq must be positive");
    check::not_empty(run_id.as_str(), "run_id must not be empty");
    check::not_empty(step_id, "step_id must not be empty");
    check::not_empty(tool_name, "tool_name must not be empty");

    Event::ToolReturned {
        seq,
        run_id: run_id.clone(),
        step_id: step_id.to_string(),
        tool_name: tool_name.to_string(),
    }
}

pub fn tool_failed(
    seq: u64,
    run_id: &RunId,
    step_id: &str,
    tool_name: &str,
    reason: &str,
) -> Event {
    check::gt(seq, 0, "seq must be positive");
    check::not_empty(run_id.as_str(), "run_id must not be empty");
    check::not_empty(step_id, "step_id must not be empty");
    check::not_empty(tool_name, "tool_name must not be empty");
    check::not_empty(reason, "reason must not be empty");

    Event::ToolFailed {
        seq,
        run_id: run_id.clone(),
        step_id: step_id.to_string(),
        tool_name: tool_name.to_string(),
        reason: reason.to_string(),
    }
}

pub fn artifact_created(seq: u64, run_id: &RunId, step_id: &str, path: &str) -> Event {
    check::gt(seq, 0, "seq must be positive");
    check::not_empty(run_id.as_str(), "run_id must not be empty");
    check::not_empty(step_id, "step_id must not be empty");
    check::not_empty(path, "path must not be empty");

    Event::ArtifactCreated {
        seq,
        run_id: run_id.clone(),
        step_id: step_id.to_string(),
        path: path.to_string(),
    }
}

/// Materialize a pending append: the canonical switch over the closed set,
/// called by the log writer with the seq it just assigned.
pub(crate) fn materialize(seq: u64, run_id: &RunId, body: &EventBody) -> Event {
    match body {
        EventBody::RunStarted { workspace_root } => run_started(seq, run_id, workspace_root),
        EventBody::RunFinished => run_finished(seq, run_id),
        EventBody::RunFailed { reason } => run_failed(seq, run_id, reason),
        EventBody::StepStarted { step_id, phase } => step_started(seq, run_id, step_id, *phase),
        EventBody::StepFinished { step_id, phase } => step_finished(seq, run_id, step_id, *phase),
        EventBody::StepFailed {
            step_id,
            phase,
            reason,
        } => step_failed(seq, run_id, step_id, *phase, reason),
        EventBody::LlmRequested { step_id } => llm_requested(seq, run_id, step_id),
        EventBody::LlmResponded { step_id } => llm_responded(seq, run_id, step_id),
        EventBody::ToolCalled { step_id, tool_name } => {
            tool_called(seq, run_id, step_id, tool_name)
        }
        EventBody::ToolReturned { step_id, tool_name } => {
            tool_returned(seq, run_id, step_id, tool_name)
        }
        EventBody::ToolFailed {
            step_id,
            tool_name,
            reason,
        } => tool_failed(seq, run_id, step_id, tool_name, reason),
        EventBody::ArtifactCreated { step_id, path } => {
            artifact_created(seq, run_id, step_id, path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_id() -> RunId {
        RunId::from("run-abc")
    }

    #[test]
    fn constructors_set_tag_seq_and_payload() {
        let event = step_started(7, &run_id(), "step-1", Phase::SignalGeneration);
        assert_eq!(event.type_tag(), "step.started");
        assert_eq!(event.seq(), 7);
        assert_eq!(event.step_id(), Some("step-1"));
    }

    #[test]
    fn materialize_covers_every_body_variant() {
        let bodies = [
            EventBody::RunStarted {
                workspace_root: "/tmp/ws".to_string(),
            },
            EventBody::RunFinished,
            EventBody::RunFailed {
                reason: "boom".to_string(),
            },
            EventBody::StepStarted {
                step_id: "s".to_string(),
                phase: Phase::DataIngestion,
            },
            EventBody::StepFinished {
                step_id: "s".to_string(),
                phase: Phase::DataIngestion,
            },
            EventBody::StepFailed {
                step_id: "s".to_string(),
                phase: Phase::DataIngestion,
                reason: "boom".to_string(),
            },
            EventBody::LlmRequested {
                step_id: "s".to_string(),
            },
            EventBody::LlmResponded {
                step_id: "s".to_string(),
            },
            EventBody::ToolCalled {
                step_id: "s".to_string(),
                tool_name: "fetch".to_string(),
            },
            EventBody::ToolReturned {
                step_id: "s".to_string(),
                tool_name: "fetch".to_string(),
            },
            EventBody::ToolFailed {
                step_id: "s".to_string(),
                tool_name: "fetch".to_string(),
                reason: "timeout".to_string(),
            },
            EventBody::ArtifactCreated {
                step_id: "s".to_string(),
                path: "out/a.txt".to_string(),
            },
        ];
        for (index, body) in bodies.iter().enumerate() {
            let seq = index as u64 + 1;
            let event = materialize(seq, &run_id(), body);
            assert_eq!(event.type_tag(), body.type_tag());
            assert_eq!(event.seq(), seq);
        }
    }

    #[test]
    #[should_panic(expected = "seq must be positive")]
    fn zero_seq_is_a_programmer_error() {
        run_finished(0, &run_id());
    }

    #[test]
    #[should_panic(expected = "reason must not be empty")]
    fn empty_reason_is_a_programmer_error() {
        run_failed(1, &run_id(), "");
    }

    #[test]
    #[should_panic(expected = "step_id must not be empty")]
    fn empty_step_id_is_a_programmer_error() {
        llm_requested(1, &run_id(), "");
    }
}
