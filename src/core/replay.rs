//! Replay validation: rebuild a run view from stored log bytes.
//!
//! One forward pass. Every line must parse against the closed event set,
//! seq must stay dense from 1, and the run/step/call state machines must
//! hold at every event. The validator reads nothing but the given bytes
//! (no clock, no environment, no filesystem), so a given byte sequence
//! always produces the same verdict and view.

use std::collections::HashMap;

use crate::core::event::Event;
use crate::core::ident::RunId;
use crate::core::path::confine_relative;
use crate::core::phase::{Phase, is_valid_transition};
use crate::core::view::{
    CallOutcome, LlmCallView, RunOutcome, RunView, StepOutcome, StepView, ToolCallView,
};
use crate::error::Error;

/// Maximum `step.started` events per phase before the run must fail.
pub const MAX_PHASE_ATTEMPTS: u32 = 3;

/// Knobs for [`replay_with`].
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    /// Reject logs without a terminal run event instead of reconstructing a
    /// running view.
    pub require_terminal: bool,
}

/// Replay `bytes` as the log of `run_id` and reconstruct its [`RunView`].
///
/// An unterminated log reconstructs to a running view; use [`replay_with`]
/// and [`ReplayOptions::require_terminal`] to demand a completed replay.
pub fn replay(run_id: &RunId, bytes: &[u8]) -> Result<RunView, Error> {
    replay_with(run_id, bytes, &ReplayOptions::default())
}

/// Replay with explicit options.
pub fn replay_with(
    run_id: &RunId,
    bytes: &[u8],
    options: &ReplayOptions,
) -> Result<RunView, Error> {
    let mut replayer = Replayer::new(run_id.clone());

    let chunks: Vec<&[u8]> = bytes.split(|byte| *byte == b'\n').collect();
    let mut saw_event = false;
    for (index, chunk) in chunks.iter().enumerate() {
        // A single trailing newline leaves one empty chunk at the end.
        if chunk.is_empty() && index == chunks.len() - 1 {
            break;
        }
        let line_no = index as u64 + 1;
        if chunk.is_empty() {
            return Err(Error::corruption(line_no, "empty line"));
        }
        let event: Event = serde_json::from_slice(chunk)
            .map_err(|err| Error::corruption(line_no, format!("invalid event: {err}")))?;
        if let Some(message) = payload_violation(&event) {
            return Err(Error::corruption(line_no, message));
        }
        replayer.apply(line_no, event)?;
        saw_event = true;
    }

    if !saw_event {
        return Err(Error::lifecycle("log contains no events"));
    }
    if options.require_terminal && replayer.outcome == RunOutcome::Running {
        return Err(Error::lifecycle("log has no terminal run event"));
    }

    Ok(replayer.into_view())
}

/// Emptiness rules the type system cannot carry: every required string
/// field must be non-empty.
fn payload_violation(event: &Event) -> Option<String> {
    if event.run_id().as_str().is_empty() {
        return Some("run_id must not be empty".to_string());
    }
    if event.step_id().is_some_and(str::is_empty) {
        return Some("step_id must not be empty".to_string());
    }
    match event {
        Event::RunStarted { workspace_root, .. } if workspace_root.is_empty() => {
            Some("workspace_root must not be empty".to_string())
        }
        Event::RunFailed { reason, .. }
        | Event::StepFailed { reason, .. }
        | Event::ToolFailed { reason, .. }
            if reason.is_empty() =>
        {
            Some("reason must not be empty".to_string())
        }
        Event::ToolCalled { tool_name, .. }
        | Event::ToolReturned { tool_name, .. }
        | Event::ToolFailed { tool_name, .. }
            if tool_name.is_empty() =>
        {
            Some("tool_name must not be empty".to_string())
        }
        Event::ArtifactCreated { path, .. } if path.is_empty() => {
            Some("path must not be empty".to_string())
        }
        _ => None,
    }
}

struct StepRecord {
    step_id: String,
    phase: Phase,
    outcome: StepOutcome,
    failure_reason: Option<String>,
    llm_calls: Vec<LlmCallView>,
    open_llm: bool,
    tool_calls: Vec<ToolCallView>,
    artifacts: Vec<String>,
}

struct Replayer {
    run_id: RunId,
    started: bool,
    workspace_root: String,
    last_seq: u64,
    outcome: RunOutcome,
    failure_reason: Option<String>,
    current_phase: Phase,
    attempts: HashMap<Phase, u32>,
    phase_done: HashMap<Phase, bool>,
    steps: Vec<StepRecord>,
    step_index: HashMap<String, usize>,
}

impl Replayer {
    fn new(run_id: RunId) -> Self {
        Replayer {
            run_id,
            started: false,
            workspace_root: String::new(),
            last_seq: 0,
            outcome: RunOutcome::Running,
            failure_reason: None,
            current_phase: Phase::DataIngestion,
            attempts: HashMap::new(),
            phase_done: HashMap::new(),
            steps: Vec::new(),
            step_index: HashMap::new(),
        }
    }

    fn apply(&mut self, line_no: u64, event: Event) -> Result<(), Error> {
        let seq = event.seq();
        let tag = event.type_tag();

        if seq != self.last_seq + 1 {
            return Err(Error::corruption(
                line_no,
                format!("seq {seq} breaks dense ordering (previous {})", self.last_seq),
            ));
        }
        if event.run_id() != &self.run_id {
            return Err(Error::corruption(
                line_no,
                format!(
                    "event run_id '{}' does not match '{}'",
                    event.run_id(),
                    self.run_id
                ),
            ));
        }

        if !self.started {
            return match event {
                Event::RunStarted { workspace_root, .. } => {
                    if !std::path::Path::new(&workspace_root).is_absolute() {
                        return Err(Error::corruption(
                            line_no,
                            format!("workspace_root '{workspace_root}' must be absolute"),
                        ));
                    }
                    self.workspace_root = workspace_root;
                    self.started = true;
                    self.last_seq = seq;
                    Ok(())
                }
                _ => Err(Error::lifecycle(format!(
                    "seq {seq} ({tag}): first event must be run.started"
                ))),
            };
        }

        if self.outcome != RunOutcome::Running {
            return Err(Error::lifecycle(format!(
                "seq {seq} ({tag}): event after terminal run event"
            )));
        }

        match event {
            Event::RunStarted { .. } => {
                return Err(Error::lifecycle(format!(
                    "seq {seq} (run.started): duplicate run.started"
                )));
            }
            Event::RunFinished { .. } => {
                self.check_all_steps_closed(seq, tag)?;
                if let Some(phase) = self.exhausted_phase() {
                    return Err(Error::ordering(format!(
                        "seq {seq} (run.finished): phase {phase} exhausted its attempts; \
                         run must terminate with run.failed"
                    )));
                }
                self.outcome = RunOutcome::Finished;
            }
            Event::RunFailed { reason, .. } => {
                self.check_all_steps_closed(seq, tag)?;
                self.outcome = RunOutcome::Failed;
                self.failure_reason = Some(reason);
            }
            Event::StepStarted { step_id, phase, .. } => {
                if self.step_index.contains_key(&step_id) {
                    return Err(Error::lifecycle(format!(
                        "seq {seq} (step.started): duplicate step.started for '{step_id}'"
                    )));
                }
                if let Some(exhausted) = self.exhausted_phase() {
                    return Err(Error::ordering(format!(
                        "seq {seq} (step.started): phase {exhausted} exhausted its attempts; \
                         no further step may start"
                    )));
                }
                if !is_valid_transition(self.current_phase, phase) {
                    return Err(Error::ordering(format!(
                        "seq {seq} (step.started): illegal phase transition from {} to {phase}",
                        self.current_phase
                    )));
                }
                let attempts = self.attempts.entry(phase).or_insert(0);
                *attempts += 1;
                if *attempts > MAX_PHASE_ATTEMPTS {
                    return Err(Error::ordering(format!(
                        "seq {seq} (step.started): phase {phase} exceeded \
                         {MAX_PHASE_ATTEMPTS} attempts"
                    )));
                }
                self.current_phase = phase;
                self.step_index.insert(step_id.clone(), self.steps.len());
                self.steps.push(StepRecord {
                    step_id,
                    phase,
                    outcome: StepOutcome::Running,
                    failure_reason: None,
                    llm_calls: Vec::new(),
                    open_llm: false,
                    tool_calls: Vec::new(),
                    artifacts: Vec::new(),
                });
            }
            Event::StepFinished { step_id, phase, .. } => {
                let record = self.open_step(seq, tag, &step_id)?;
                if record.phase != phase {
                    return Err(Error::lifecycle(format!(
                        "seq {seq} (step.finished): phase {phase} does not match \
                         step '{step_id}' started in {}",
                        record.phase
                    )));
                }
                Self::check_calls_closed(record, seq, tag)?;
                record.outcome = StepOutcome::Finished;
                self.phase_done.insert(phase, true);
            }
            Event::StepFailed {
                step_id,
                phase,
                reason,
                ..
            } => {
                let record = self.open_step(seq, tag, &step_id)?;
                if record.phase != phase {
                    return Err(Error::lifecycle(format!(
                        "seq {seq} (step.failed): phase {phase} does not match \
                         step '{step_id}' started in {}",
                        record.phase
                    )));
                }
                Self::check_calls_closed(record, seq, tag)?;
                record.outcome = StepOutcome::Failed;
                record.failure_reason = Some(reason);
            }
            Event::LlmRequested { step_id, .. } => {
                let record = self.open_step(seq, tag, &step_id)?;
                if record.open_llm {
                    return Err(Error::lifecycle(format!(
                        "seq {seq} (llm.requested): llm call already open for step '{step_id}'"
                    )));
                }
                record.open_llm = true;
                record.llm_calls.push(LlmCallView {
                    outcome: CallOutcome::Open,
                });
            }
            Event::LlmResponded { step_id, .. } => {
                let record = self.open_step(seq, tag, &step_id)?;
                if !record.open_llm {
                    return Err(Error::lifecycle(format!(
                        "seq {seq} (llm.responded): no pending llm.requested \
                         for step '{step_id}'"
                    )));
                }
                record.open_llm = false;
                let call = record
                    .llm_calls
                    .last_mut()
                    .expect("open_llm implies a recorded call");
                call.outcome = CallOutcome::Completed;
            }
            Event::ToolCalled {
                step_id, tool_name, ..
            } => {
                let record = self.open_step(seq, tag, &step_id)?;
                if open_tool(record, &tool_name).is_some() {
                    return Err(Error::lifecycle(format!(
                        "seq {seq} (tool.called): tool call '{tool_name}' already open \
                         in step '{step_id}'"
                    )));
                }
                record.tool_calls.push(ToolCallView {
                    tool_name,
                    outcome: CallOutcome::Open,
                    failure_reason: None,
                });
            }
            Event::ToolReturned {
                step_id, tool_name, ..
            } => {
                let record = self.open_step(seq, tag, &step_id)?;
                let Some(index) = open_tool(record, &tool_name) else {
                    return Err(Error::lifecycle(format!(
                        "seq {seq} (tool.returned): no open tool call '{tool_name}' \
                         in step '{step_id}'"
                    )));
                };
                record.tool_calls[index].outcome = CallOutcome::Completed;
            }
            Event::ToolFailed {
                step_id,
                tool_name,
                reason,
                ..
            } => {
                let record = self.open_step(seq, tag, &step_id)?;
                let Some(index) = open_tool(record, &tool_name) else {
                    return Err(Error::lifecycle(format!(
                        "seq {seq} (tool.failed): no open tool call '{tool_name}' \
                         in step '{step_id}'"
                    )));
                };
                record.tool_calls[index].outcome = CallOutcome::Failed;
                record.tool_calls[index].failure_reason = Some(reason);
            }
            Event::ArtifactCreated { step_id, path, .. } => {
                let record = self.open_step(seq, tag, &step_id)?;
                let Some(cleaned) = confine_relative(&path) else {
                    return Err(Error::contained(path));
                };
                record
                    .artifacts
                    .push(cleaned.to_string_lossy().into_owned());
            }
        }

        self.last_seq = seq;
        Ok(())
    }

    /// Fetch the step a scoped event references; it must exist and be open.
    fn open_step(
        &mut self,
        seq: u64,
        tag: &str,
        step_id: &str,
    ) -> Result<&mut StepRecord, Error> {
        let Some(&index) = self.step_index.get(step_id) else {
            return Err(Error::lifecycle(format!(
                "seq {seq} ({tag}): references unknown step '{step_id}'"
            )));
        };
        let record = &mut self.steps[index];
        if record.outcome != StepOutcome::Running {
            return Err(Error::lifecycle(format!(
                "seq {seq} ({tag}): references terminated step '{step_id}'"
            )));
        }
        Ok(record)
    }

    fn check_all_steps_closed(&self, seq: u64, tag: &str) -> Result<(), Error> {
        if let Some(open) = self
            .steps
            .iter()
            .find(|step| step.outcome == StepOutcome::Running)
        {
            return Err(Error::lifecycle(format!(
                "seq {seq} ({tag}): step '{}' has no terminal event",
                open.step_id
            )));
        }
        Ok(())
    }

    fn check_calls_closed(record: &StepRecord, seq: u64, tag: &str) -> Result<(), Error> {
        if record.open_llm {
            return Err(Error::lifecycle(format!(
                "seq {seq} ({tag}): llm call still open in step '{}'",
                record.step_id
            )));
        }
        if let Some(open) = record
            .tool_calls
            .iter()
            .find(|call| call.outcome == CallOutcome::Open)
        {
            return Err(Error::lifecycle(format!(
                "seq {seq} ({tag}): tool call '{}' still open in step '{}'",
                open.tool_name, record.step_id
            )));
        }
        Ok(())
    }

    /// The current phase when it has burned all attempts without a finished
    /// step and has nothing in flight. Earlier phases cannot reach this
    /// state unnoticed: leaving a phase requires a legal forward step, which
    /// this check gates.
    fn exhausted_phase(&self) -> Option<Phase> {
        let phase = self.current_phase;
        let attempts = self.attempts.get(&phase).copied().unwrap_or(0);
        if attempts < MAX_PHASE_ATTEMPTS {
            return None;
        }
        if self.phase_done.get(&phase).copied().unwrap_or(false) {
            return None;
        }
        let in_flight = self
            .steps
            .iter()
            .any(|step| step.phase == phase && step.outcome == StepOutcome::Running);
        if in_flight { None } else { Some(phase) }
    }

    fn into_view(self) -> RunView {
        RunView {
            run_id: self.run_id,
            workspace_root: self.workspace_root,
            last_seq: self.last_seq,
            outcome: self.outcome,
            failure_reason: self.failure_reason,
            steps: self
                .steps
                .into_iter()
                .map(|record| StepView {
                    step_id: record.step_id,
                    phase: record.phase,
                    outcome: record.outcome,
                    failure_reason: record.failure_reason,
                    llm_calls: record.llm_calls,
                    tool_calls: record.tool_calls,
                    artifacts: record.artifacts,
                })
                .collect(),
        }
    }
}

/// Index of the open call with `tool_name`, if any. At most one call per
/// name may be open in a step at a time.
fn open_tool(record: &StepRecord, tool_name: &str) -> Option<usize> {
    record
        .tool_calls
        .iter()
        .rposition(|call| call.outcome == CallOutcome::Open && call.tool_name == tool_name)
}
