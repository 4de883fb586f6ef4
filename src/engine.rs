//! Command-loop coordinator that owns run handles and their event logs.
//!
//! All state mutation happens on one internal thread consuming a bounded
//! command queue; public methods submit a command and block on a reply.
//! Emission-time invariants are checked against the cached handle before an
//! append is delegated to the run's log, and the cache is only updated
//! after the log reports success: a failed write leaves the handle
//! untouched.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::core::check;
use crate::core::event::EventBody;
use crate::core::ident::{self, RunId};
use crate::core::phase::{Phase, is_valid_transition};
use crate::core::replay::{self, MAX_PHASE_ATTEMPTS};
use crate::core::view::{CallOutcome, RunOutcome, StepOutcome};
use crate::error::Error;
use crate::io::event_log::EventLog;
use crate::io::layout::WorkspaceLayout;
use crate::io::workspace;

/// Capacity of the command queue; submitters block when it is full.
pub const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Cached state of one live run. The log is the source of truth; the
/// handle exists so emission-time checks never re-scan the file.
struct RunHandle {
    id: RunId,
    workspace_root: PathBuf,
    last_seq: u64,
    terminal: bool,
    phase: Phase,
    attempts: HashMap<Phase, u32>,
    phase_done: HashMap<Phase, bool>,
    steps: HashMap<String, StepTrack>,
}

struct StepTrack {
    phase: Phase,
    open: bool,
    open_llm: bool,
    open_tools: HashSet<String>,
}

impl RunHandle {
    fn new(id: RunId, workspace_root: PathBuf) -> Self {
        RunHandle {
            id,
            workspace_root,
            last_seq: 0,
            terminal: false,
            phase: Phase::DataIngestion,
            attempts: HashMap::new(),
            phase_done: HashMap::new(),
            steps: HashMap::new(),
        }
    }

    fn open_step(&self, step_id: &str) -> Result<&StepTrack, Error> {
        let track = self.steps.get(step_id).ok_or_else(|| {
            Error::lifecycle(format!(
                "step '{step_id}' was never started in run {}",
                self.id
            ))
        })?;
        if !track.open {
            return Err(Error::lifecycle(format!(
                "step '{step_id}' already terminated in run {}",
                self.id
            )));
        }
        Ok(track)
    }

    /// The current phase when it has burned all attempts without a finished
    /// step and has nothing in flight.
    fn exhausted_phase(&self) -> Option<Phase> {
        let phase = self.phase;
        if self.attempts.get(&phase).copied().unwrap_or(0) < MAX_PHASE_ATTEMPTS {
            return None;
        }
        if self.phase_done.get(&phase).copied().unwrap_or(false) {
            return None;
        }
        let in_flight = self
            .steps
            .values()
            .any(|track| track.phase == phase && track.open);
        if in_flight { None } else { Some(phase) }
    }
}

struct RunEntry {
    handle: RunHandle,
    log: EventLog,
}

enum Command {
    StartRun {
        workspace_root: String,
        reply: SyncSender<Result<RunId, Error>>,
    },
    ResumeRun {
        run_id: RunId,
        workspace_root: String,
        reply: SyncSender<Result<(), Error>>,
    },
    Append {
        run_id: RunId,
        body: EventBody,
        reply: SyncSender<Result<(), Error>>,
    },
    FinishRun {
        run_id: RunId,
        reply: SyncSender<Result<(), Error>>,
    },
    FailRun {
        run_id: RunId,
        reason: String,
        reply: SyncSender<Result<(), Error>>,
    },
}

/// Command-channel front door for external collaborators.
///
/// Safe to share across threads; every operation is synchronous from the
/// caller's view. [`Engine::shutdown`] drains queued commands and closes
/// every still-open log.
pub struct Engine {
    sender: Mutex<Option<SyncSender<Command>>>,
    worker: Mutex<Option<JoinHandle<Result<(), Error>>>>,
    closed: AtomicBool,
}

impl Engine {
    /// Create an engine and start its command loop.
    pub fn new() -> Engine {
        let (sender, receiver) = sync_channel(COMMAND_QUEUE_CAPACITY);
        let worker = std::thread::Builder::new()
            .name("engine-commands".to_string())
            .spawn(move || command_loop(receiver))
            .expect("spawn engine command loop");
        Engine {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            closed: AtomicBool::new(false),
        }
    }

    /// Start a new run rooted at `workspace_root`.
    ///
    /// Validates and normalizes the root, generates a run id, opens the
    /// run's event log, and appends `run.started`. Partially-created state
    /// is discarded when any of those steps fails.
    pub fn start_run(&self, workspace_root: &str) -> Result<RunId, Error> {
        self.submit(|reply| Command::StartRun {
            workspace_root: workspace_root.to_string(),
            reply,
        })
    }

    /// Recreate the handle of a previously started run by replaying its
    /// stored log, and reopen its event log for further appends.
    pub fn resume_run(&self, run_id: &RunId, workspace_root: &str) -> Result<(), Error> {
        self.submit(|reply| Command::ResumeRun {
            run_id: run_id.clone(),
            workspace_root: workspace_root.to_string(),
            reply,
        })
    }

    /// Append a `step.started` event.
    pub fn append_step_started(
        &self,
        run_id: &RunId,
        step_id: &str,
        phase: Phase,
    ) -> Result<(), Error> {
        self.append(
            run_id,
            EventBody::StepStarted {
                step_id: step_id.to_string(),
                phase,
            },
        )
    }

    /// Append a `step.finished` event.
    pub fn append_step_finished(
        &self,
        run_id: &RunId,
        step_id: &str,
        phase: Phase,
    ) -> Result<(), Error> {
        self.append(
            run_id,
            EventBody::StepFinished {
                step_id: step_id.to_string(),
                phase,
            },
        )
    }

    /// Append a `step.failed` event.
    pub fn append_step_failed(
        &self,
        run_id: &RunId,
        step_id: &str,
        phase: Phase,
        reason: &str,
    ) -> Result<(), Error> {
        self.append(
            run_id,
            EventBody::StepFailed {
                step_id: step_id.to_string(),
                phase,
                reason: reason.to_string(),
            },
        )
    }

    /// Append an `llm.requested` event.
    pub fn append_llm_requested(&self, run_id: &RunId, step_id: &str) -> Result<(), Error> {
        self.append(
            run_id,
            EventBody::LlmRequested {
                step_id: step_id.to_string(),
            },
        )
    }

    /// Append an `llm.responded` event.
    pub fn append_llm_responded(&self, run_id: &RunId, step_id: &str) -> Result<(), Error> {
        self.append(
            run_id,
            EventBody::LlmResponded {
                step_id: step_id.to_string(),
            },
        )
    }

    /// Append a `tool.called` event.
    pub fn append_tool_called(
        &self,
        run_id: &RunId,
        step_id: &str,
        tool_name: &str,
    ) -> Result<(), Error> {
        self.append(
            run_id,
            EventBody::ToolCalled {
                step_id: step_id.to_string(),
                tool_name: tool_name.to_string(),
            },
        )
    }

    /// Append a `tool.returned` event.
    pub fn append_tool_returned(
        &self,
        run_id: &RunId,
        step_id: &str,
        tool_name: &str,
    ) -> Result<(), Error> {
        self.append(
            run_id,
            EventBody::ToolReturned {
                step_id: step_id.to_string(),
                tool_name: tool_name.to_string(),
            },
        )
    }

    /// Append a `tool.failed` event.
    pub fn append_tool_failed(
        &self,
        run_id: &RunId,
        step_id: &str,
        tool_name: &str,
        reason: &str,
    ) -> Result<(), Error> {
        self.append(
            run_id,
            EventBody::ToolFailed {
                step_id: step_id.to_string(),
                tool_name: tool_name.to_string(),
                reason: reason.to_string(),
            },
        )
    }

    /// Append an `artifact.created` event after containment is checked
    /// against the run's workspace root.
    pub fn append_artifact_created(
        &self,
        run_id: &RunId,
        step_id: &str,
        path: &str,
    ) -> Result<(), Error> {
        self.append(
            run_id,
            EventBody::ArtifactCreated {
                step_id: step_id.to_string(),
                path: path.to_string(),
            },
        )
    }

    /// Terminate a run successfully and close its log.
    pub fn finish_run(&self, run_id: &RunId) -> Result<(), Error> {
        self.submit(|reply| Command::FinishRun {
            run_id: run_id.clone(),
            reply,
        })
    }

    /// Terminate a run as failed and close its log.
    pub fn fail_run(&self, run_id: &RunId, reason: &str) -> Result<(), Error> {
        self.submit(|reply| Command::FailRun {
            run_id: run_id.clone(),
            reason: reason.to_string(),
            reply,
        })
    }

    /// Stop the engine: drain queued commands, then close every still-open
    /// log. Later operations fail with [`Error::Closed`]; a second
    /// shutdown is itself an error.
    pub fn shutdown(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed("engine"));
        }
        let sender = self.sender.lock().expect("engine sender lock").take();
        drop(sender);

        let worker = self.worker.lock().expect("engine worker lock").take();
        match worker {
            Some(worker) => worker.join().map_err(|_| {
                Error::io(
                    "engine command loop panicked",
                    io::Error::other("command loop thread panicked"),
                )
            })?,
            None => Ok(()),
        }
    }

    fn append(&self, run_id: &RunId, body: EventBody) -> Result<(), Error> {
        self.submit(|reply| Command::Append {
            run_id: run_id.clone(),
            body,
            reply,
        })
    }

    fn submit<T>(
        &self,
        build: impl FnOnce(SyncSender<Result<T, Error>>) -> Command,
    ) -> Result<T, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("engine"));
        }
        let sender = {
            let guard = self.sender.lock().expect("engine sender lock");
            match guard.as_ref() {
                Some(sender) => sender.clone(),
                None => return Err(Error::Closed("engine")),
            }
        };

        let (reply_sender, reply_receiver) = sync_channel(1);
        sender
            .send(build(reply_sender))
            .map_err(|_| Error::Closed("engine"))?;
        reply_receiver.recv().map_err(|_| {
            Error::io(
                "engine command loop terminated before replying",
                io::Error::other("command loop exited"),
            )
        })?
    }
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new()
    }
}

/// The single mutator of the run-handle table.
fn command_loop(receiver: Receiver<Command>) -> Result<(), Error> {
    let mut runs: HashMap<RunId, RunEntry> = HashMap::new();

    while let Ok(command) = receiver.recv() {
        match command {
            Command::StartRun {
                workspace_root,
                reply,
            } => {
                let _ = reply.send(handle_start_run(&mut runs, &workspace_root));
            }
            Command::ResumeRun {
                run_id,
                workspace_root,
                reply,
            } => {
                let _ = reply.send(handle_resume_run(&mut runs, run_id, &workspace_root));
            }
            Command::Append {
                run_id,
                body,
                reply,
            } => {
                let _ = reply.send(handle_append(&mut runs, &run_id, body));
            }
            Command::FinishRun { run_id, reply } => {
                let _ = reply.send(handle_terminal(&mut runs, &run_id, None));
            }
            Command::FailRun {
                run_id,
                reason,
                reply,
            } => {
                let _ = reply.send(handle_terminal(&mut runs, &run_id, Some(reason)));
            }
        }
    }

    // Channel disconnected: orderly shutdown. Close whatever is still open.
    let mut result = Ok(());
    for (run_id, entry) in runs.drain() {
        if entry.handle.terminal {
            continue;
        }
        if let Err(err) = entry.log.close() {
            warn!(run_id = %run_id, error = %err, "failed to close log on shutdown");
            if result.is_ok() {
                result = Err(err);
            }
        }
    }
    result
}

fn handle_start_run(
    runs: &mut HashMap<RunId, RunEntry>,
    workspace_root: &str,
) -> Result<RunId, Error> {
    workspace::validate_workspace_root(workspace_root)?;
    let normalized = workspace::normalize(workspace_root)?;
    let root_str = normalized
        .to_str()
        .ok_or_else(|| Error::invalid_argument("workspace_root must be valid UTF-8"))?
        .to_string();

    let run_id = ident::new_run_id();
    // Impossible with 128-bit random ids; a hit means the id source broke.
    check::is_true(
        !runs.contains_key(&run_id),
        "run id collision against live handles",
    );

    let log = EventLog::open(run_id.clone(), &normalized)?;
    let seq = match log.append_run_started(&root_str) {
        Ok(seq) => seq,
        Err(err) => {
            // Discard the partially-created run before replying.
            if let Err(close_err) = log.close() {
                warn!(run_id = %run_id, error = %close_err, "failed to close log after aborted start");
            }
            return Err(err);
        }
    };

    let mut handle = RunHandle::new(run_id.clone(), normalized);
    handle.last_seq = seq;
    runs.insert(run_id.clone(), RunEntry { handle, log });
    info!(run_id = %run_id, workspace_root = %root_str, "run started");
    Ok(run_id)
}

fn handle_resume_run(
    runs: &mut HashMap<RunId, RunEntry>,
    run_id: RunId,
    workspace_root: &str,
) -> Result<(), Error> {
    if runs.contains_key(&run_id) {
        return Err(Error::lifecycle(format!("run {run_id} is already live")));
    }
    workspace::validate_workspace_root(workspace_root)?;
    let normalized = workspace::normalize(workspace_root)?;

    let layout = WorkspaceLayout::new(&normalized);
    let log_path = layout.log_path(&run_id);
    let bytes = std::fs::read(&log_path)
        .map_err(|err| Error::io(format!("read event log {}", log_path.display()), err))?;
    let view = replay::replay(&run_id, &bytes)?;
    if view.outcome != RunOutcome::Running {
        return Err(Error::lifecycle(format!(
            "run {run_id} already terminated; nothing to resume"
        )));
    }

    let mut handle = RunHandle::new(run_id.clone(), normalized.clone());
    handle.last_seq = view.last_seq;
    for step in &view.steps {
        *handle.attempts.entry(step.phase).or_insert(0) += 1;
        if step.outcome == StepOutcome::Finished {
            handle.phase_done.insert(step.phase, true);
        }
        handle.phase = step.phase;
        handle.steps.insert(
            step.step_id.clone(),
            StepTrack {
                phase: step.phase,
                open: step.outcome == StepOutcome::Running,
                open_llm: step
                    .llm_calls
                    .last()
                    .is_some_and(|call| call.outcome == CallOutcome::Open),
                open_tools: step
                    .tool_calls
                    .iter()
                    .filter(|call| call.outcome == CallOutcome::Open)
                    .map(|call| call.tool_name.clone())
                    .collect(),
            },
        );
    }

    let log = EventLog::open(run_id.clone(), &normalized)?;
    debug!(run_id = %run_id, last_seq = handle.last_seq, "run resumed from log");
    runs.insert(run_id, RunEntry { handle, log });
    Ok(())
}

fn handle_append(
    runs: &mut HashMap<RunId, RunEntry>,
    run_id: &RunId,
    body: EventBody,
) -> Result<(), Error> {
    let entry = runs
        .get_mut(run_id)
        .ok_or_else(|| Error::invalid_argument(format!("unknown run {run_id}")))?;

    check_exec(&entry.handle, &body)?;
    let seq = entry.log.append_body(body.clone())?;
    apply_to_handle(&mut entry.handle, body, seq);
    Ok(())
}

/// Emission-time invariants, checked against the cached handle before the
/// append request is submitted. Pure: never mutates the handle.
fn check_exec(handle: &RunHandle, body: &EventBody) -> Result<(), Error> {
    if handle.terminal {
        return Err(Error::lifecycle(format!(
            "run {} already terminated",
            handle.id
        )));
    }

    match body {
        EventBody::StepStarted { step_id, phase } => {
            if step_id.trim().is_empty() {
                return Err(Error::invalid_argument("step_id must not be empty"));
            }
            if handle.steps.contains_key(step_id) {
                return Err(Error::lifecycle(format!(
                    "step '{step_id}' already started in run {}",
                    handle.id
                )));
            }
            if let Some(exhausted) = handle.exhausted_phase() {
                return Err(Error::ordering(format!(
                    "phase {exhausted} exhausted its {MAX_PHASE_ATTEMPTS} attempts; \
                     run {} must fail",
                    handle.id
                )));
            }
            if !is_valid_transition(handle.phase, *phase) {
                return Err(Error::ordering(format!(
                    "illegal phase transition from {} to {phase}",
                    handle.phase
                )));
            }
            if handle.attempts.get(phase).copied().unwrap_or(0) + 1 > MAX_PHASE_ATTEMPTS {
                return Err(Error::ordering(format!(
                    "phase {phase} already used its {MAX_PHASE_ATTEMPTS} attempts"
                )));
            }
        }
        EventBody::StepFinished { step_id, phase } => {
            let track = handle.open_step(step_id)?;
            check_step_phase(step_id, track, *phase)?;
            check_calls_closed(step_id, track)?;
        }
        EventBody::StepFailed {
            step_id,
            phase,
            reason,
        } => {
            if reason.trim().is_empty() {
                return Err(Error::invalid_argument("reason must not be empty"));
            }
            let track = handle.open_step(step_id)?;
            check_step_phase(step_id, track, *phase)?;
            check_calls_closed(step_id, track)?;
        }
        EventBody::LlmRequested { step_id } => {
            let track = handle.open_step(step_id)?;
            if track.open_llm {
                return Err(Error::lifecycle(format!(
                    "llm call already open for step '{step_id}'"
                )));
            }
        }
        EventBody::LlmResponded { step_id } => {
            let track = handle.open_step(step_id)?;
            if !track.open_llm {
                return Err(Error::lifecycle(format!(
                    "no pending llm.requested for step '{step_id}'"
                )));
            }
        }
        EventBody::ToolCalled { step_id, tool_name } => {
            if tool_name.trim().is_empty() {
                return Err(Error::invalid_argument("tool_name must not be empty"));
            }
            let track = handle.open_step(step_id)?;
            if track.open_tools.contains(tool_name) {
                return Err(Error::lifecycle(format!(
                    "tool call '{tool_name}' already open in step '{step_id}'"
                )));
            }
        }
        EventBody::ToolReturned { step_id, tool_name } => {
            let track = handle.open_step(step_id)?;
            if !track.open_tools.contains(tool_name) {
                return Err(Error::lifecycle(format!(
                    "no open tool call '{tool_name}' in step '{step_id}'"
                )));
            }
        }
        EventBody::ToolFailed {
            step_id,
            tool_name,
            reason,
        } => {
            if reason.trim().is_empty() {
                return Err(Error::invalid_argument("reason must not be empty"));
            }
            let track = handle.open_step(step_id)?;
            if !track.open_tools.contains(tool_name) {
                return Err(Error::lifecycle(format!(
                    "no open tool call '{tool_name}' in step '{step_id}'"
                )));
            }
        }
        EventBody::ArtifactCreated { step_id, path } => {
            handle.open_step(step_id)?;
            workspace::contain(&handle.workspace_root, path)?;
        }
        EventBody::RunStarted { .. } | EventBody::RunFinished | EventBody::RunFailed { .. } => {
            unreachable!("run lifecycle events use dedicated commands")
        }
    }
    Ok(())
}

fn check_step_phase(step_id: &str, track: &StepTrack, phase: Phase) -> Result<(), Error> {
    if track.phase != phase {
        return Err(Error::lifecycle(format!(
            "phase {phase} does not match step '{step_id}' started in {}",
            track.phase
        )));
    }
    Ok(())
}

fn check_calls_closed(step_id: &str, track: &StepTrack) -> Result<(), Error> {
    if track.open_llm {
        return Err(Error::lifecycle(format!(
            "llm call still open in step '{step_id}'"
        )));
    }
    if let Some(tool_name) = track.open_tools.iter().next() {
        return Err(Error::lifecycle(format!(
            "tool call '{tool_name}' still open in step '{step_id}'"
        )));
    }
    Ok(())
}

/// Fold a successfully appended event into the cached handle.
fn apply_to_handle(handle: &mut RunHandle, body: EventBody, seq: u64) {
    check::gt(seq, handle.last_seq, "appended seq must advance the handle");
    handle.last_seq = seq;

    match body {
        EventBody::StepStarted { step_id, phase } => {
            *handle.attempts.entry(phase).or_insert(0) += 1;
            handle.phase = phase;
            handle.steps.insert(
                step_id,
                StepTrack {
                    phase,
                    open: true,
                    open_llm: false,
                    open_tools: HashSet::new(),
                },
            );
        }
        EventBody::StepFinished { step_id, phase } => {
            handle.phase_done.insert(phase, true);
            step_mut(handle, &step_id).open = false;
        }
        EventBody::StepFailed { step_id, .. } => {
            step_mut(handle, &step_id).open = false;
        }
        EventBody::LlmRequested { step_id } => {
            step_mut(handle, &step_id).open_llm = true;
        }
        EventBody::LlmResponded { step_id } => {
            step_mut(handle, &step_id).open_llm = false;
        }
        EventBody::ToolCalled { step_id, tool_name } => {
            step_mut(handle, &step_id).open_tools.insert(tool_name);
        }
        EventBody::ToolReturned { step_id, tool_name }
        | EventBody::ToolFailed {
            step_id, tool_name, ..
        } => {
            step_mut(handle, &step_id).open_tools.remove(&tool_name);
        }
        EventBody::ArtifactCreated { .. } => {}
        EventBody::RunStarted { .. } | EventBody::RunFinished | EventBody::RunFailed { .. } => {
            unreachable!("run lifecycle events use dedicated commands")
        }
    }
}

fn step_mut<'a>(handle: &'a mut RunHandle, step_id: &str) -> &'a mut StepTrack {
    handle
        .steps
        .get_mut(step_id)
        .expect("checked step must exist in handle")
}

fn handle_terminal(
    runs: &mut HashMap<RunId, RunEntry>,
    run_id: &RunId,
    fail_reason: Option<String>,
) -> Result<(), Error> {
    let entry = runs
        .get_mut(run_id)
        .ok_or_else(|| Error::invalid_argument(format!("unknown run {run_id}")))?;
    if entry.handle.terminal {
        return Err(Error::lifecycle(format!("run {run_id} already terminated")));
    }
    if let Some(reason) = &fail_reason {
        if reason.trim().is_empty() {
            return Err(Error::invalid_argument("reason must not be empty"));
        }
    }
    if let Some((step_id, _)) = entry
        .handle
        .steps
        .iter()
        .find(|(_, track)| track.open)
    {
        return Err(Error::lifecycle(format!(
            "step '{step_id}' has no terminal event; close it before terminating run {run_id}"
        )));
    }
    if fail_reason.is_none() {
        if let Some(phase) = entry.handle.exhausted_phase() {
            return Err(Error::ordering(format!(
                "phase {phase} exhausted its attempts; run {run_id} must terminate with run.failed"
            )));
        }
    }

    let seq = match &fail_reason {
        None => entry.log.append_run_finished()?,
        Some(reason) => entry.log.append_run_failed(reason)?,
    };
    entry.handle.terminal = true;
    entry.handle.last_seq = seq;
    let close_result = entry.log.close();
    info!(
        run_id = %run_id,
        outcome = if fail_reason.is_none() { "finished" } else { "failed" },
        "run terminated"
    );
    close_result
}
