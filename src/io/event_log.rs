//! Append-only JSON-Lines event log, one file per run.
//!
//! All appends funnel through a single writer thread that owns the file
//! handle, the buffered writer, and the `next_seq` counter. Callers hand it
//! typed requests over a bounded channel and block on a single-slot reply;
//! the writer drains requests in FIFO order, so two racing submitters get a
//! well-defined total order even though neither controls it. The file is
//! the source of truth: reopening an existing log scans it once and resumes
//! at `last_seq + 1`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread::JoinHandle;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::core::check;
use crate::core::event::EventBody;
use crate::core::format;
use crate::core::ident::RunId;
use crate::core::phase::Phase;
use crate::error::Error;
use crate::io::layout::WorkspaceLayout;

/// Capacity of the append request queue; submitters block when it is full.
/// There is deliberately no lossy path.
pub const APPEND_QUEUE_CAPACITY: usize = 64;

const WRITE_BUFFER_BYTES: usize = 4096;

/// Tuning knobs for [`EventLog::open_with`].
#[derive(Debug, Clone, Default)]
pub struct EventLogOptions {
    /// Fsync after every flushed event. Off by default: the baseline
    /// guarantee is flush-to-OS per append, which survives process crashes
    /// but not OS crashes.
    pub fsync: bool,
}

struct AppendRequest {
    body: EventBody,
    reply: SyncSender<Result<u64, Error>>,
}

/// Append-only event log for a single run.
///
/// Safe to share across threads. `close` drains every already-queued
/// request before the file is released; submissions that lose the race
/// against `close` fail with [`Error::Closed`].
#[derive(Debug)]
pub struct EventLog {
    run_id: RunId,
    path: PathBuf,
    sender: Mutex<Option<SyncSender<AppendRequest>>>,
    writer: Mutex<Option<JoinHandle<Result<(), Error>>>>,
    closed: AtomicBool,
}

impl EventLog {
    /// Create or reopen the log for `run_id` under `workspace_root`.
    ///
    /// A fresh or empty file starts at `seq = 1`. An existing file is
    /// scanned line by line first: every line must parse and carry a
    /// strictly increasing seq, and the writer resumes at `last_seq + 1`.
    /// A malformed line fails the open with its line number; the log is
    /// never silently truncated.
    pub fn open(run_id: RunId, workspace_root: &Path) -> Result<EventLog, Error> {
        Self::open_with(run_id, workspace_root, &EventLogOptions::default())
    }

    /// [`EventLog::open`] with explicit options.
    pub fn open_with(
        run_id: RunId,
        workspace_root: &Path,
        options: &EventLogOptions,
    ) -> Result<EventLog, Error> {
        check::not_empty(run_id.as_str(), "run_id must not be empty");

        let layout = WorkspaceLayout::new(workspace_root);
        create_logs_dir(&layout.logs_dir)?;
        let path = layout.log_path(&run_id);

        let next_seq = match fs::metadata(&path) {
            Err(_) => 1,
            Ok(metadata) if metadata.len() == 0 => 1,
            Ok(_) => scan_last_seq(&path)? + 1,
        };
        check::gt(next_seq, 0, "next_seq must be positive");

        let file = open_append(&path)?;
        let (sender, receiver) = sync_channel(APPEND_QUEUE_CAPACITY);
        let writer_run_id = run_id.clone();
        let fsync = options.fsync;
        let handle = std::thread::Builder::new()
            .name(format!("event-log-{run_id}"))
            .spawn(move || writer_loop(file, writer_run_id, next_seq, receiver, fsync))
            .map_err(|err| Error::io("spawn event log writer", err))?;

        debug!(run_id = %run_id, path = %path.display(), next_seq, "event log open");
        Ok(EventLog {
            run_id,
            path,
            sender: Mutex::new(Some(sender)),
            writer: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        })
    }

    /// The run this log belongs to.
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// On-disk location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a `run.started` event. Returns the assigned seq.
    pub fn append_run_started(&self, workspace_root: &str) -> Result<u64, Error> {
        self.submit(EventBody::RunStarted {
            workspace_root: workspace_root.to_string(),
        })
    }

    /// Append a `run.finished` event.
    pub fn append_run_finished(&self) -> Result<u64, Error> {
        self.submit(EventBody::RunFinished)
    }

    /// Append a `run.failed` event.
    pub fn append_run_failed(&self, reason: &str) -> Result<u64, Error> {
        self.submit(EventBody::RunFailed {
            reason: reason.to_string(),
        })
    }

    /// Append a `step.started` event.
    pub fn append_step_started(&self, step_id: &str, phase: Phase) -> Result<u64, Error> {
        self.submit(EventBody::StepStarted {
            step_id: step_id.to_string(),
            phase,
        })
    }

    /// Append a `step.finished` event.
    pub fn append_step_finished(&self, step_id: &str, phase: Phase) -> Result<u64, Error> {
        self.submit(EventBody::StepFinished {
            step_id: step_id.to_string(),
            phase,
        })
    }

    /// Append a `step.failed` event.
    pub fn append_step_failed(
        &self,
        step_id: &str,
        phase: Phase,
        reason: &str,
    ) -> Result<u64, Error> {
        self.submit(EventBody::StepFailed {
            step_id: step_id.to_string(),
            phase,
            reason: reason.to_string(),
        })
    }

    /// Append an `llm.requested` event.
    pub fn append_llm_requested(&self, step_id: &str) -> Result<u64, Error> {
        self.submit(EventBody::LlmRequested {
            step_id: step_id.to_string(),
        })
    }

    /// Append an `llm.responded` event.
    pub fn append_llm_responded(&self, step_id: &str) -> Result<u64, Error> {
        self.submit(EventBody::LlmResponded {
            step_id: step_id.to_string(),
        })
    }

    /// Append a `tool.called` event.
    pub fn append_tool_called(&self, step_id: &str, tool_name: &str) -> Result<u64, Error> {
        self.submit(EventBody::ToolCalled {
            step_id: step_id.to_string(),
            tool_name: tool_name.to_string(),
        })
    }

    /// Append a `tool.returned` event.
    pub fn append_tool_returned(&self, step_id: &str, tool_name: &str) -> Result<u64, Error> {
        self.submit(EventBody::ToolReturned {
            step_id: step_id.to_string(),
            tool_name: tool_name.to_string(),
        })
    }

    /// Append a `tool.failed` event.
    pub fn append_tool_failed(
        &self,
        step_id: &str,
        tool_name: &str,
        reason: &str,
    ) -> Result<u64, Error> {
        self.submit(EventBody::ToolFailed {
            step_id: step_id.to_string(),
            tool_name: tool_name.to_string(),
            reason: reason.to_string(),
        })
    }

    /// Append an `artifact.created` event.
    pub fn append_artifact_created(&self, step_id: &str, path: &str) -> Result<u64, Error> {
        self.submit(EventBody::ArtifactCreated {
            step_id: step_id.to_string(),
            path: path.to_string(),
        })
    }

    /// Append an already-built body; used by the engine after its checks.
    pub(crate) fn append_body(&self, body: EventBody) -> Result<u64, Error> {
        self.submit(body)
    }

    fn submit(&self, body: EventBody) -> Result<u64, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("event log"));
        }
        let sender = {
            let guard = self.sender.lock().expect("event log sender lock");
            match guard.as_ref() {
                Some(sender) => sender.clone(),
                None => return Err(Error::Closed("event log")),
            }
        };

        let (reply_sender, reply_receiver) = sync_channel(1);
        let request = AppendRequest {
            body,
            reply: reply_sender,
        };
        // Blocks while the bounded queue is full; fails only when the
        // writer has already drained and exited.
        sender
            .send(request)
            .map_err(|_| Error::Closed("event log"))?;

        reply_receiver.recv().map_err(|_| {
            Error::io(
                "event log writer terminated before replying",
                io::Error::other("writer thread exited"),
            )
        })?
    }

    /// Close the log: stop accepting submissions, drain every already-queued
    /// request (each still receives its normal reply), flush, and release
    /// the file. A second close fails with [`Error::Closed`].
    pub fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed("event log"));
        }

        // Dropping the sender disconnects the channel once in-flight
        // submitters have finished; the writer drains what is left, then
        // flushes and exits.
        let sender = self.sender.lock().expect("event log sender lock").take();
        drop(sender);

        let handle = self.writer.lock().expect("event log writer lock").take();
        match handle {
            Some(handle) => handle.join().map_err(|_| {
                Error::io(
                    "event log writer panicked",
                    io::Error::other("writer thread panicked"),
                )
            })?,
            None => Ok(()),
        }
    }
}

/// The single writer: assigns seq, formats, encodes, flushes, replies.
fn writer_loop(
    file: File,
    run_id: RunId,
    mut next_seq: u64,
    receiver: Receiver<AppendRequest>,
    fsync: bool,
) -> Result<(), Error> {
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER_BYTES, file);
    let mut fatal: Option<io::ErrorKind> = None;

    while let Ok(request) = receiver.recv() {
        let result = write_event(
            &mut writer,
            &run_id,
            &mut next_seq,
            &mut fatal,
            fsync,
            &request.body,
        );
        // The reply slot always has room; a vanished caller is not the
        // log's problem.
        let _ = request.reply.send(result);
    }

    // Channel disconnected: the log was closed and the queue fully drained.
    writer
        .flush()
        .map_err(|err| Error::io("flush event log on close", err))?;
    let file = writer
        .into_inner()
        .map_err(|err| Error::io("flush event log on close", err.into_error()))?;
    if fsync {
        file.sync_data()
            .map_err(|err| Error::io("fsync event log on close", err))?;
    }
    debug!(run_id = %run_id, "event log writer exited");
    Ok(())
}

/// Write one event: exactly one JSON object and one `\n`, flushed to the OS.
///
/// `next_seq` only advances after the bytes are flushed, so every
/// successfully reported append has a dense seq. Once a write or flush
/// fails the writer latches: the torn tail makes the on-disk seq
/// untrustworthy, so later appends keep failing instead of pretending
/// success.
fn write_event(
    writer: &mut BufWriter<File>,
    run_id: &RunId,
    next_seq: &mut u64,
    fatal: &mut Option<io::ErrorKind>,
    fsync: bool,
    body: &EventBody,
) -> Result<u64, Error> {
    check::gt(*next_seq, 0, "next_seq must stay positive");
    if let Some(kind) = fatal {
        return Err(Error::io(
            "event log unusable after earlier I/O failure",
            io::Error::new(*kind, "a previous write failed"),
        ));
    }

    let seq = *next_seq;
    let event = format::materialize(seq, run_id, body);
    check::eq(event.seq(), seq, "formatter must keep the assigned seq");

    // Serialize before touching the file so an encode failure leaves no gap.
    let mut line = serde_json::to_string(&event).map_err(|err| {
        Error::io(
            "encode event",
            io::Error::new(io::ErrorKind::InvalidData, err),
        )
    })?;
    line.push('\n');

    if let Err(err) = writer
        .write_all(line.as_bytes())
        .and_then(|()| writer.flush())
    {
        warn!(run_id = %run_id, seq, error = %err, "event write failed; latching");
        *fatal = Some(err.kind());
        return Err(Error::io(format!("write event seq {seq}"), err));
    }
    if fsync {
        if let Err(err) = writer.get_ref().sync_data() {
            warn!(run_id = %run_id, seq, error = %err, "event fsync failed; latching");
            *fatal = Some(err.kind());
            return Err(Error::io(format!("fsync event seq {seq}"), err));
        }
    }

    *next_seq = seq + 1;
    check::gt(*next_seq, seq, "next_seq must advance");
    Ok(seq)
}

/// Scan an existing log and return its last seq.
///
/// Requires every line to parse and every seq to be positive and strictly
/// greater than the previous one. Fails with the offending line number on
/// any violation, including a torn trailing line.
fn scan_last_seq(path: &Path) -> Result<u64, Error> {
    let file = File::open(path)
        .map_err(|err| Error::io(format!("open {} for scan", path.display()), err))?;
    let reader = BufReader::new(file);

    #[derive(Deserialize)]
    struct Envelope {
        seq: u64,
    }

    let mut last_seq = 0u64;
    for (index, line) in reader.lines().enumerate() {
        let line_no = index as u64 + 1;
        let line = line.map_err(|err| {
            Error::io(format!("read {} line {line_no}", path.display()), err)
        })?;
        let envelope: Envelope = serde_json::from_str(&line)
            .map_err(|err| Error::corruption(line_no, format!("invalid JSON: {err}")))?;
        if envelope.seq == 0 {
            return Err(Error::corruption(line_no, "seq must be positive"));
        }
        if envelope.seq <= last_seq {
            return Err(Error::corruption(
                line_no,
                format!(
                    "seq {} is not strictly increasing (previous {last_seq})",
                    envelope.seq
                ),
            ));
        }
        check::gt(envelope.seq, last_seq, "scan must advance seq");
        last_seq = envelope.seq;
    }
    Ok(last_seq)
}

fn create_logs_dir(dir: &Path) -> Result<(), Error> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder
        .create(dir)
        .map_err(|err| Error::io(format!("create log directory {}", dir.display()), err))
}

fn open_append(path: &Path) -> Result<File, Error> {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }
    options
        .open(path)
        .map_err(|err| Error::io(format!("open event log {}", path.display()), err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::Event;
    use std::sync::Arc;

    fn run_id() -> RunId {
        RunId::from("run-log-test")
    }

    fn parse_lines(contents: &str) -> Vec<Event> {
        contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("parse line"))
            .collect()
    }

    #[test]
    fn fresh_log_appends_dense_seq_from_one() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = EventLog::open(run_id(), temp.path()).expect("open");

        let ws = temp.path().to_string_lossy().into_owned();
        assert_eq!(log.append_run_started(&ws).expect("append"), 1);
        assert_eq!(
            log.append_step_started("step-1", Phase::DataIngestion)
                .expect("append"),
            2
        );
        assert_eq!(
            log.append_step_finished("step-1", Phase::DataIngestion)
                .expect("append"),
            3
        );
        assert_eq!(log.append_run_finished().expect("append"), 4);
        log.close().expect("close");

        let contents = fs::read_to_string(log.path()).expect("read log");
        assert!(!contents.contains('\u{FEFF}'));
        assert!(contents.ends_with('\n'));
        let events = parse_lines(&contents);
        assert_eq!(events.len(), 4);
        for (index, event) in events.iter().enumerate() {
            assert_eq!(event.seq(), index as u64 + 1);
            assert_eq!(event.run_id(), &run_id());
        }
        assert_eq!(events[3].type_tag(), "run.finished");
        assert!(contents.lines().last().expect("last line").contains("\"type\":\"run.finished\""));
    }

    #[test]
    fn reopen_resumes_after_last_seq() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = temp.path().to_string_lossy().into_owned();

        let log = EventLog::open(run_id(), temp.path()).expect("open");
        log.append_run_started(&ws).expect("append");
        for index in 0..9 {
            log.append_step_started(&format!("step-{index}"), Phase::DataIngestion)
                .expect("append");
        }
        log.close().expect("close");

        // Crash-style resume: same run, same workspace.
        let log = EventLog::open(run_id(), temp.path()).expect("reopen");
        let seq = log
            .append_step_started("step-after-resume", Phase::DataIngestion)
            .expect("append");
        assert_eq!(seq, 11);
        log.close().expect("close");

        let contents = fs::read_to_string(log.path()).expect("read log");
        let events = parse_lines(&contents);
        assert_eq!(events.len(), 11);
        assert_eq!(events.last().expect("last").seq(), 11);
    }

    #[test]
    fn append_after_close_fails_with_closed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = EventLog::open(run_id(), temp.path()).expect("open");
        log.append_run_started("/tmp/ws").expect("append");
        log.close().expect("close");

        let err = log.append_run_finished().expect_err("closed log");
        assert!(matches!(err, Error::Closed(_)), "{err}");
    }

    #[test]
    fn close_twice_reports_already_closed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = EventLog::open(run_id(), temp.path()).expect("open");
        log.close().expect("first close");
        let err = log.close().expect_err("second close");
        assert!(matches!(err, Error::Closed(_)), "{err}");
    }

    #[test]
    fn empty_existing_file_starts_at_one() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = WorkspaceLayout::new(temp.path());
        fs::create_dir_all(&layout.logs_dir).expect("mkdir");
        fs::write(layout.log_path(&run_id()), "").expect("touch");

        let log = EventLog::open(run_id(), temp.path()).expect("open");
        assert_eq!(log.append_run_started("/tmp/ws").expect("append"), 1);
        log.close().expect("close");
    }

    #[test]
    fn open_rejects_malformed_line_with_its_number() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = WorkspaceLayout::new(temp.path());
        fs::create_dir_all(&layout.logs_dir).expect("mkdir");
        fs::write(
            layout.log_path(&run_id()),
            "{\"type\":\"run.started\",\"seq\":1,\"run_id\":\"run-log-test\",\"workspace_root\":\"/tmp/ws\"}\n\
             {\"type\":\"step.sta",
        )
        .expect("write corrupt log");

        let err = EventLog::open(run_id(), temp.path()).expect_err("corrupt");
        assert!(matches!(err, Error::Corruption { line: 2, .. }), "{err}");
    }

    #[test]
    fn open_rejects_non_increasing_seq() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = WorkspaceLayout::new(temp.path());
        fs::create_dir_all(&layout.logs_dir).expect("mkdir");
        fs::write(
            layout.log_path(&run_id()),
            "{\"seq\":1,\"type\":\"run.started\",\"run_id\":\"run-log-test\",\"workspace_root\":\"/tmp/ws\"}\n\
             {\"seq\":1,\"type\":\"run.finished\",\"run_id\":\"run-log-test\"}\n",
        )
        .expect("write log");

        let err = EventLog::open(run_id(), temp.path()).expect_err("stale seq");
        match err {
            Error::Corruption { line, ref message } => {
                assert_eq!(line, 2);
                assert!(message.contains("strictly increasing"), "{message}");
            }
            other => panic!("expected corruption, got {other}"),
        }
    }

    #[test]
    fn open_rejects_zero_seq() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = WorkspaceLayout::new(temp.path());
        fs::create_dir_all(&layout.logs_dir).expect("mkdir");
        fs::write(
            layout.log_path(&run_id()),
            "{\"seq\":0,\"type\":\"run.finished\",\"run_id\":\"run-log-test\"}\n",
        )
        .expect("write log");

        let err = EventLog::open(run_id(), temp.path()).expect_err("zero seq");
        assert!(matches!(err, Error::Corruption { line: 1, .. }), "{err}");
    }

    #[test]
    fn concurrent_appends_keep_seq_dense() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = Arc::new(EventLog::open(run_id(), temp.path()).expect("open"));
        log.append_run_started("/tmp/ws").expect("append");

        std::thread::scope(|scope| {
            for worker in 0..10 {
                let log = Arc::clone(&log);
                scope.spawn(move || {
                    for iteration in 0..100 {
                        log.append_step_started(
                            &format!("step-{worker}-{iteration}"),
                            Phase::DataIngestion,
                        )
                        .expect("append");
                    }
                });
            }
        });
        log.close().expect("close");

        let contents = fs::read_to_string(log.path()).expect("read log");
        let events = parse_lines(&contents);
        assert_eq!(events.len(), 1001);
        for (index, event) in events.iter().enumerate() {
            assert_eq!(event.seq(), index as u64 + 1, "seq must stay dense");
        }
    }

    #[test]
    fn writes_are_not_html_escaped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = EventLog::open(run_id(), temp.path()).expect("open");
        log.append_run_started("/tmp/ws").expect("append");
        log.append_step_started("step-1", Phase::DataIngestion)
            .expect("append");
        log.append_tool_called("step-1", "<quote> & feed").expect("append");
        log.close().expect("close");

        let contents = fs::read_to_string(log.path()).expect("read log");
        assert!(contents.contains("<quote> & feed"));
        assert!(!contents.contains("\\u003c"));
    }

    #[test]
    fn fsync_option_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = EventLog::open_with(
            run_id(),
            temp.path(),
            &EventLogOptions { fsync: true },
        )
        .expect("open");
        log.append_run_started("/tmp/ws").expect("append");
        log.append_run_finished().expect("append");
        log.close().expect("close");

        let contents = fs::read_to_string(log.path()).expect("read log");
        assert_eq!(parse_lines(&contents).len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn log_file_and_directory_modes_are_fixed() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let log = EventLog::open(run_id(), temp.path()).expect("open");
        log.append_run_started("/tmp/ws").expect("append");
        log.close().expect("close");

        let layout = WorkspaceLayout::new(temp.path());
        let dir_mode = fs::metadata(&layout.logs_dir)
            .expect("logs dir")
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o755);
        let file_mode = fs::metadata(log.path())
            .expect("log file")
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o644);
    }
}
