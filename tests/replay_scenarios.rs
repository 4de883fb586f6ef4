//! Replay verdicts over engine-written and hand-written logs.
//!
//! Engine-written logs exercise the round-trip property (everything the
//! engine accepts must replay cleanly); hand-written logs exercise the
//! corruption and boundary verdicts the engine itself would never produce.

use runlog::core::ident::RunId;
use runlog::core::phase::Phase;
use runlog::core::replay::{ReplayOptions, replay, replay_with};
use runlog::core::view::{RunOutcome, StepOutcome};
use runlog::engine::Engine;
use runlog::error::Error;
use runlog::io::event_log::EventLog;
use runlog::test_support::{TestWorkspace, log_line};
use serde_json::json;

/// Replay(write(events)) reconstructs the step/tool/artifact sets that
/// were written, via the raw `EventLog` (no engine checks in the way).
#[test]
fn replay_of_written_log_matches_written_events() {
    let ws = TestWorkspace::new().expect("workspace");
    let run_id = RunId::from("run-roundtrip");
    let log = EventLog::open(run_id.clone(), ws.root()).expect("open");

    log.append_run_started(&ws.root_str()).expect("run started");
    log.append_step_started("step-1", Phase::DataIngestion)
        .expect("step started");
    log.append_tool_called("step-1", "fetch_quotes")
        .expect("tool called");
    log.append_tool_returned("step-1", "fetch_quotes")
        .expect("tool returned");
    log.append_artifact_created("step-1", "data/quotes.csv")
        .expect("artifact");
    log.append_step_finished("step-1", Phase::DataIngestion)
        .expect("step finished");
    log.append_run_finished().expect("run finished");
    log.close().expect("close");

    let contents = ws.read_log(&run_id).expect("read log");
    let view = replay(&run_id, contents.as_bytes()).expect("replay");

    assert_eq!(view.outcome, RunOutcome::Finished);
    assert_eq!(view.last_seq, 7);
    let step = view.step("step-1").expect("step-1");
    assert_eq!(step.outcome, StepOutcome::Finished);
    assert_eq!(step.tool_calls.len(), 1);
    assert_eq!(step.tool_calls[0].tool_name, "fetch_quotes");
    assert_eq!(step.artifacts, vec!["data/quotes.csv".to_string()]);
}

/// A log whose third line repeats an earlier seq is corruption at line 3,
/// and no view is produced.
#[test]
fn decreasing_seq_reports_corruption_at_line_three() {
    let run_id = RunId::from("run-corrupt");
    let lines = [
        log_line(&json!({
            "type": "run.started", "seq": 1, "run_id": "run-corrupt",
            "workspace_root": "/tmp/ws",
        })),
        log_line(&json!({
            "type": "step.started", "seq": 2, "run_id": "run-corrupt",
            "step_id": "step-1", "phase": "data_ingestion",
        })),
        log_line(&json!({
            "type": "step.finished", "seq": 2, "run_id": "run-corrupt",
            "step_id": "step-1", "phase": "data_ingestion",
        })),
    ];
    let bytes = format!("{}\n", lines.join("\n"));

    let err = replay(&run_id, bytes.as_bytes()).expect_err("corrupt seq");
    match err {
        Error::Corruption { line, message } => {
            assert_eq!(line, 3);
            assert!(message.contains("seq 2"), "{message}");
            assert!(message.contains("previous 2"), "{message}");
        }
        other => panic!("expected corruption, got {other}"),
    }
}

/// A log that does not open with `run.started` is a lifecycle violation.
#[test]
fn log_not_opening_with_run_started_is_lifecycle_violation() {
    let run_id = RunId::from("run-headless");
    let line = log_line(&json!({
        "type": "step.started", "seq": 1, "run_id": "run-headless",
        "step_id": "step-1", "phase": "data_ingestion",
    }));
    let bytes = format!("{line}\n");

    let err = replay(&run_id, bytes.as_bytes()).expect_err("headless log");
    assert!(matches!(err, Error::Lifecycle { .. }), "{err}");
}

/// Scan-on-open agrees with replay about corrupt files: the engine's
/// `EventLog::open` refuses the same bytes replay refuses.
#[test]
fn open_and_replay_agree_on_corrupt_bytes() {
    let ws = TestWorkspace::new().expect("workspace");
    let run_id = RunId::from("run-agree");
    let lines = [
        log_line(&json!({
            "type": "run.started", "seq": 1, "run_id": "run-agree",
            "workspace_root": "/tmp/ws",
        })),
        "{\"type\":\"run.fin".to_string(),
    ];
    ws.write_log(&run_id, &lines).expect("write log");

    let open_err = EventLog::open(run_id.clone(), ws.root()).expect_err("open refuses");
    assert!(matches!(open_err, Error::Corruption { line: 2, .. }), "{open_err}");

    let contents = ws.read_log(&run_id).expect("read log");
    let replay_err = replay(&run_id, contents.as_bytes()).expect_err("replay refuses");
    assert!(matches!(replay_err, Error::Corruption { line: 2, .. }), "{replay_err}");
}

/// An engine-abandoned (unterminated) log reconstructs to running, and
/// `require_terminal` upgrades that to an error.
#[test]
fn unterminated_engine_log_is_running_unless_terminal_demanded() {
    let ws = TestWorkspace::new().expect("workspace");
    let engine = Engine::new();
    let run_id = engine.start_run(&ws.root_str()).expect("start run");
    engine
        .append_step_started(&run_id, "step-1", Phase::DataIngestion)
        .expect("start step");
    engine.shutdown().expect("shutdown");

    let contents = ws.read_log(&run_id).expect("read log");
    let view = replay(&run_id, contents.as_bytes()).expect("running view");
    assert_eq!(view.outcome, RunOutcome::Running);
    assert_eq!(view.steps[0].outcome, StepOutcome::Running);

    let err = replay_with(
        &run_id,
        contents.as_bytes(),
        &ReplayOptions {
            require_terminal: true,
        },
    )
    .expect_err("terminal demanded");
    assert!(matches!(err, Error::Lifecycle { .. }), "{err}");
}

/// Ten concurrent producers, one hundred appends each: the file holds all
/// 1001 lines with dense seq and replays without a verdict against it.
#[test]
fn concurrent_producers_serialize_into_one_replayable_order() {
    let ws = TestWorkspace::new().expect("workspace");
    let run_id = RunId::from("run-concurrent");
    let log = EventLog::open(run_id.clone(), ws.root()).expect("open");
    log.append_run_started(&ws.root_str()).expect("run started");

    std::thread::scope(|scope| {
        for worker in 0..10 {
            let log = &log;
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

    let contents = ws.read_log(&run_id).expect("read log");
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 1001);
    for (index, line) in lines.iter().enumerate() {
        let value: serde_json::Value = serde_json::from_str(line).expect("line parses");
        assert_eq!(value["seq"], json!(index as u64 + 1));
    }

    // 1000 steps blow the per-phase attempt limit, so replay rejects the
    // log with an ordering verdict rather than a parse failure: the
    // interleaving itself is intact.
    let err = replay(&run_id, contents.as_bytes()).expect_err("attempt limit");
    assert!(matches!(err, Error::Ordering { .. }), "{err}");
}

/// Artifact escape attempts recorded in a hand-written log surface as
/// containment verdicts with the offending path.
#[test]
fn artifact_escape_in_stored_log_is_contained_violation() {
    let run_id = RunId::from("run-escape");
    let lines = [
        log_line(&json!({
            "type": "run.started", "seq": 1, "run_id": "run-escape",
            "workspace_root": "/tmp/ws",
        })),
        log_line(&json!({
            "type": "step.started", "seq": 2, "run_id": "run-escape",
            "step_id": "step-1", "phase": "data_ingestion",
        })),
        log_line(&json!({
            "type": "artifact.created", "seq": 3, "run_id": "run-escape",
            "step_id": "step-1", "path": "../../etc/passwd",
        })),
    ];
    let bytes = format!("{}\n", lines.join("\n"));

    let err = replay(&run_id, bytes.as_bytes()).expect_err("escape");
    match err {
        Error::Contained { path } => assert_eq!(path, "../../etc/passwd"),
        other => panic!("expected contained, got {other}"),
    }
}
