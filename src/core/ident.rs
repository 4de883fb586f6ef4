//! Collision-resistant identifiers for runs, steps, calls, and artifacts.
//!
//! All identifiers are 128-bit random UUID-v4 strings from the process-wide
//! cryptographic random source. Run identifiers carry a `run-` prefix; the
//! rest are bare. Collisions are treated as impossible: one detected
//! against live state is a programmer error, not an operational one.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque run identifier: `run-` followed by a UUID-v4.
///
/// Never reused within the log namespace, across restarts included.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Wrap an existing identifier, e.g. one recovered from a stored log.
    pub fn new(id: impl Into<String>) -> Self {
        RunId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(id: &str) -> Self {
        RunId(id.to_string())
    }
}

impl From<String> for RunId {
    fn from(id: String) -> Self {
        RunId(id)
    }
}

/// Generate a fresh run identifier.
pub fn new_run_id() -> RunId {
    RunId(format!("run-{}", Uuid::new_v4()))
}

/// Generate a fresh step identifier, unique within a run.
pub fn new_step_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a fresh tool-call identifier.
pub fn new_tool_call_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a fresh LLM-call identifier.
pub fn new_llm_call_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a fresh artifact identifier.
pub fn new_artifact_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a fresh event identifier.
pub fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn run_ids_carry_prefix_and_v4_shape() {
        let id = new_run_id();
        let raw = id.as_str().strip_prefix("run-").expect("run- prefix");
        let uuid = Uuid::parse_str(raw).expect("uuid body");
        assert_eq!(uuid.get_version_num(), 4);
    }

    #[test]
    fn step_ids_are_bare_v4() {
        let id = new_step_id();
        let uuid = Uuid::parse_str(&id).expect("uuid body");
        assert_eq!(uuid.get_version_num(), 4);
        assert!(!id.starts_with("run-"));
    }

    #[test]
    fn generated_ids_do_not_repeat() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(new_run_id().as_str().to_string()));
            assert!(seen.insert(new_step_id()));
        }
    }

    #[test]
    fn run_id_serializes_as_plain_string() {
        let id = RunId::from("run-abc");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"run-abc\"");
        let back: RunId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
    }
}
