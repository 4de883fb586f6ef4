//! Canonical `.aiplatform/` paths under a workspace root.

use std::path::{Path, PathBuf};

use crate::core::ident::RunId;

/// Engine-owned locations within a workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    pub root: PathBuf,
    pub platform_dir: PathBuf,
    /// Event logs, one `<run_id>.jsonl` per run. Created on demand.
    pub logs_dir: PathBuf,
    /// Reserved for external collaborators (broker credentials and the
    /// like); the engine never reads or writes it.
    pub credentials_dir: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let platform_dir = root.join(".aiplatform");
        Self {
            logs_dir: platform_dir.join("logs"),
            credentials_dir: platform_dir.join("credentials"),
            platform_dir,
            root,
        }
    }

    /// Path of the event log for `run_id`.
    pub fn log_path(&self, run_id: &RunId) -> PathBuf {
        self.logs_dir.join(format!("{run_id}.jsonl"))
    }
}
