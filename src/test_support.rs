//! Test-only helpers for building workspaces and hand-written logs.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::core::ident::RunId;
use crate::io::layout::WorkspaceLayout;

/// Temporary workspace root with `.aiplatform/` scaffolding on demand.
///
/// The directory is removed when the value drops.
pub struct TestWorkspace {
    // Held only so the directory outlives the workspace.
    _dir: TempDir,
    root: PathBuf,
}

impl TestWorkspace {
    pub fn new() -> Result<TestWorkspace> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        // Canonicalize up front so comparisons against engine-normalized
        // paths hold on platforms where the temp dir sits behind a symlink.
        let root = fs::canonicalize(dir.path()).context("canonicalize tempdir")?;
        Ok(TestWorkspace { _dir: dir, root })
    }

    /// Normalized workspace root.
    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// Workspace root as the string callers pass to the engine.
    pub fn root_str(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }

    /// Canonical path of the event log for `run_id`.
    pub fn log_path(&self, run_id: &RunId) -> PathBuf {
        WorkspaceLayout::new(&self.root).log_path(run_id)
    }

    /// Write raw `lines` as the log file for `run_id`, creating the layout.
    pub fn write_log(&self, run_id: &RunId, lines: &[String]) -> Result<PathBuf> {
        let layout = WorkspaceLayout::new(&self.root);
        fs::create_dir_all(&layout.logs_dir).context("create logs dir")?;
        let path = layout.log_path(run_id);
        let mut contents = lines.join("\n");
        contents.push('\n');
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Read the log file for `run_id`.
    pub fn read_log(&self, run_id: &RunId) -> Result<String> {
        let path = self.log_path(run_id);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }
}

/// Render a JSON value as one log line.
pub fn log_line(value: &serde_json::Value) -> String {
    value.to_string()
}
