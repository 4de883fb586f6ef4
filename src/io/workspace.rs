//! Workspace-root validation and artifact-path containment.
//!
//! Every run is rooted in one absolute, normalized directory; log and
//! artifact paths are confined to it. All three operations here are
//! deterministic for a given filesystem state and safe to call from any
//! thread.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::core::check;
use crate::core::path::{clean_absolute, confine_relative};
use crate::error::Error;

/// Validate a caller-supplied workspace root: non-empty, absolute, and an
/// existing directory.
pub fn validate_workspace_root(path: &str) -> Result<(), Error> {
    if path.trim().is_empty() {
        return Err(Error::invalid_argument("workspace_root must not be empty"));
    }
    let candidate = Path::new(path);
    if !candidate.is_absolute() {
        return Err(Error::invalid_argument(format!(
            "workspace_root must be an absolute path: {path}"
        )));
    }
    let metadata = fs::metadata(candidate).map_err(|_| {
        Error::invalid_argument(format!("workspace_root does not exist: {path}"))
    })?;
    if !metadata.is_dir() {
        return Err(Error::invalid_argument(format!(
            "workspace_root is not a directory: {path}"
        )));
    }
    Ok(())
}

/// Clean `path` and resolve symlinks. The result is absolute and names an
/// existing location.
pub fn normalize(path: &str) -> Result<PathBuf, Error> {
    let candidate = Path::new(path);
    if !candidate.is_absolute() {
        return Err(Error::invalid_argument(format!(
            "workspace_root must be an absolute path: {path}"
        )));
    }
    let resolved = fs::canonicalize(candidate).map_err(|_| {
        Error::invalid_argument(format!(
            "workspace_root contains a broken symlink or does not exist: {path}"
        ))
    })?;
    check::is_true(resolved.is_absolute(), "canonicalized path must be absolute");
    debug!(path, resolved = %resolved.display(), "workspace root normalized");
    Ok(resolved)
}

/// Resolve `candidate` (absolute or workspace-relative) against
/// `workspace_root` and require the result to stay equal to or inside the
/// root. Resolution is lexical so the verdict matches replay's.
pub fn contain(workspace_root: &Path, candidate: &str) -> Result<PathBuf, Error> {
    check::is_true(
        workspace_root.is_absolute(),
        "workspace_root must already be normalized",
    );
    if candidate.is_empty() {
        return Err(Error::invalid_argument("path must not be empty"));
    }

    if Path::new(candidate).is_absolute() {
        let cleaned = clean_absolute(Path::new(candidate));
        if cleaned == workspace_root || cleaned.starts_with(workspace_root) {
            return Ok(cleaned);
        }
        return Err(Error::contained(candidate));
    }

    let relative = confine_relative(candidate).ok_or_else(|| Error::contained(candidate))?;
    Ok(workspace_root.join(relative))
}
