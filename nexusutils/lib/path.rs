//! `nexusutils::path` is a module containing the canonical path model used for instance
//! workspaces.
//!
//! Workspace paths are slash-separated, always absolute, never carry a trailing slash and never
//! escape the workspace root. Every path except `/` has exactly one parent, which is the string
//! before its last `/`.

use typed_path::{Utf8UnixComponent, Utf8UnixPathBuf};

use crate::{NexusutilsError, NexusutilsResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The root of every workspace tree.
pub const WORKSPACE_ROOT: &str = "/";

/// The suffix for log files
pub const LOG_SUFFIX: &str = "log";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Canonicalizes a workspace path.
///
/// Rules:
/// - Relative paths are resolved against the workspace root (`index.js` becomes `/index.js`)
/// - `.` components and redundant separators are removed, as are trailing slashes
/// - `..` components are resolved, but may not climb above the root
/// - The empty path is the root
pub fn canonicalize_path(path: &str) -> NexusutilsResult<String> {
    let path = Utf8UnixPathBuf::from(path.trim());
    let mut segments: Vec<String> = Vec::new();

    for component in path.components() {
        match component {
            Utf8UnixComponent::RootDir | Utf8UnixComponent::CurDir => continue,
            Utf8UnixComponent::ParentDir => {
                if segments.pop().is_none() {
                    return Err(NexusutilsError::PathValidation(
                        "Invalid path: cannot traverse above root directory".to_string(),
                    ));
                }
            }
            Utf8UnixComponent::Normal(segment) => {
                if segment.contains('\0') {
                    return Err(NexusutilsError::PathValidation(
                        "Invalid path: contains a NUL byte".to_string(),
                    ));
                }
                if !segment.is_empty() {
                    segments.push(segment.to_string());
                }
            }
        }
    }

    if segments.is_empty() {
        return Ok(WORKSPACE_ROOT.to_string());
    }

    Ok(format!("/{}", segments.join("/")))
}

/// Returns the parent of a canonical path, or `None` for the root.
///
/// `/src/a.js` has parent `/src` and `/index.js` has parent `/`.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == WORKSPACE_ROOT {
        return None;
    }

    match path.rfind('/') {
        Some(0) => Some(WORKSPACE_ROOT),
        Some(idx) => Some(&path[..idx]),
        None => Some(WORKSPACE_ROOT),
    }
}

/// Returns the last segment of a canonical path. The root has an empty name.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or_default()
}

/// Joins a canonical directory path and a child name.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir == WORKSPACE_ROOT {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Checks whether `path` is `ancestor` itself or lives underneath it.
///
/// Only whole segments match: `/src2` is not under `/src`.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if ancestor == WORKSPACE_ROOT || path == ancestor {
        return true;
    }

    path.strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Rewrites `path` from underneath `from` to underneath `to`.
///
/// Returns `None` when `path` is not within `from`.
pub fn rebase_path(path: &str, from: &str, to: &str) -> Option<String> {
    if !is_within(path, from) {
        return None;
    }

    if path == from {
        return Some(to.to_string());
    }

    let rest = if from == WORKSPACE_ROOT {
        path
    } else {
        &path[from.len()..]
    };

    if to == WORKSPACE_ROOT {
        Some(rest.to_string())
    } else {
        Some(format!("{}{}", to, rest))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
