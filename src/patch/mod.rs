//! Patch applier: unified diff parsing, byte-exact application and diff generation.
//!
//! A candidate patch that cannot be applied is a normal outcome, reported as
//! a [`PatchRejected`] and scored 0.0 without running anything.

pub mod apply;
pub mod diff;
pub mod parse;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use apply::{apply_hunks, apply_patch, AppliedPatch, PatchSummary, PathPolicy};
pub use diff::{diff_file, unified_diff};
pub use parse::{parse_patch, FileChange, FilePatch, Hunk, HunkLine, Patch};

/// Why a candidate patch was not applied.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatchRejected {
    #[error("malformed diff at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("hunk {hunk} of '{path}' does not match the starting tree (stated at line {line})")]
    ContextMismatch {
        path: String,
        hunk: usize,
        line: usize,
    },

    #[error("'{path}' may not be changed: {reason}")]
    PolicyViolation { path: String, reason: String },

    #[error("'{path}' does not exist in the starting tree")]
    MissingFile { path: String },

    #[error("'{path}' already exists in the starting tree")]
    FileExists { path: String },

    #[error("no candidate patch was supplied for this task")]
    NoCandidate,
}

/// Checks that `path` is a plain relative path that stays inside its root.
///
/// Returns the reason on failure.
pub fn validate_relative_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("empty path".to_string());
    }
    let drive_letter = path.as_bytes().get(1) == Some(&b':');
    if path.starts_with('/') || path.starts_with('\\') || drive_letter {
        return Err(format!("absolute path '{path}'"));
    }
    if path.contains('\0') {
        return Err("path contains a NUL byte".to_string());
    }
    for component in path.split(['/', '\\']) {
        match component {
            ".." => return Err(format!("'{path}' escapes the tree")),
            "" | "." => return Err(format!("'{path}' is not a normalized relative path")),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_relative_path() {
        assert!(validate_relative_path("src/main.c").is_ok());
        assert!(validate_relative_path("a.txt").is_ok());
        assert!(validate_relative_path("/etc/passwd").is_err());
        assert!(validate_relative_path("C:/x").is_err());
        assert!(validate_relative_path("../x").is_err());
        assert!(validate_relative_path("src/../../x").is_err());
        assert!(validate_relative_path("src//x").is_err());
        assert!(validate_relative_path("").is_err());
    }

    #[test]
    fn test_rejection_serializes_with_kind() {
        let json = serde_json::to_value(PatchRejected::MissingFile {
            path: "a.c".to_string(),
        })
        .expect("serialize");
        assert_eq!(json["kind"], "missing_file");
        assert_eq!(json["path"], "a.c");
    }
}
