//! Byte-exact hunk application.
//!
//! Files are split on `\n` only, so `\r` stays part of the line and CRLF
//! files round-trip unchanged. Each hunk is tried at its stated position
//! first, then at the nearest matching offset that does not overlap the
//! previous hunk, at most [`MAX_DRIFT`] lines away. Context lines must match
//! exactly; there is no fuzz.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::parse::{FileChange, Hunk, HunkLine, Patch};
use super::{validate_relative_path, PatchRejected};
use crate::task::FileTree;

/// How far a hunk may land from its expected position.
pub const MAX_DRIFT: usize = 100;

/// Which paths a patch may touch.
#[derive(Debug, Clone, Default)]
pub struct PathPolicy<'a> {
    /// Allowed targets; `None` allows any safe relative path.
    pub permitted: Option<&'a BTreeSet<String>>,
    /// Harness paths a patch must never write.
    pub harness: Option<&'a FileTree>,
}

/// Lines added and removed by a patch, as recorded in run records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSummary {
    pub files: Vec<String>,
    pub lines_added: usize,
    pub lines_removed: usize,
}

impl PatchSummary {
    pub fn files_changed(&self) -> usize {
        self.files.len()
    }
}

/// Result of applying a patch to an in-memory tree.
#[derive(Debug, Clone)]
pub struct AppliedPatch {
    pub tree: FileTree,
    pub touched: BTreeSet<String>,
    pub summary: PatchSummary,
}

/// Applies `patch` to `base`, returning the post-image tree.
pub fn apply_patch(
    base: &FileTree,
    patch: &Patch,
    policy: &PathPolicy<'_>,
) -> Result<AppliedPatch, PatchRejected> {
    let mut tree = base.clone();
    let mut touched = BTreeSet::new();
    let mut summary = PatchSummary::default();

    for file in &patch.files {
        let path = file.target().to_string();
        check_policy(&path, policy)?;
        if let (Some(old), Some(new)) = (&file.old_path, &file.new_path) {
            if old != new {
                return Err(PatchRejected::PolicyViolation {
                    path: path.clone(),
                    reason: format!("renaming '{old}' is not supported"),
                });
            }
        }

        for hunk in &file.hunks {
            for line in &hunk.lines {
                match line {
                    HunkLine::Add(_) => summary.lines_added += 1,
                    HunkLine::Remove(_) => summary.lines_removed += 1,
                    HunkLine::Context(_) => {}
                }
            }
        }

        match file.change() {
            FileChange::Create => {
                if tree.contains_key(&path) {
                    return Err(PatchRejected::FileExists { path });
                }
                let content = apply_hunks(&path, b"", &file.hunks)?;
                tree.insert(path.clone(), content);
            }
            FileChange::Delete => {
                let Some(original) = tree.get(&path) else {
                    return Err(PatchRejected::MissingFile { path });
                };
                let remaining = apply_hunks(&path, original, &file.hunks)?;
                if !remaining.is_empty() {
                    return Err(PatchRejected::ContextMismatch {
                        path,
                        hunk: file.hunks.len(),
                        line: 0,
                    });
                }
                tree.remove(&path);
            }
            FileChange::Modify => {
                let Some(original) = tree.get(&path) else {
                    return Err(PatchRejected::MissingFile { path });
                };
                let content = apply_hunks(&path, original, &file.hunks)?;
                tree.insert(path.clone(), content);
            }
        }

        if touched.insert(path.clone()) {
            summary.files.push(path);
        }
    }

    for path in &touched {
        if tree.contains_key(path) {
            check_file_dir_collision(path, &tree, policy.harness)?;
        }
    }

    Ok(AppliedPatch {
        tree,
        touched,
        summary,
    })
}

fn check_policy(path: &str, policy: &PathPolicy<'_>) -> Result<(), PatchRejected> {
    validate_relative_path(path).map_err(|reason| PatchRejected::PolicyViolation {
        path: path.to_string(),
        reason,
    })?;

    if let Some(harness) = policy.harness {
        if harness.contains_key(path) {
            return Err(PatchRejected::PolicyViolation {
                path: path.to_string(),
                reason: "collides with a harness file".to_string(),
            });
        }
    }

    if let Some(permitted) = policy.permitted {
        if !permitted.contains(path) {
            return Err(PatchRejected::PolicyViolation {
                path: path.to_string(),
                reason: "not in the permitted files list".to_string(),
            });
        }
    }

    Ok(())
}

/// Rejects a post-image file that would have to be a directory too, or that
/// sits under another file.
fn check_file_dir_collision(
    path: &str,
    tree: &FileTree,
    harness: Option<&FileTree>,
) -> Result<(), PatchRejected> {
    let dir_prefix = format!("{path}/");
    for files in std::iter::once(tree).chain(harness) {
        let shadows_dir = files
            .range(dir_prefix.clone()..)
            .next()
            .is_some_and(|(other, _)| other.starts_with(&dir_prefix));
        if shadows_dir {
            return Err(PatchRejected::PolicyViolation {
                path: path.to_string(),
                reason: "a directory with this name already holds files".to_string(),
            });
        }
        if let Some(parent) = path
            .match_indices('/')
            .map(|(i, _)| &path[..i])
            .find(|parent| files.contains_key(*parent))
        {
            return Err(PatchRejected::PolicyViolation {
                path: path.to_string(),
                reason: format!("'{parent}' is a file, not a directory"),
            });
        }
    }
    Ok(())
}

/// A file split into lines plus its trailing-newline state.
struct Lines<'a> {
    lines: Vec<&'a [u8]>,
    trailing_newline: bool,
}

fn split_lines(bytes: &[u8]) -> Lines<'_> {
    if bytes.is_empty() {
        return Lines {
            lines: Vec::new(),
            trailing_newline: true,
        };
    }
    let mut lines: Vec<&[u8]> = bytes.split(|b| *b == b'\n').collect();
    let trailing_newline = bytes.ends_with(b"\n");
    if trailing_newline {
        lines.pop();
    }
    Lines {
        lines,
        trailing_newline,
    }
}

fn join_lines(lines: &[&[u8]], trailing_newline: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            out.push(b'\n');
        }
        out.extend_from_slice(line);
    }
    if trailing_newline && !lines.is_empty() {
        out.push(b'\n');
    }
    out
}

/// Applies hunks to one file's bytes.
pub fn apply_hunks(
    path: &str,
    original: &[u8],
    hunks: &[Hunk],
) -> Result<Vec<u8>, PatchRejected> {
    let base = split_lines(original);
    let mut out: Vec<&[u8]> = Vec::with_capacity(base.lines.len());
    let mut trailing_newline = base.trailing_newline;
    let mut cursor = 0usize;
    let mut offset: isize = 0;

    for (idx, hunk) in hunks.iter().enumerate() {
        let old = hunk.old_lines();
        let new = hunk.new_lines();
        let stated = hunk.old_index();
        let mismatch = || PatchRejected::ContextMismatch {
            path: path.to_string(),
            hunk: idx + 1,
            line: hunk.old_start,
        };
        if stated > base.lines.len() {
            return Err(mismatch());
        }
        let expected = (stated as isize + offset).max(0) as usize;

        let pos = locate(&base, cursor, &old, expected, hunk).ok_or_else(mismatch)?;

        out.extend_from_slice(&base.lines[cursor..pos]);
        out.extend(new.iter().copied());
        cursor = pos + old.len();
        offset = pos as isize - stated as isize;

        if cursor == base.lines.len() {
            trailing_newline = !hunk.new_missing_newline;
        }
    }

    out.extend_from_slice(&base.lines[cursor..]);
    Ok(join_lines(&out, trailing_newline))
}

/// Finds where `old` matches, searching outward from `expected` but never
/// before `cursor`.
fn locate(
    base: &Lines<'_>,
    cursor: usize,
    old: &[&[u8]],
    expected: usize,
    hunk: &Hunk,
) -> Option<usize> {
    let len = base.lines.len();
    if old.len() > len.saturating_sub(cursor) {
        return None;
    }
    let last_start = len - old.len();

    let matches_at = |pos: usize| -> bool {
        if pos < cursor || pos > last_start {
            return false;
        }
        if base.lines[pos..pos + old.len()] != *old {
            return false;
        }
        let reaches_eof = pos + old.len() == len;
        if hunk.old_missing_newline {
            // The old side ends without a newline: must be the real end of file.
            return reaches_eof && !base.trailing_newline && !old.is_empty();
        }
        if reaches_eof && !base.trailing_newline && len > 0 {
            // The base's last line lacks a newline but the hunk says it has one.
            return false;
        }
        true
    };

    // A pure insertion has nothing to match against, so it only goes where it says.
    if old.is_empty() {
        return matches_at(expected).then_some(expected);
    }

    for distance in 0..=MAX_DRIFT {
        if let Some(before) = expected.checked_sub(distance) {
            if distance > 0 && matches_at(before) {
                return Some(before);
            }
        }
        let after = expected + distance;
        if matches_at(after) {
            return Some(after);
        }
        if after > last_start && expected.saturating_sub(distance) <= cursor {
            break;
        }
    }
    None
}
