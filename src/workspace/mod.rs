//! Ephemeral working trees.
//!
//! A [`WorkingTree`] is the starting tree with the candidate patch applied and
//! the harness files overlaid, materialized in a fresh temporary directory.
//! It is owned by exactly one job and its directory is removed when it is
//! closed or dropped, whichever comes first.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, warn};

use crate::patch::{apply_patch, parse_patch, PatchRejected, PatchSummary, PathPolicy};
use crate::task::{FileTree, Task};

/// Why a working tree could not be prepared.
#[derive(Debug, Error)]
pub enum PrepareError {
    /// The candidate's patch was rejected; a scored outcome.
    #[error(transparent)]
    Rejected(#[from] PatchRejected),

    /// The filesystem failed; an infrastructure fault.
    #[error("Failed to materialize working tree: {0}")]
    Io(#[from] io::Error),
}

/// A materialized, exclusively owned working tree.
#[derive(Debug)]
pub struct WorkingTree {
    dir: Option<TempDir>,
    path: PathBuf,
    files: FileTree,
    touched: BTreeSet<String>,
    summary: PatchSummary,
}

impl WorkingTree {
    /// Applies `diff` to the task's starting tree and materializes the result.
    ///
    /// # Errors
    ///
    /// - `PrepareError::Rejected` if the diff is malformed, does not apply, or
    ///   touches a path it may not touch
    /// - `PrepareError::Io` if the temporary directory cannot be written
    pub fn prepare(task: &Task, diff: &str) -> Result<Self, PrepareError> {
        let patch = parse_patch(diff)?;
        let policy = PathPolicy {
            permitted: task.permitted_files.as_ref(),
            harness: Some(&task.harness_files),
        };
        let applied = apply_patch(&task.starting_tree, &patch, &policy)?;
        let mut tree = Self::materialize(
            &task.id,
            applied.tree,
            &task.harness_files,
            &task.executables,
        )?;
        tree.touched = applied.touched;
        tree.summary = applied.summary;
        Ok(tree)
    }

    /// Writes `files` then `overlay` into a new temporary directory.
    pub fn materialize(
        label: &str,
        files: FileTree,
        overlay: &FileTree,
        executables: &BTreeSet<String>,
    ) -> io::Result<Self> {
        let prefix = format!("fixbench-{}-", sanitize(label));
        let dir = tempfile::Builder::new().prefix(&prefix).tempdir()?;
        let path = dir.path().to_path_buf();

        for (rel, bytes) in files.iter().chain(overlay.iter()) {
            write_file(&path, rel, bytes, executables.contains(rel))?;
        }

        debug!(
            path = %path.display(),
            files = files.len(),
            overlay = overlay.len(),
            "Materialized working tree"
        );
        Ok(Self {
            dir: Some(dir),
            path,
            files,
            touched: BTreeSet::new(),
            summary: PatchSummary::default(),
        })
    }

    /// Root directory of the tree.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Post-image of the source files, before any build step ran.
    pub fn files(&self) -> &FileTree {
        &self.files
    }

    /// Paths the patch changed, created or deleted.
    pub fn touched(&self) -> &BTreeSet<String> {
        &self.touched
    }

    /// Lines and files the patch changed.
    pub fn summary(&self) -> &PatchSummary {
        &self.summary
    }

    /// Reads a file from disk, as the harness sees it now.
    pub fn read(&self, rel: &str) -> io::Result<Vec<u8>> {
        std::fs::read(self.path.join(rel))
    }

    /// Removes the directory, reporting failures instead of ignoring them.
    pub fn close(mut self) -> io::Result<()> {
        match self.dir.take() {
            Some(dir) => dir.close(),
            None => Ok(()),
        }
    }
}

impl Drop for WorkingTree {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                warn!(path = %self.path.display(), error = %e, "Failed to remove working tree");
            }
        }
    }
}

fn write_file(root: &Path, rel: &str, bytes: &[u8], executable: bool) -> io::Result<()> {
    let target = root.join(rel);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&target, bytes)?;
    #[cfg(unix)]
    {
        if executable {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755))?;
        }
    }
    #[cfg(not(unix))]
    let _ = executable;
    Ok(())
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(40)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{HarnessSpec, ScoringSpec, StrategyKind};
    use std::collections::BTreeMap;

    fn files(entries: &[(&str, &str)]) -> FileTree {
        entries
            .iter()
            .map(|(p, c)| (p.to_string(), c.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_materialize_writes_files_and_overlay() {
        let exec: BTreeSet<String> = ["run.sh".to_string()].into_iter().collect();
        let tree = WorkingTree::materialize(
            "t/1",
            files(&[("src/a.c", "int a;\n")]),
            &files(&[("run.sh", "echo ok\n")]),
            &exec,
        )
        .expect("materialize");

        assert_eq!(tree.read("src/a.c").expect("read"), b"int a;\n");
        assert_eq!(tree.read("run.sh").expect("read"), b"echo ok\n");
        assert!(tree.files().contains_key("src/a.c"));
        assert!(!tree.files().contains_key("run.sh"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(tree.path().join("run.sh"))
                .expect("meta")
                .permissions()
                .mode();
            assert_ne!(mode & 0o111, 0);
        }
    }

    #[test]
    fn test_patch_creating_file_over_directory_is_rejected() {
        let task = Task {
            id: "shadow-001".to_string(),
            category: "c".to_string(),
            engine: "e".to_string(),
            tier: 1,
            prompt: String::new(),
            starting_tree: files(&[("src/a.c", "int a;\n")]),
            harness_files: FileTree::new(),
            executables: BTreeSet::new(),
            harness: HarnessSpec {
                strategy: StrategyKind::ScriptedTestRunner,
                build: None,
                command: Some("true".to_string()),
                timeout_secs: None,
                sanitizer: None,
                pass_marker: None,
                summary_pattern: None,
                samples: 1,
                env: BTreeMap::new(),
                checks: Vec::new(),
            },
            reference_patch: None,
            permitted_files: None,
            scoring: ScoringSpec::default(),
            digest: String::new(),
            root: PathBuf::from("/tmp"),
        };
        let err = WorkingTree::prepare(&task, "--- /dev/null\n+++ b/src\n@@ -0,0 +1 @@\n+oops\n")
            .expect_err("reject");
        assert!(
            matches!(err, PrepareError::Rejected(PatchRejected::PolicyViolation { .. })),
            "{err:?}"
        );
    }

    #[test]
    fn test_drop_removes_directory() {
        let tree = WorkingTree::materialize(
            "drop",
            files(&[("a", "1")]),
            &FileTree::new(),
            &BTreeSet::new(),
        )
        .expect("materialize");
        let path = tree.path().to_path_buf();
        assert!(path.exists());
        drop(tree);
        assert!(!path.exists());
    }

    #[test]
    fn test_close_removes_directory() {
        let tree = WorkingTree::materialize(
            "close",
            files(&[("a", "1")]),
            &FileTree::new(),
            &BTreeSet::new(),
        )
        .expect("materialize");
        let path = tree.path().to_path_buf();
        tree.close().expect("close");
        assert!(!path.exists());
    }
}
