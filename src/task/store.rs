//! Task store: loads task definitions from a task root directory.
//!
//! Layout, one directory per task:
//!
//! ```text
//! <root>/<task-id>/task.yaml
//! <root>/<task-id>/prompt.md
//! <root>/<task-id>/source/          starting tree
//! <root>/<task-id>/harness/         overlaid after the patch (optional)
//! <root>/<task-id>/reference.patch  (optional)
//! ```
//!
//! Loading is a pure read with no caching; every call sees the files as
//! they are on disk.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use super::selector::TaskSelector;
use super::types::{FileTree, Task, TaskManifest};
use crate::error::TaskError;
use crate::patch::validate_relative_path;
use crate::storage::is_valid_id;

const MANIFEST_FILE: &str = "task.yaml";
const PROMPT_FILE: &str = "prompt.md";
const SOURCE_DIR: &str = "source";
const HARNESS_DIR: &str = "harness";
const DEFAULT_REFERENCE_PATCH: &str = "reference.patch";

/// Read-only access to a directory of task definitions.
#[derive(Debug, Clone)]
pub struct TaskStore {
    root: PathBuf,
}

impl TaskStore {
    /// Opens a task root.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::RootMissing` if `root` is not a directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, TaskError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(TaskError::RootMissing(root));
        }
        Ok(Self { root })
    }

    /// Returns the task root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lists the ids of every directory that holds a `task.yaml`, sorted.
    pub fn list_task_ids(&self) -> Result<Vec<String>, TaskError> {
        let entries = std::fs::read_dir(&self.root).map_err(|source| TaskError::Io {
            task_id: String::new(),
            source,
        })?;

        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() || !path.join(MANIFEST_FILE).is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Reads and parses only the manifest of a task.
    pub fn load_manifest(&self, task_id: &str) -> Result<TaskManifest, TaskError> {
        let dir = self.task_dir(task_id)?;
        let raw = std::fs::read_to_string(dir.join(MANIFEST_FILE)).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                TaskError::NotFound(task_id.to_string())
            } else {
                TaskError::Io {
                    task_id: task_id.to_string(),
                    source,
                }
            }
        })?;
        let manifest: TaskManifest = serde_yaml::from_str(&raw)
            .map_err(|e| TaskError::malformed(task_id, format!("{MANIFEST_FILE}: {e}")))?;

        if manifest.id != task_id {
            return Err(TaskError::malformed(
                task_id,
                format!("id '{}' does not match directory name", manifest.id),
            ));
        }
        if !is_valid_id(&manifest.id) {
            return Err(TaskError::malformed(
                task_id,
                format!("id '{}' is not usable as a record name", manifest.id),
            ));
        }
        if !(1..=5).contains(&manifest.tier) {
            return Err(TaskError::malformed(
                task_id,
                format!("tier {} is outside 1-5", manifest.tier),
            ));
        }
        if let Some(threshold) = manifest.scoring.threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(TaskError::malformed(
                    task_id,
                    format!("scoring.threshold {threshold} is outside [0, 1]"),
                ));
            }
        }
        manifest
            .harness
            .validate()
            .map_err(|reason| TaskError::malformed(task_id, reason))?;

        Ok(manifest)
    }

    /// Loads a complete task definition.
    ///
    /// # Errors
    ///
    /// - `TaskError::NotFound` if there is no such task directory
    /// - `TaskError::Malformed` if metadata is invalid or a referenced file is missing
    pub fn load_task(&self, task_id: &str) -> Result<Task, TaskError> {
        let manifest = self.load_manifest(task_id)?;
        let dir = self.task_dir(task_id)?;

        let prompt = std::fs::read_to_string(dir.join(PROMPT_FILE))
            .map_err(|e| TaskError::malformed(task_id, format!("{PROMPT_FILE}: {e}")))?;

        let source_dir = dir.join(SOURCE_DIR);
        if !source_dir.is_dir() {
            return Err(TaskError::malformed(
                task_id,
                format!("missing {SOURCE_DIR}/ directory"),
            ));
        }
        let mut executables = BTreeSet::new();
        let starting_tree = read_tree(task_id, &source_dir, &mut executables)?;

        let harness_dir = dir.join(HARNESS_DIR);
        let harness_files = if harness_dir.is_dir() {
            read_tree(task_id, &harness_dir, &mut executables)?
        } else {
            FileTree::new()
        };

        let reference_patch = match &manifest.reference_patch {
            Some(rel) => {
                validate_relative_path(rel)
                    .map_err(|reason| TaskError::malformed(task_id, reason))?;
                let text = std::fs::read_to_string(dir.join(rel)).map_err(|e| {
                    TaskError::malformed(task_id, format!("reference patch '{rel}': {e}"))
                })?;
                Some(text)
            }
            None => {
                let default = dir.join(DEFAULT_REFERENCE_PATCH);
                if default.is_file() {
                    let text = std::fs::read_to_string(&default).map_err(|e| {
                        TaskError::malformed(task_id, format!("{DEFAULT_REFERENCE_PATCH}: {e}"))
                    })?;
                    Some(text)
                } else {
                    None
                }
            }
        };

        let permitted_files = match &manifest.permitted_files {
            Some(files) => {
                let mut set = BTreeSet::new();
                for file in files {
                    validate_relative_path(file).map_err(|reason| {
                        TaskError::malformed(task_id, format!("permitted_files: {reason}"))
                    })?;
                    set.insert(file.clone());
                }
                Some(set)
            }
            None => None,
        };

        for check in &manifest.harness.checks {
            validate_relative_path(&check.file).map_err(|reason| {
                TaskError::malformed(task_id, format!("check file: {reason}"))
            })?;
        }

        let digest = digest_dir(task_id, &dir)?;
        debug!(task_id = %task_id, digest = %digest, files = starting_tree.len(), "Loaded task");

        Ok(Task {
            id: manifest.id,
            category: manifest.category,
            engine: manifest.engine,
            tier: manifest.tier,
            prompt,
            starting_tree,
            harness_files,
            executables,
            harness: manifest.harness,
            reference_patch,
            permitted_files,
            scoring: manifest.scoring,
            digest,
            root: dir,
        })
    }

    /// Loads every task the selector matches, sorted by id.
    ///
    /// Selection only reads manifests; a malformed manifest is still an error
    /// so broken tasks are never skipped silently.
    pub fn load_selected(&self, selector: &TaskSelector) -> Result<Vec<Task>, TaskError> {
        let ids = if selector.task_ids.is_empty() {
            self.list_task_ids()?
        } else {
            let mut ids = selector.task_ids.clone();
            ids.sort();
            ids.dedup();
            ids
        };

        let mut tasks = Vec::new();
        for id in ids {
            let manifest = self.load_manifest(&id)?;
            if selector.matches(&manifest) {
                tasks.push(self.load_task(&id)?);
            }
        }
        Ok(tasks)
    }

    fn task_dir(&self, task_id: &str) -> Result<PathBuf, TaskError> {
        if task_id.is_empty()
            || task_id.contains('/')
            || task_id.contains('\\')
            || task_id == "."
            || task_id == ".."
        {
            return Err(TaskError::NotFound(task_id.to_string()));
        }
        let dir = self.root.join(task_id);
        if !dir.is_dir() {
            return Err(TaskError::NotFound(task_id.to_string()));
        }
        Ok(dir)
    }
}

/// Reads every regular file under `dir` into a tree keyed by relative path.
fn read_tree(
    task_id: &str,
    dir: &Path,
    executables: &mut BTreeSet<String>,
) -> Result<FileTree, TaskError> {
    let mut tree = FileTree::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| TaskError::malformed(task_id, format!("walk: {e}")))?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        let rel = relative_key(dir, entry.path())
            .ok_or_else(|| TaskError::malformed(task_id, "non UTF-8 path in task tree"))?;
        if file_type.is_symlink() {
            return Err(TaskError::malformed(
                task_id,
                format!("symlinks are not supported: {rel}"),
            ));
        }
        let bytes = std::fs::read(entry.path()).map_err(|source| TaskError::Io {
            task_id: task_id.to_string(),
            source,
        })?;
        if is_executable(entry.path()) {
            executables.insert(rel.clone());
        }
        tree.insert(rel, bytes);
    }
    Ok(tree)
}

/// SHA-256 over the sorted (path, bytes) pairs of a whole task directory.
fn digest_dir(task_id: &str, dir: &Path) -> Result<String, TaskError> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| TaskError::malformed(task_id, format!("walk: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = relative_key(dir, entry.path())
            .ok_or_else(|| TaskError::malformed(task_id, "non UTF-8 path in task tree"))?;
        let bytes = std::fs::read(entry.path()).map_err(|source| TaskError::Io {
            task_id: task_id.to_string(),
            source,
        })?;
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn relative_key(base: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, contents).expect("write");
    }

    fn scaffold(root: &Path, id: &str, engine: &str, tier: u8) {
        write(
            root,
            &format!("{id}/task.yaml"),
            &format!(
                "id: {id}\ncategory: bounds\nengine: {engine}\ntier: {tier}\nharness:\n  strategy: scripted_test_runner\n  command: sh run.sh\n"
            ),
        );
        write(root, &format!("{id}/prompt.md"), "Fix the bug.\n");
        write(root, &format!("{id}/source/lib.py"), "x = 1\n");
        write(root, &format!("{id}/harness/run.sh"), "echo '1 passed'\n");
    }

    #[test]
    fn test_load_task_reads_all_parts() {
        let dir = TempDir::new().expect("tempdir");
        scaffold(dir.path(), "t-001", "pygame", 2);
        write(dir.path(), "t-001/reference.patch", "--- a/lib.py\n+++ b/lib.py\n");

        let store = TaskStore::open(dir.path()).expect("open");
        let task = store.load_task("t-001").expect("load");

        assert_eq!(task.id, "t-001");
        assert_eq!(task.tier, 2);
        assert_eq!(task.prompt, "Fix the bug.\n");
        assert_eq!(task.starting_tree.get("lib.py").map(Vec::as_slice), Some(&b"x = 1\n"[..]));
        assert!(task.harness_files.contains_key("run.sh"));
        assert!(task.reference_patch.is_some());
        assert_eq!(task.digest.len(), 64);
    }

    #[test]
    fn test_missing_task_is_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let store = TaskStore::open(dir.path()).expect("open");
        assert!(matches!(store.load_task("nope"), Err(TaskError::NotFound(_))));
        assert!(matches!(store.load_task("../etc"), Err(TaskError::NotFound(_))));
    }

    #[test]
    fn test_id_mismatch_is_malformed() {
        let dir = TempDir::new().expect("tempdir");
        scaffold(dir.path(), "t-001", "pygame", 2);
        std::fs::rename(dir.path().join("t-001"), dir.path().join("t-002")).expect("rename");

        let store = TaskStore::open(dir.path()).expect("open");
        assert!(matches!(
            store.load_task("t-002"),
            Err(TaskError::Malformed { .. })
        ));
    }

    #[test]
    fn test_id_unusable_as_record_name_is_malformed() {
        let dir = TempDir::new().expect("tempdir");
        scaffold(dir.path(), "t 001", "pygame", 2);
        scaffold(dir.path(), "t+002", "pygame", 2);
        scaffold(dir.path(), "t-003", "pygame", 2);

        let store = TaskStore::open(dir.path()).expect("open");
        for id in ["t 001", "t+002"] {
            let err = store.load_manifest(id).expect_err("invalid id");
            assert!(matches!(err, TaskError::Malformed { .. }), "{err:?}");
        }
        assert!(store.load_manifest("t-003").is_ok());
        assert!(matches!(
            store.load_selected(&TaskSelector::all()),
            Err(TaskError::Malformed { .. })
        ));
    }

    #[test]
    fn test_missing_reference_file_is_malformed() {
        let dir = TempDir::new().expect("tempdir");
        scaffold(dir.path(), "t-001", "pygame", 2);
        let yaml = dir.path().join("t-001/task.yaml");
        let mut contents = std::fs::read_to_string(&yaml).expect("read");
        contents.push_str("reference_patch: fixes/gone.patch\n");
        std::fs::write(&yaml, contents).expect("write");

        let store = TaskStore::open(dir.path()).expect("open");
        let err = store.load_task("t-001").expect_err("should fail");
        assert!(err.to_string().contains("gone.patch"));
    }

    #[test]
    fn test_digest_changes_with_content() {
        let dir = TempDir::new().expect("tempdir");
        scaffold(dir.path(), "t-001", "pygame", 2);
        let store = TaskStore::open(dir.path()).expect("open");

        let before = store.load_task("t-001").expect("load").digest;
        assert_eq!(before, store.load_task("t-001").expect("load").digest);

        write(dir.path(), "t-001/source/lib.py", "x = 2\n");
        let after = store.load_task("t-001").expect("load").digest;
        assert_ne!(before, after);
    }

    #[test]
    fn test_load_selected_filters_by_engine_and_tier() {
        let dir = TempDir::new().expect("tempdir");
        scaffold(dir.path(), "a", "pygame", 1);
        scaffold(dir.path(), "b", "quake", 3);
        scaffold(dir.path(), "c", "quake", 5);
        let store = TaskStore::open(dir.path()).expect("open");

        assert_eq!(store.list_task_ids().expect("list"), vec!["a", "b", "c"]);

        let selector = TaskSelector {
            engines: vec!["Quake".to_string()],
            tiers: vec![3],
            ..Default::default()
        };
        let tasks = store.load_selected(&selector).expect("select");
        let ids: Vec<_> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
    }
}
