//! Candidate patch sources.
//!
//! A source hands out at most one unified diff per task, tagged with where it
//! came from. Three sources are built in and picked with a selector string:
//!
//! - `reference`: the task's own reference patch
//! - `baseline`: the empty patch, i.e. the unpatched starting tree
//! - `dir:<path>[@label]`: `<task-id>.patch` or `<task-id>.diff` files in a
//!   directory, with an optional `provenance.json`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::task::Task;

/// Where a candidate came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Label of the source, e.g. `reference` or a model name.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// File the diff was read from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// A unified diff plus provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePatch {
    pub diff: String,
    pub provenance: Provenance,
}

#[derive(Debug, Error)]
pub enum CandidateError {
    #[error("Unknown candidate selector '{0}' (expected reference, baseline or dir:<path>[@label])")]
    InvalidSelector(String),

    #[error("Candidate directory '{0}' does not exist")]
    DirectoryMissing(PathBuf),

    #[error("Failed to read candidate '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid provenance file '{path}': {reason}")]
    Provenance { path: PathBuf, reason: String },
}

/// Produces candidate patches for tasks.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Label used in records and record ids.
    fn label(&self) -> &str;

    /// The candidate for `task`, or `None` if the source has none.
    async fn candidate_for(&self, task: &Task) -> Result<Option<CandidatePatch>, CandidateError>;
}

/// The task's reference patch.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSource;

#[async_trait]
impl CandidateSource for ReferenceSource {
    fn label(&self) -> &str {
        "reference"
    }

    async fn candidate_for(&self, task: &Task) -> Result<Option<CandidatePatch>, CandidateError> {
        Ok(task.reference_patch.as_ref().map(|diff| CandidatePatch {
            diff: diff.clone(),
            provenance: Provenance {
                source: self.label().to_string(),
                model: None,
                timestamp: Utc::now(),
                path: None,
            },
        }))
    }
}

/// The empty patch.
#[derive(Debug, Clone, Default)]
pub struct BaselineSource;

#[async_trait]
impl CandidateSource for BaselineSource {
    fn label(&self) -> &str {
        "baseline"
    }

    async fn candidate_for(&self, _task: &Task) -> Result<Option<CandidatePatch>, CandidateError> {
        Ok(Some(CandidatePatch {
            diff: String::new(),
            provenance: Provenance {
                source: self.label().to_string(),
                model: None,
                timestamp: Utc::now(),
                path: None,
            },
        }))
    }
}

/// Optional `provenance.json` in a candidate directory.
#[derive(Debug, Clone, Default, Deserialize)]
struct ProvenanceFile {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// One diff file per task in a directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
    label: String,
    model: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

impl DirectorySource {
    /// Opens `root`, reading `provenance.json` if present.
    ///
    /// The label defaults to the provenance model, then the directory name.
    pub fn open(root: impl Into<PathBuf>, label: Option<&str>) -> Result<Self, CandidateError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(CandidateError::DirectoryMissing(root));
        }

        let provenance_path = root.join("provenance.json");
        let provenance = match std::fs::read_to_string(&provenance_path) {
            Ok(raw) => serde_json::from_str::<ProvenanceFile>(&raw).map_err(|e| {
                CandidateError::Provenance {
                    path: provenance_path.clone(),
                    reason: e.to_string(),
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ProvenanceFile::default(),
            Err(source) => {
                return Err(CandidateError::Io {
                    path: provenance_path,
                    source,
                })
            }
        };

        let label = label
            .map(str::to_string)
            .or_else(|| provenance.model.clone())
            .or_else(|| root.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "candidates".to_string());

        Ok(Self {
            root,
            label,
            model: provenance.model,
            timestamp: provenance.timestamp,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn find_diff(&self, task_id: &str) -> Option<PathBuf> {
        ["patch", "diff"]
            .iter()
            .map(|ext| self.root.join(format!("{task_id}.{ext}")))
            .find(|p| p.is_file())
    }
}

#[async_trait]
impl CandidateSource for DirectorySource {
    fn label(&self) -> &str {
        &self.label
    }

    async fn candidate_for(&self, task: &Task) -> Result<Option<CandidatePatch>, CandidateError> {
        let Some(path) = self.find_diff(&task.id) else {
            debug!(task_id = %task.id, source = %self.label, "No candidate file");
            return Ok(None);
        };

        let bytes = tokio::fs::read(&path).await.map_err(|source| CandidateError::Io {
            path: path.clone(),
            source,
        })?;
        let timestamp = match self.timestamp {
            Some(ts) => ts,
            None => tokio::fs::metadata(&path)
                .await
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now()),
        };

        Ok(Some(CandidatePatch {
            diff: String::from_utf8_lossy(&bytes).into_owned(),
            provenance: Provenance {
                source: self.label.clone(),
                model: self.model.clone(),
                timestamp,
                path: Some(path),
            },
        }))
    }
}

/// Builds a source from a selector string.
pub fn parse_selector(selector: &str) -> Result<Arc<dyn CandidateSource>, CandidateError> {
    match selector.trim() {
        "reference" => Ok(Arc::new(ReferenceSource)),
        "baseline" => Ok(Arc::new(BaselineSource)),
        other => {
            let Some(spec) = other.strip_prefix("dir:") else {
                return Err(CandidateError::InvalidSelector(selector.to_string()));
            };
            let (path, label) = match spec.rsplit_once('@') {
                Some((path, label)) if !label.is_empty() && !label.contains('/') => {
                    (path, Some(label))
                }
                _ => (spec, None),
            };
            if path.is_empty() {
                return Err(CandidateError::InvalidSelector(selector.to_string()));
            }
            Ok(Arc::new(DirectorySource::open(path, label)?))
        }
    }
}

/// File-name-safe form of a source label.
pub fn label_slug(label: &str) -> String {
    let slug: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(64)
        .collect();
    if slug.is_empty() {
        "candidate".to_string()
    } else {
        slug
    }
}
