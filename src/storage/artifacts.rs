//! Run artifact storage.
//!
//! Layout under the output root:
//!
//! ```text
//! <output>/<run-id>/records/<record-id>.json   one immutable file per job
//! <output>/<run-id>/blobs/<ab>/<sha256>         full stdout/stderr and diffs
//! <output>/<run-id>/manifest.json
//! <output>/<run-id>/metrics.prom
//! ```
//!
//! Records are written create-new: the JSON goes to a temporary file first
//! and is then hard-linked into place, which fails if the id already exists.
//! Concurrent writers therefore need no lock.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use super::manifest::RunManifest;
use super::record::RunRecord;
use crate::error::StorageError;

/// Append-only store for one run.
#[derive(Debug, Clone)]
pub struct RunArtifactStore {
    run_id: String,
    run_dir: PathBuf,
}

impl RunArtifactStore {
    /// Creates `<output>/<run_id>` and its subdirectories.
    pub async fn create(
        output: impl AsRef<Path>,
        run_id: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let run_id = run_id.into();
        validate_id(&run_id)?;
        let run_dir = output.as_ref().join(&run_id);
        fs::create_dir_all(run_dir.join("records")).await?;
        fs::create_dir_all(run_dir.join("blobs")).await?;
        debug!(run_id = %run_id, path = %run_dir.display(), "Created run directory");
        Ok(Self { run_id, run_dir })
    }

    /// Opens an existing run directory.
    pub fn open(output: impl AsRef<Path>, run_id: &str) -> Result<Self, StorageError> {
        validate_id(run_id)?;
        let run_dir = output.as_ref().join(run_id);
        if !run_dir.join("records").is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no run directory at {}", run_dir.display()),
            )));
        }
        Ok(Self {
            run_id: run_id.to_string(),
            run_dir,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn records_dir(&self) -> PathBuf {
        self.run_dir.join("records")
    }

    pub fn record_path(&self, record_id: &str) -> PathBuf {
        self.records_dir().join(format!("{record_id}.json"))
    }

    /// Stores `data` under its SHA-256 digest and returns the digest.
    ///
    /// Identical content is stored once.
    pub async fn store_blob(&self, data: &[u8]) -> Result<String, StorageError> {
        let checksum = Self::compute_checksum(data);
        let path = self.blob_path(&checksum);
        if fs::try_exists(&path).await? {
            return Ok(checksum);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = self.temp_path(path.parent().unwrap_or(&self.run_dir));
        write_synced(&tmp, data).await?;
        // Rename over an identical blob from a concurrent writer is harmless.
        fs::rename(&tmp, &path).await?;
        Ok(checksum)
    }

    /// Reads a blob back, verifying its digest.
    pub async fn read_blob(&self, checksum: &str) -> Result<Vec<u8>, StorageError> {
        validate_id(checksum)?;
        let data = fs::read(self.blob_path(checksum)).await?;
        let actual = Self::compute_checksum(&data);
        if actual != checksum {
            return Err(StorageError::ChecksumMismatch {
                expected: checksum.to_string(),
                actual,
            });
        }
        Ok(data)
    }

    /// Writes a record; fails if one with the same id exists.
    pub async fn write_record(&self, record: &RunRecord) -> Result<PathBuf, StorageError> {
        validate_id(&record.record_id)?;
        let path = self.record_path(&record.record_id);
        let json = serde_json::to_vec_pretty(record)?;

        let tmp = self.temp_path(&self.records_dir());
        write_synced(&tmp, &json).await?;
        let linked = fs::hard_link(&tmp, &path).await;
        let _ = fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => {
                debug!(record_id = %record.record_id, "Wrote run record");
                Ok(path)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StorageError::RecordExists(record.record_id.clone()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    pub async fn read_record(&self, record_id: &str) -> Result<RunRecord, StorageError> {
        validate_id(record_id)?;
        let raw = fs::read(self.record_path(record_id)).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// All records of the run, sorted by record id.
    pub async fn list_records(&self) -> Result<Vec<RunRecord>, StorageError> {
        let mut entries = fs::read_dir(self.records_dir()).await?;
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read(&path).await?;
            records.push(serde_json::from_slice::<RunRecord>(&raw)?);
        }
        records.sort_by(|a, b| a.record_id.cmp(&b.record_id));
        Ok(records)
    }

    /// Writes `manifest.json`, replacing any earlier version.
    pub async fn write_manifest(&self, manifest: &RunManifest) -> Result<PathBuf, StorageError> {
        let json = serde_json::to_vec_pretty(manifest)?;
        self.replace_file("manifest.json", &json).await
    }

    /// Writes `metrics.prom`.
    pub async fn write_metrics(&self, text: &str) -> Result<PathBuf, StorageError> {
        self.replace_file("metrics.prom", text.as_bytes()).await
    }

    async fn replace_file(&self, name: &str, data: &[u8]) -> Result<PathBuf, StorageError> {
        let path = self.run_dir.join(name);
        let tmp = self.temp_path(&self.run_dir);
        write_synced(&tmp, data).await?;
        fs::rename(&tmp, &path).await?;
        Ok(path)
    }

    fn temp_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!(".tmp-{}", Uuid::new_v4()))
    }

    /// Computes the SHA-256 checksum of data.
    pub fn compute_checksum(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    /// Blob path; the first two hex digits pick a subdirectory.
    fn blob_path(&self, checksum: &str) -> PathBuf {
        let subdir = &checksum[0..2.min(checksum.len())];
        self.run_dir.join("blobs").join(subdir).join(checksum)
    }
}

async fn write_synced(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}

/// Ids become file names; keep them to a safe alphabet.
/// Whether `id` can name a run, a task or a record on disk: ASCII letters,
/// digits, `-`, `_` and `.`, not starting with a dot.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn validate_id(id: &str) -> Result<(), StorageError> {
    if is_valid_id(id) {
        Ok(())
    } else {
        Err(StorageError::InvalidRecordId(id.to_string()))
    }
}
