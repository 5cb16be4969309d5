//! Run artifact storage.
//!
//! Every run gets its own directory under the output root. Workers write
//! immutable per-job records and content-addressed output blobs; the
//! orchestrator writes the manifest and metrics once all jobs are done.
//!
//! # Usage
//!
//! ```rust,ignore
//! use fixbench::storage::{RunArtifactStore, RunManifest};
//!
//! let store = RunArtifactStore::create("runs", run_id).await?;
//! let blob = store.store_blob(&stdout).await?;
//! store.write_record(&record).await?;
//!
//! let records = store.list_records().await?;
//! let manifest = RunManifest::from_records(run_id, started, tasks, labels, &records);
//! store.write_manifest(&manifest).await?;
//! ```

pub mod artifacts;
pub mod manifest;
pub mod record;

pub use crate::error::StorageError;
pub use artifacts::{is_valid_id, RunArtifactStore};
pub use manifest::{GroupStats, RunManifest};
pub use record::{RunRecord, TaskRef};
