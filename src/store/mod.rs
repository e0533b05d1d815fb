//! Durable run persistence.
//!
//! The store is what lets a run survive a process restart: every accepted
//! state transition is followed by a best-effort save, and a new
//! orchestrator constructed for the same content id picks the state back
//! up. One run directory per content id, a JSON manifest for the run and
//! its jobs, and a zero-length marker file for the stop flag so the flag
//! can be checked cheaply between await points.
//!
//! The store is a single-writer resource: two live orchestrators driving
//! the same content id concurrently is unsupported and the resulting state
//! is undefined.

pub mod record;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub use record::{
    generate_run_id, GenerationOutput, JobRecord, JobStatus, RunRecord, RUN_SCHEMA_VERSION,
    STOPPED_REASON,
};

const APP_DIR_NAME: &str = "chapterflow";
const RUNS_DIR_NAME: &str = "runs";
const MANIFEST_FILE_NAME: &str = "run.json";
const STOPPED_MARKER_NAME: &str = "stopped";

/// Errors from durable store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Empty or otherwise unusable content identifier.
    #[error("invalid content id")]
    InvalidContentId,
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// A run loaded back from disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRun {
    /// Run metadata.
    pub run: RunRecord,
    /// Per-item job records, ordered by index.
    pub jobs: Vec<JobRecord>,
}

/// File-backed store for run state.
#[derive(Debug, Clone)]
pub struct JobStore {
    root_dir: PathBuf,
}

impl JobStore {
    /// Create a store rooted at the given base directory.
    pub fn new(base_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let root_dir = base_dir.into().join(APP_DIR_NAME);
        fs::create_dir_all(root_dir.join(RUNS_DIR_NAME))?;
        Ok(Self { root_dir })
    }

    /// Load previously persisted state for a content id.
    ///
    /// Fails soft: a missing, unreadable, or corrupt manifest is treated as
    /// "no prior state" (logged at warn) so a damaged file can never block
    /// starting a fresh run.
    pub fn load(&self, content_id: &str) -> Option<PersistedRun> {
        if content_id.trim().is_empty() {
            return None;
        }
        let manifest_path = self.run_dir(content_id).join(MANIFEST_FILE_NAME);
        let content = match fs::read_to_string(&manifest_path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(content_id, %err, "failed to read run manifest; starting fresh");
                return None;
            }
        };
        match serde_json::from_str::<PersistedRun>(&content) {
            Ok(persisted) => Some(persisted),
            Err(err) => {
                warn!(content_id, %err, "corrupt run manifest; starting fresh");
                None
            }
        }
    }

    /// Overwrite persisted state for a run. Atomic: the manifest is written
    /// to a temp file, synced, and renamed into place.
    pub fn save(&self, run: &RunRecord, jobs: &[JobRecord]) -> StoreResult<()> {
        if run.content_id.trim().is_empty() {
            return Err(StoreError::InvalidContentId);
        }
        let run_dir = self.run_dir(&run.content_id);
        fs::create_dir_all(&run_dir)?;

        let persisted = PersistedRun {
            run: run.clone(),
            jobs: jobs.to_vec(),
        };
        let json = serde_json::to_string_pretty(&persisted)?;
        let temp_path = run_dir.join(format!("{}.tmp", MANIFEST_FILE_NAME));
        let manifest_path = run_dir.join(MANIFEST_FILE_NAME);

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &manifest_path)?;

        Ok(())
    }

    /// Remove all persisted state for a content id. Idempotent.
    pub fn clear(&self, content_id: &str) -> StoreResult<()> {
        if content_id.trim().is_empty() {
            return Err(StoreError::InvalidContentId);
        }
        match fs::remove_dir_all(self.run_dir(content_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    /// Persist the stop flag for a run.
    pub fn mark_stopped(&self, content_id: &str) -> StoreResult<()> {
        if content_id.trim().is_empty() {
            return Err(StoreError::InvalidContentId);
        }
        let run_dir = self.run_dir(content_id);
        fs::create_dir_all(&run_dir)?;
        fs::File::create(run_dir.join(STOPPED_MARKER_NAME))?;
        Ok(())
    }

    /// Remove the persisted stop flag, if present.
    pub fn clear_stopped(&self, content_id: &str) -> StoreResult<()> {
        match fs::remove_file(self.run_dir(content_id).join(STOPPED_MARKER_NAME)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    /// Whether a persisted stop flag exists for the run. Cheap and
    /// synchronous so callers can consult it between await points.
    pub fn is_stopped(&self, content_id: &str) -> bool {
        self.run_dir(content_id).join(STOPPED_MARKER_NAME).exists()
    }

    /// Enumerate content ids with persisted (potentially resumable) runs.
    pub fn list_runs(&self) -> StoreResult<Vec<String>> {
        let runs_dir = self.root_dir.join(RUNS_DIR_NAME);
        let mut ids = Vec::new();
        for entry in fs::read_dir(&runs_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if entry.path().join(MANIFEST_FILE_NAME).exists() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Root directory of the store.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn run_dir(&self, content_id: &str) -> PathBuf {
        self.root_dir.join(RUNS_DIR_NAME).join(content_id)
    }
}
