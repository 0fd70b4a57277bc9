//! Checkpoint persistence.
//!
//! After every stage the full [`RunState`] is written to
//! `progress_{run_id}.json` and to `latest_progress.json`. Writes go through a
//! temporary file in the target directory followed by a rename, so readers
//! never see a half-written document.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::types::RunState;
use crate::error::CheckpointError;

/// File name of the "most recent run" checkpoint.
pub const LATEST_CHECKPOINT: &str = "latest_progress.json";

/// On-disk checkpoint: the run state plus bookkeeping fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointDocument {
    #[serde(flatten)]
    pub state: RunState,
    #[serde(rename = "_last_completed_step")]
    pub last_completed_step: String,
    #[serde(rename = "_saved_at")]
    pub saved_at: DateTime<Utc>,
}

impl CheckpointDocument {
    pub fn new(state: RunState) -> Self {
        Self {
            last_completed_step: state.last_completed_label().to_string(),
            state,
            saved_at: Utc::now(),
        }
    }
}

/// Writes `bytes` to `path` via a temporary sibling file and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| CheckpointError::DirectoryCreationFailed {
        path: dir.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path)
        .map_err(|e| CheckpointError::PersistFailed {
            path: path.display().to_string(),
            reason: e.error.to_string(),
        })?;
    Ok(())
}

/// Directory-backed checkpoint store.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn run_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("progress_{}.json", run_id))
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST_CHECKPOINT)
    }

    /// Writes both checkpoint files for `state`.
    ///
    /// Serialisation happens on the caller's task; the file writes run on the
    /// blocking pool.
    pub async fn save(&self, state: &RunState) -> Result<PathBuf, CheckpointError> {
        let document = CheckpointDocument::new(state.clone());
        let bytes = serde_json::to_vec_pretty(&document)?;
        let run_path = self.run_path(&state.run_id);
        let latest_path = self.latest_path();

        let written = run_path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), CheckpointError> {
            write_atomic(&run_path, &bytes)?;
            write_atomic(&latest_path, &bytes)
        })
        .await
        .map_err(|e| CheckpointError::Join(e.to_string()))??;

        tracing::debug!(
            run_id = %state.run_id,
            last_completed = %document.last_completed_step,
            path = %written.display(),
            "Checkpoint saved"
        );
        Ok(written)
    }

    /// Like [`save`](Self::save) but logs and swallows failures.
    pub async fn save_logged(&self, state: &RunState) -> Option<PathBuf> {
        match self.save(state).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(run_id = %state.run_id, error = %e, "Failed to save checkpoint");
                None
            }
        }
    }

    pub fn load_run(&self, run_id: &str) -> Result<CheckpointDocument, CheckpointError> {
        load(&self.run_path(run_id))
    }

    pub fn load_latest(&self) -> Result<CheckpointDocument, CheckpointError> {
        load(&self.latest_path())
    }
}

/// Reads a checkpoint document from `path`.
pub fn load(path: &Path) -> Result<CheckpointDocument, CheckpointError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CheckpointError::NotFound(path.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_str(&text)?)
}
