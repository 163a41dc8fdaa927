use std::path::PathBuf;

use foreman_core::config::PipelineConfig;
use foreman_core::types::PipelineState;
use tracing::warn;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    /// A snapshot file exists but cannot be parsed. Distinct from a
    /// missing snapshot, which is not an error.
    #[error("corrupt snapshot at {path}: {detail}")]
    Corrupt { path: String, detail: String },
}

// ---------------------------------------------------------------------------
// PipelineStore
// ---------------------------------------------------------------------------

/// File-system-backed pipeline persistence.
///
/// Each pipeline is one JSON file, `{id}.json`, under a configurable
/// directory (defaults to `~/.foreman/pipelines/`). Writes go through a
/// temp file and a rename so a crash can never leave a half-written
/// snapshot behind. Terminal pipelines are moved to an `archive/`
/// subdirectory rather than deleted; they are the audit trail.
pub struct PipelineStore {
    base_dir: PathBuf,
}

impl PipelineStore {
    /// Create a store with the default directory (`~/.foreman/pipelines/`).
    pub fn default_path() -> Self {
        Self {
            base_dir: PipelineConfig::default_state_dir(),
        }
    }

    /// Create a store backed by a custom directory (useful for testing).
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Ensure the base directory exists.
    fn ensure_dir(&self) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.base_dir)?;
        Ok(())
    }

    /// Path for a given pipeline ID.
    fn state_path(&self, id: &Uuid) -> PathBuf {
        self.base_dir.join(format!("{}.json", id))
    }

    fn archive_dir(&self) -> PathBuf {
        self.base_dir.join("archive")
    }

    /// Write a snapshot. The temp-then-rename dance keeps the previous
    /// snapshot intact until the new one is fully on disk.
    pub fn save(&self, state: &PipelineState) -> Result<(), StoreError> {
        self.ensure_dir()?;
        let path = self.state_path(&state.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(state)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Load a pipeline by ID. Returns `None` if no snapshot exists; a
    /// snapshot that exists but will not parse is `Corrupt`, never
    /// silently replaced with a fresh default.
    pub fn load(&self, id: &Uuid) -> Result<Option<PipelineState>, StoreError> {
        let path = self.state_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)?;
        match serde_json::from_str(&data) {
            Ok(state) => Ok(Some(state)),
            Err(e) => Err(StoreError::Corrupt {
                path: path.display().to_string(),
                detail: e.to_string(),
            }),
        }
    }

    /// List all live (non-archived) snapshots, most recently updated
    /// first. Unreadable files are skipped with a warning so one bad
    /// snapshot cannot hide the rest.
    pub fn list(&self) -> Result<Vec<PipelineState>, StoreError> {
        self.ensure_dir()?;
        let mut pipelines = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = match std::fs::read_to_string(&path) {
                Ok(d) => d,
                Err(_) => continue,
            };
            match serde_json::from_str::<PipelineState>(&data) {
                Ok(state) => pipelines.push(state),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable pipeline snapshot");
                }
            }
        }
        pipelines.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(pipelines)
    }

    /// Move a snapshot into `archive/`. Returns `true` if a live
    /// snapshot was moved, `false` if none existed.
    pub fn archive(&self, id: &Uuid) -> Result<bool, StoreError> {
        let path = self.state_path(id);
        if !path.exists() {
            return Ok(false);
        }
        let archive_dir = self.archive_dir();
        std::fs::create_dir_all(&archive_dir)?;
        std::fs::rename(&path, archive_dir.join(format!("{}.json", id)))?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
