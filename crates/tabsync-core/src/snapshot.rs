use chrono::Utc;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::model::GlobalState;

pub const BACKUP_DIR: &str = "backups";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot parse failed: {0}")]
    Parse(String),
    #[error("snapshot encode failed: {0}")]
    Encode(String),
}

/// The persisted document: one JSON file, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(|dir| dir.join(BACKUP_DIR))
            .unwrap_or_else(|| PathBuf::from(BACKUP_DIR))
    }

    /// `Ok(None)` when nothing has been saved yet.
    pub fn load(&self) -> Result<Option<GlobalState>, SnapshotError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let state =
            serde_json::from_str(&raw).map_err(|err| SnapshotError::Parse(err.to_string()))?;
        Ok(Some(state))
    }

    /// Load, falling back to the initial document. An unreadable file is
    /// moved aside into the backup dir first so it is never overwritten.
    pub fn load_or_initial(&self) -> GlobalState {
        match self.load() {
            Ok(Some(state)) => {
                info!(event = "snapshot_loaded", path = %self.path.display());
                state
            }
            Ok(None) => GlobalState::initial(),
            Err(err) => {
                warn!(event = "snapshot_unreadable", path = %self.path.display(), error = %err);
                match self.backup() {
                    Ok(Some(backup)) => {
                        warn!(event = "snapshot_quarantined", backup = %backup.display())
                    }
                    Ok(None) => {}
                    Err(err) => warn!(event = "snapshot_backup_failed", error = %err),
                }
                GlobalState::initial()
            }
        }
    }

    pub fn save(&self, state: &GlobalState) -> Result<(), SnapshotError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let encoded =
            serde_json::to_vec_pretty(state).map_err(|err| SnapshotError::Encode(err.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Copy the current file to `backups/state-backup-<timestamp>.json`.
    pub fn backup(&self) -> Result<Option<PathBuf>, SnapshotError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let dir = self.backup_dir();
        fs::create_dir_all(&dir)?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let target = dir.join(format!("state-backup-{stamp}.json"));
        fs::copy(&self.path, &target)?;
        Ok(Some(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TabId;

    #[test]
    fn save_then_load_returns_the_document() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = SnapshotFile::new(dir.path().join("nested").join("state.json"));
        assert!(file.load().expect("load").is_none());

        let mut state = GlobalState::initial();
        state.settings.language = "de".to_string();
        file.save(&state).expect("save");
        assert_eq!(file.load().expect("load"), Some(state));
        assert!(!file.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_backed_up_and_replaced_by_initial() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        fs::write(&path, "{\"settings\": oops").expect("write");
        let file = SnapshotFile::new(&path);

        let state = file.load_or_initial();
        assert_eq!(state.project_active_tab_id, Some(TabId::new("defaultTab")));
        let backups: Vec<_> = fs::read_dir(dir.path().join(BACKUP_DIR))
            .expect("backup dir")
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn backup_without_a_file_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = SnapshotFile::new(dir.path().join("state.json"));
        assert!(file.backup().expect("backup").is_none());
    }
}
