use std::path::PathBuf;

use uuid::Uuid;

use crate::state::WorkflowRunState;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// CheckpointStore
// ---------------------------------------------------------------------------

/// File-system-backed checkpoint persistence.
///
/// One JSON file per run under a configurable directory. Saves are
/// atomic (write to a temp file, then rename) so a crash mid-save leaves
/// the previous checkpoint intact.
pub struct CheckpointStore {
    base_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    fn ensure_dir(&self) -> Result<(), CheckpointError> {
        std::fs::create_dir_all(&self.base_dir)?;
        Ok(())
    }

    fn checkpoint_path(&self, run_id: &Uuid) -> PathBuf {
        self.base_dir.join(format!("{}.json", run_id))
    }

    /// Persist a run-state snapshot.
    pub fn save(&self, state: &WorkflowRunState) -> Result<(), CheckpointError> {
        self.ensure_dir()?;
        let path = self.checkpoint_path(&state.run_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(state)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Load the latest snapshot for a run. `None` if no checkpoint exists.
    pub fn load(&self, run_id: &Uuid) -> Result<Option<WorkflowRunState>, CheckpointError> {
        let path = self.checkpoint_path(run_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(path)?;
        let state: WorkflowRunState = serde_json::from_str(&data)?;
        Ok(Some(state))
    }

    /// Remove a run's checkpoint. Returns `true` if a file was removed.
    pub fn delete(&self, run_id: &Uuid) -> Result<bool, CheckpointError> {
        let path = self.checkpoint_path(run_id);
        if path.exists() {
            std::fs::remove_file(path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::WorkflowPhase;

    fn temp_store() -> (CheckpointStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = CheckpointStore::new(dir.path().to_path_buf());
        (store, dir)
    }

    #[test]
    fn save_and_load_roundtrip() {
        let (store, _dir) = temp_store();
        let mut state = WorkflowRunState::new(Uuid::new_v4(), PathBuf::from("/tmp/wd"));
        state.advance(WorkflowPhase::Cloning).unwrap();
        state.feature_branch = Some("feat/20260823-thing-abcd1234".into());

        store.save(&state).unwrap();
        let loaded = store.load(&state.run_id).unwrap().unwrap();

        assert_eq!(loaded.run_id, state.run_id);
        assert_eq!(loaded.phase, WorkflowPhase::Cloning);
        assert_eq!(loaded.feature_branch, state.feature_branch);
    }

    #[test]
    fn load_missing_returns_none() {
        let (store, _dir) = temp_store();
        assert!(store.load(&Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn save_overwrites_previous_snapshot() {
        let (store, _dir) = temp_store();
        let mut state = WorkflowRunState::new(Uuid::new_v4(), PathBuf::from("/tmp/wd"));
        store.save(&state).unwrap();

        state.advance(WorkflowPhase::Cloning).unwrap();
        state.advance(WorkflowPhase::BranchCreating).unwrap();
        store.save(&state).unwrap();

        let loaded = store.load(&state.run_id).unwrap().unwrap();
        assert_eq!(loaded.phase, WorkflowPhase::BranchCreating);
    }

    #[test]
    fn delete_checkpoint() {
        let (store, _dir) = temp_store();
        let state = WorkflowRunState::new(Uuid::new_v4(), PathBuf::from("/tmp/wd"));
        store.save(&state).unwrap();

        assert!(store.delete(&state.run_id).unwrap());
        assert!(!store.delete(&state.run_id).unwrap());
        assert!(store.load(&state.run_id).unwrap().is_none());
    }

    #[test]
    fn no_tmp_file_left_behind() {
        let (store, dir) = temp_store();
        let state = WorkflowRunState::new(Uuid::new_v4(), PathBuf::from("/tmp/wd"));
        store.save(&state).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
