//! Persisted record of the last committed state of the working tree.
//!
//! The snapshot is only advanced after a successful checkpoint, so a crash
//! between commit and persist at worst re-detects already committed changes
//! (which then resolve as "nothing to commit").

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotState {
    pub last_checkpoint_at: DateTime<Utc>,
    /// Content hash per committed path (`/`-separated, relative to the root).
    pub path_hashes: BTreeMap<String, String>,
}

impl SnapshotState {
    pub fn new(created_at: DateTime<Utc>, path_hashes: BTreeMap<String, String>) -> Self {
        Self {
            last_checkpoint_at: created_at,
            path_hashes,
        }
    }

    pub fn hash_of(&self, path: &str) -> Option<&str> {
        self.path_hashes.get(path).map(String::as_str)
    }

    /// Record committed content.  `None` means the path was deleted.
    pub fn apply<'a>(
        &mut self,
        committed: impl IntoIterator<Item = (&'a str, Option<&'a str>)>,
        at: DateTime<Utc>,
    ) {
        for (path, hash) in committed {
            match hash {
                Some(hash) => {
                    self.path_hashes.insert(path.to_string(), hash.to_string());
                }
                None => {
                    self.path_hashes.remove(path);
                }
            }
        }
        self.last_checkpoint_at = at;
    }
}

/// Result of loading the snapshot at startup.
#[derive(Debug)]
pub enum SnapshotLoad {
    Loaded(SnapshotState),
    /// No state file yet.
    Missing,
    /// The file exists but could not be decoded; treated as a first run.
    Corrupt(EngineError),
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> SnapshotLoad {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return SnapshotLoad::Missing,
            Err(err) => {
                return SnapshotLoad::Corrupt(EngineError::StateCorrupt {
                    path: self.path.clone(),
                    reason: err.to_string(),
                });
            }
        };

        match serde_json::from_str::<SnapshotState>(&raw) {
            Ok(state) => {
                debug!(paths = state.path_hashes.len(), "snapshot loaded");
                SnapshotLoad::Loaded(state)
            }
            Err(err) => {
                let err = EngineError::StateCorrupt {
                    path: self.path.clone(),
                    reason: err.to_string(),
                };
                warn!(error = %err, "discarding unreadable snapshot; treating as first run");
                SnapshotLoad::Corrupt(err)
            }
        }
    }

    /// Atomically replace the state file: write a sibling `.tmp`, fsync,
    /// then rename over the original.
    pub async fn save(&self, state: &SnapshotState) -> Result<(), EngineError> {
        let persist_err = |message: String| EngineError::StatePersist {
            path: self.path.clone(),
            message,
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| persist_err(err.to_string()))?;
        }

        let tmp_path = {
            let filename = self
                .path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "state.json".to_string());
            self.path.with_file_name(format!("{filename}.tmp"))
        };

        let encoded = serde_json::to_vec_pretty(state).map_err(|err| persist_err(err.to_string()))?;
        let write_result: std::io::Result<()> = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .await?;
            file.write_all(&encoded).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(persist_err(err.to_string()));
        }

        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|err| persist_err(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> SnapshotState {
        let hashes = BTreeMap::from([
            ("src/lib.rs".to_string(), "aa".to_string()),
            ("README.md".to_string(), "bb".to_string()),
        ]);
        SnapshotState::new(Utc::now(), hashes)
    }

    #[tokio::test]
    async fn save_then_load_restores_state() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("runtime/state.json"));
        let state = sample();
        store.save(&state).await.unwrap();

        match store.load() {
            SnapshotLoad::Loaded(loaded) => assert_eq!(loaded, state),
            other => panic!("unexpected load result: {other:?}"),
        }
        assert!(!dir.path().join("runtime/state.json.tmp").exists());
    }

    #[tokio::test]
    async fn missing_file_is_first_run() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("state.json"));
        assert!(matches!(store.load(), SnapshotLoad::Missing));
    }

    #[tokio::test]
    async fn truncated_file_is_reported_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{\"last_checkpoint_at\": \"2024-").unwrap();
        let store = SnapshotStore::new(&path);
        match store.load() {
            SnapshotLoad::Corrupt(EngineError::StateCorrupt { path: reported, .. }) => {
                assert_eq!(reported, path);
            }
            other => panic!("expected corrupt state, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn save_replaces_previous_contents() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("state.json"));
        let mut state = sample();
        store.save(&state).await.unwrap();

        state.apply([("src/lib.rs", Some("cc")), ("README.md", None)], Utc::now());
        store.save(&state).await.unwrap();

        let SnapshotLoad::Loaded(loaded) = store.load() else {
            panic!("state should load");
        };
        assert_eq!(loaded.hash_of("src/lib.rs"), Some("cc"));
        assert_eq!(loaded.hash_of("README.md"), None);
    }

    #[test]
    fn apply_advances_checkpoint_time() {
        let mut state = sample();
        let later = state.last_checkpoint_at + chrono::Duration::minutes(5);
        state.apply([("new.rs", Some("dd"))], later);
        assert_eq!(state.last_checkpoint_at, later);
        assert_eq!(state.hash_of("new.rs"), Some("dd"));
        assert_eq!(state.path_hashes.len(), 3);
    }
}
