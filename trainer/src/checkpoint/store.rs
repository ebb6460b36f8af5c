//! On-disk checkpoint store: one CBOR file per epoch, append-only.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::errors::{Result, TrainerError};

use super::types::{Checkpoint, CheckpointConfig, CorruptCheckpointPolicy};

/// Versioned checkpoint files in a single directory
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    config: CheckpointConfig,
}

impl CheckpointStore {
    /// Create a store; the directory is created on first save.
    pub fn new(config: CheckpointConfig) -> Self {
        Self { config }
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.config.checkpoint_dir
    }

    pub fn corrupt_policy(&self) -> CorruptCheckpointPolicy {
        self.config.corrupt_policy
    }

    pub fn path_for(&self, epoch: u64) -> PathBuf {
        self.config.checkpoint_dir.join(Checkpoint::file_name(epoch))
    }

    /// Write a checkpoint as a new file.
    ///
    /// Fails if the epoch already has a file; existing epochs are never
    /// overwritten. The write is atomic (temp file + rename).
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        let dir = &self.config.checkpoint_dir;
        std::fs::create_dir_all(dir).map_err(|e| {
            tracing::error!(path = %dir.display(), error = %e, "Failed to create checkpoint directory");
            e
        })?;

        let path = self.path_for(checkpoint.epoch);
        if path.exists() {
            return Err(TrainerError::Checkpoint(format!(
                "Checkpoint for epoch {} already exists at {}",
                checkpoint.epoch,
                path.display()
            )));
        }

        let data = checkpoint.to_cbor()?;

        let temp_path = dir.join(format!(".{}.tmp", Checkpoint::file_name(checkpoint.epoch)));
        std::fs::write(&temp_path, &data).map_err(|e| {
            tracing::error!(
                path = %temp_path.display(),
                error = %e,
                "Failed to write temp checkpoint file"
            );
            e
        })?;

        if let Err(e) = std::fs::rename(&temp_path, &path) {
            tracing::error!(
                from = %temp_path.display(),
                to = %path.display(),
                error = %e,
                "Failed to rename temp checkpoint file"
            );
            let _ = std::fs::remove_file(&temp_path);
            return Err(e.into());
        }

        info!(
            epoch = checkpoint.epoch,
            world_size = checkpoint.world_size,
            size_bytes = data.len(),
            path = %path.display(),
            "Checkpoint saved"
        );

        Ok(path)
    }

    /// Stored epochs in ascending numeric order. A missing directory has none.
    pub fn list_epochs(&self) -> Result<Vec<u64>> {
        let dir = &self.config.checkpoint_dir;
        if !dir.exists() {
            debug!(path = %dir.display(), "No checkpoint directory found");
            return Ok(Vec::new());
        }

        let mut epochs = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(epoch) = entry.file_name().to_str().and_then(Checkpoint::parse_file_name) {
                epochs.push(epoch);
            }
        }

        epochs.sort_unstable();
        Ok(epochs)
    }

    /// Decode the checkpoint stored for `epoch`.
    pub fn load_epoch(&self, epoch: u64) -> Result<Checkpoint> {
        let path = self.path_for(epoch);
        let data = std::fs::read(&path)?;

        let checkpoint = Checkpoint::from_cbor(&data).map_err(|e| {
            TrainerError::Checkpoint(format!("Corrupt checkpoint {}: {}", path.display(), e))
        })?;

        if checkpoint.epoch != epoch {
            return Err(TrainerError::Checkpoint(format!(
                "Checkpoint {} records epoch {}",
                path.display(),
                checkpoint.epoch
            )));
        }

        Ok(checkpoint)
    }

    /// Load the highest-epoch checkpoint.
    ///
    /// `Ok(None)` when there is none. An unreadable newest file is handled
    /// according to the store's [`CorruptCheckpointPolicy`].
    pub fn load_latest(&self) -> Result<Option<Checkpoint>> {
        let Some(&epoch) = self.list_epochs()?.last() else {
            debug!(path = %self.config.checkpoint_dir.display(), "No checkpoints found");
            return Ok(None);
        };

        match self.load_epoch(epoch) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => match self.config.corrupt_policy {
                CorruptCheckpointPolicy::TreatAsAbsent => {
                    warn!(
                        epoch,
                        path = %self.path_for(epoch).display(),
                        error = %e,
                        "Failed to load checkpoint, starting fresh"
                    );
                    Ok(None)
                }
                CorruptCheckpointPolicy::Fail => Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::types::OptimizerState;
    use crate::collective::{ParamMap, Tensor};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn checkpoint(epoch: u64) -> Checkpoint {
        let mut params = ParamMap::new();
        params.insert("w".into(), Tensor::from_vec(vec![epoch as f32; 3]));
        let mut metrics = BTreeMap::new();
        metrics.insert("loss".into(), 0.5);
        Checkpoint::new(epoch, params, OptimizerState::new(), metrics, 1)
    }

    fn store(dir: &TempDir) -> CheckpointStore {
        CheckpointStore::new(CheckpointConfig::in_dir(dir.path().join("ckpts")))
    }

    #[test]
    fn test_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(store.list_epochs().unwrap().is_empty());
        assert!(store.load_latest().unwrap().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let original = checkpoint(3);
        let path = store.save(&original).unwrap();
        assert!(path.ends_with("checkpoint_epoch_3.ckpt"));

        let loaded = store.load_latest().unwrap().unwrap();
        assert_eq!(loaded, original);
        assert_eq!(loaded.metrics["loss"], 0.5);
    }

    #[test]
    fn test_numeric_ordering() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        for epoch in [2, 10, 9, 1] {
            store.save(&checkpoint(epoch)).unwrap();
        }

        assert_eq!(store.list_epochs().unwrap(), vec![1, 2, 9, 10]);
        assert_eq!(store.load_latest().unwrap().unwrap().epoch, 10);
    }

    #[test]
    fn test_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.save(&checkpoint(1)).unwrap();
        let before = std::fs::read(store.path_for(1)).unwrap();

        assert!(matches!(
            store.save(&checkpoint(1)),
            Err(TrainerError::Checkpoint(_))
        ));
        assert_eq!(std::fs::read(store.path_for(1)).unwrap(), before);
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save(&checkpoint(4)).unwrap();

        let names: Vec<String> = std::fs::read_dir(store.checkpoint_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["checkpoint_epoch_4.ckpt".to_string()]);
    }

    #[test]
    fn test_stray_files_ignored() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save(&checkpoint(2)).unwrap();

        std::fs::write(store.checkpoint_dir().join(".checkpoint_epoch_7.ckpt.tmp"), b"partial").unwrap();
        std::fs::write(store.checkpoint_dir().join("README"), b"notes").unwrap();

        assert_eq!(store.list_epochs().unwrap(), vec![2]);
    }

    #[test]
    fn test_corrupt_latest_treated_as_absent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save(&checkpoint(1)).unwrap();
        std::fs::write(store.path_for(2), b"\xff\xfe not cbor").unwrap();

        assert!(store.load_latest().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_latest_fails_under_strict_policy() {
        let dir = TempDir::new().unwrap();
        let mut config = CheckpointConfig::in_dir(dir.path());
        config.corrupt_policy = CorruptCheckpointPolicy::Fail;
        let store = CheckpointStore::new(config);

        std::fs::write(store.path_for(5), b"garbage").unwrap();
        assert!(matches!(store.load_latest(), Err(TrainerError::Checkpoint(_))));
    }

    #[test]
    fn test_epoch_mismatch_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save(&checkpoint(1)).unwrap();
        std::fs::rename(store.path_for(1), store.path_for(8)).unwrap();

        assert!(store.load_epoch(8).is_err());
    }
}
