//! On-disk checkpoints, one directory per model name.
//!
//! ```text
//! <models_dir>/<model_name>/
//!     last.pt                    final/latest model weights
//!     best.pt                    selected model weights
//!     optim.pt                   optimizer state
//!     checkpoint_metadata.json   {"init_epoch": int, "mlflow_run_id": string|null}
//! ```
//!
//! Weight and optimizer files hold a safetensors encoded `StateDict`. Every file is
//! written to a sibling temporary path and renamed over the target, so each one is
//! either the previous or the new version, never a torn write.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use log::debug;
use machine_learning::StateDict;
use serde::{Deserialize, Serialize};

use crate::{Result, TrainErr};

pub const LAST_FILE: &str = "last.pt";
pub const BEST_FILE: &str = "best.pt";
pub const OPTIM_FILE: &str = "optim.pt";
pub const METADATA_FILE: &str = "checkpoint_metadata.json";

/// Where a resumed run picks up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// The first epoch the resumed run executes.
    pub init_epoch: usize,
    /// Correlates the checkpoint with its remote experiment run.
    pub mlflow_run_id: Option<String>,
}

/// Everything persisted about a run.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointState {
    pub last: StateDict,
    pub optimizer: StateDict,
    /// Absent before any run completed.
    pub best: Option<StateDict>,
    pub metadata: CheckpointMetadata,
}

/// Reads and writes the checkpoint directory of one model.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Creates a store over `<models_dir>/<model_name>`, nothing is touched on disk yet.
    pub fn new(models_dir: impl AsRef<Path>, model_name: &str) -> Self {
        Self {
            dir: models_dir.as_ref().join(model_name),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Makes sure the directory exists.
    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn has_metadata(&self) -> bool {
        self.dir.join(METADATA_FILE).is_file()
    }

    /// Persists the per-epoch artifacts: optimizer state, the latest weights and
    /// the metadata that resumes right after them, metadata last.
    pub fn save_epoch(
        &self,
        last: &StateDict,
        optimizer: &StateDict,
        metadata: &CheckpointMetadata,
    ) -> Result<()> {
        self.create()?;
        self.write_state(OPTIM_FILE, optimizer)?;
        self.write_state(LAST_FILE, last)?;
        self.write_metadata(metadata)
    }

    /// Persists the final and selected weights.
    pub fn save_weights(&self, last: &StateDict, best: &StateDict) -> Result<()> {
        self.write_state(LAST_FILE, last)?;
        self.write_state(BEST_FILE, best)
    }

    /// Persists a whole checkpoint, metadata last.
    pub fn save(&self, state: &CheckpointState) -> Result<()> {
        self.create()?;
        self.write_state(LAST_FILE, &state.last)?;
        if let Some(best) = &state.best {
            self.write_state(BEST_FILE, best)?;
        }
        self.write_state(OPTIM_FILE, &state.optimizer)?;
        self.write_metadata(&state.metadata)
    }

    /// Loads the checkpoint to resume from.
    ///
    /// # Returns
    /// The checkpoint, or `MissingCheckpoint` if the latest weights, optimizer state
    /// or metadata are absent. A missing best snapshot is tolerated.
    pub fn load(&self) -> Result<CheckpointState> {
        let metadata = self.read_required(METADATA_FILE)?;
        let metadata: CheckpointMetadata = serde_json::from_slice(&metadata)?;

        let last = StateDict::from_safetensors_bytes(&self.read_required(LAST_FILE)?)?;
        let optimizer = StateDict::from_safetensors_bytes(&self.read_required(OPTIM_FILE)?)?;

        let best = match fs::read(self.dir.join(BEST_FILE)) {
            Ok(raw) => Some(StateDict::from_safetensors_bytes(&raw)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        Ok(CheckpointState {
            last,
            optimizer,
            best,
            metadata,
        })
    }

    fn read_required(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.dir.join(name);

        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TrainErr::MissingCheckpoint(path),
            _ => e.into(),
        })
    }

    fn write_metadata(&self, metadata: &CheckpointMetadata) -> Result<()> {
        self.write_atomic(METADATA_FILE, &serde_json::to_vec(metadata)?)
    }

    fn write_state(&self, name: &str, state: &StateDict) -> Result<()> {
        self.write_atomic(name, &state.to_safetensors_bytes()?)
    }

    fn write_atomic(&self, name: &str, content: &[u8]) -> Result<()> {
        let path = self.dir.join(name);
        let tmp = path.with_extension(format!("{}.tmp", extension(&path)));

        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;

        debug!(bytes = content.len(); "wrote {}", path.display());
        Ok(())
    }
}

fn extension(path: &Path) -> &str {
    path.extension().and_then(|ext| ext.to_str()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use machine_learning::Tensor;

    use super::*;

    fn state(values: &[f32]) -> StateDict {
        let mut state = StateDict::new();
        state.insert("w", Tensor::new(vec![values.len()], values.to_vec()).unwrap());
        state.insert("b", Tensor::scalar(-0.0));
        state
    }

    #[test]
    fn load_reverses_save_bit_for_bit() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "resnet");

        let saved = CheckpointState {
            last: state(&[0.1, f32::MIN_POSITIVE, -3.5e-20]),
            optimizer: state(&[1e-8, 2.0]),
            best: Some(state(&[0.7])),
            metadata: CheckpointMetadata {
                init_epoch: 3,
                mlflow_run_id: Some("abc".into()),
            },
        };

        store.save(&saved).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded.metadata, saved.metadata);
        for (a, b) in [(&loaded.last, &saved.last), (&loaded.optimizer, &saved.optimizer)] {
            for ((name_a, ta), (name_b, tb)) in a.iter().zip(b.iter()) {
                assert_eq!(name_a, name_b);
                let bits_a: Vec<u32> = ta.data().iter().map(|v| v.to_bits()).collect();
                let bits_b: Vec<u32> = tb.data().iter().map(|v| v.to_bits()).collect();
                assert_eq!(bits_a, bits_b);
            }
        }
        assert_eq!(loaded.best, saved.best);
    }

    #[test]
    fn metadata_uses_the_documented_schema() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "m");
        store
            .save(&CheckpointState {
                last: state(&[1.0]),
                optimizer: StateDict::new(),
                best: None,
                metadata: CheckpointMetadata {
                    init_epoch: 5,
                    mlflow_run_id: None,
                },
            })
            .unwrap();

        let raw = fs::read_to_string(store.dir().join(METADATA_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json, serde_json::json!({"init_epoch": 5, "mlflow_run_id": null}));
        assert!(!store.dir().join("checkpoint_metadata.json.tmp").exists());
    }

    #[test]
    fn missing_best_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "m");
        let metadata = CheckpointMetadata {
            init_epoch: 1,
            mlflow_run_id: Some("abc".into()),
        };
        store.save_epoch(&state(&[1.0]), &state(&[2.0]), &metadata).unwrap();

        let loaded = store.load().unwrap();
        assert!(loaded.best.is_none());
        assert_eq!(loaded.metadata, metadata);
    }

    #[test]
    fn each_epoch_save_moves_the_resume_point() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "m");

        for epoch in 0..3 {
            let metadata = CheckpointMetadata {
                init_epoch: epoch + 1,
                mlflow_run_id: None,
            };
            store
                .save_epoch(&state(&[epoch as f32]), &StateDict::new(), &metadata)
                .unwrap();
        }

        let loaded = store.load().unwrap();
        assert_eq!(loaded.metadata.init_epoch, 3);
        assert_eq!(loaded.last, state(&[2.0]));
    }

    #[test]
    fn missing_last_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "m");
        store.create().unwrap();
        fs::write(store.dir().join(METADATA_FILE), r#"{"init_epoch": 1, "mlflow_run_id": null}"#)
            .unwrap();

        match store.load() {
            Err(TrainErr::MissingCheckpoint(path)) => assert!(path.ends_with(LAST_FILE)),
            other => panic!("expected a missing checkpoint, got {other:?}"),
        }
    }

    #[test]
    fn missing_metadata_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "m");
        assert!(matches!(store.load(), Err(TrainErr::MissingCheckpoint(_))));
    }
}
