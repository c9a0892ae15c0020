//! Immutable run configuration.
//!
//! `TrainConfig` is built once at process start, layering a JSON file and the
//! command line over the defaults, and is only ever passed around by reference.

use std::{collections::BTreeMap, env, fs, path::{Path, PathBuf}, time::Duration};

use machine_learning::arch::ClassifierSpec;
use serde::{Deserialize, Serialize};

use crate::{Result, TrainErr};

const N_CHANNELS: usize = 3;
const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
const DEFAULT_MASTER_PORT: u16 = 29500;

/// Everything a training run needs to know up front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Selects the checkpoint directory under `models_dir`.
    pub model_name: String,
    pub data_dir: PathBuf,
    pub models_dir: PathBuf,
    /// Total amount of epochs of the logical run, spanning restarts.
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// Safetensors file holding pre-trained `backbone.*` weights.
    pub pretrained_path: Option<PathBuf>,
    pub hidden: Vec<usize>,
    /// Side of the square images are resized to.
    pub image_size: u32,
    pub classes: Vec<String>,
    pub seed: u64,
    /// Wall-clock budget in seconds, checked at epoch boundaries.
    pub train_cutoff: Option<u64>,
    pub checkpointing: bool,
    pub log_remote: bool,
    pub tracking_uri: String,
    pub experiment_id: String,
    /// Assemble batches on a background thread.
    pub prefetch: bool,
    /// Amount of batches the prefetch thread may run ahead.
    pub prefetch_depth: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            model_name: "resnet".to_string(),
            data_dir: PathBuf::from("data"),
            models_dir: PathBuf::from("models"),
            epochs: 5,
            batch_size: 64,
            learning_rate: 1e-3,
            pretrained_path: None,
            hidden: vec![128],
            image_size: 224,
            classes: [
                "butterfly", "cat", "chicken", "cow", "dog", "elephant", "horse", "sheep",
                "spider", "squirrel",
            ]
            .map(String::from)
            .to_vec(),
            seed: 42,
            train_cutoff: None,
            checkpointing: true,
            log_remote: true,
            tracking_uri: "https://dagshub.com/ML-Purdue/cnn-workshop.mlflow".to_string(),
            experiment_id: "0".to_string(),
            prefetch: false,
            prefetch_depth: 4,
        }
    }
}

impl TrainConfig {
    /// Reads a configuration from a JSON file, absent fields take their default.
    ///
    /// # Arguments
    /// * `path` - The JSON file to read.
    ///
    /// # Returns
    /// The parsed configuration or an io/json error.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Rejects configurations no run could make progress with.
    pub fn validate(&self) -> Result<()> {
        if self.model_name.is_empty() {
            return Err(TrainErr::InvalidConfig("model name must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(TrainErr::InvalidConfig("batch size must be positive".into()));
        }
        if self.image_size == 0 {
            return Err(TrainErr::InvalidConfig("image size must be positive".into()));
        }
        if self.classes.is_empty() {
            return Err(TrainErr::InvalidConfig("at least one class is required".into()));
        }
        if self.prefetch && self.prefetch_depth == 0 {
            return Err(TrainErr::InvalidConfig("prefetch depth must be positive".into()));
        }

        Ok(())
    }

    /// The checkpoint directory of this model.
    pub fn model_dir(&self) -> PathBuf {
        self.models_dir.join(&self.model_name)
    }

    pub fn cutoff(&self) -> Option<Duration> {
        self.train_cutoff.map(Duration::from_secs)
    }

    /// Width of a flattened `CHW` image.
    pub fn input_size(&self) -> usize {
        let side = self.image_size as usize;
        N_CHANNELS * side * side
    }

    pub fn classifier_spec(&self) -> ClassifierSpec {
        ClassifierSpec {
            input: self.input_size(),
            hidden: self.hidden.clone(),
            classes: self.classes.len(),
        }
    }

    /// The hyperparameters reported to the experiment log, every field except
    /// directories and paths.
    pub fn hyperparams(&self) -> BTreeMap<String, String> {
        let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(self) else {
            return BTreeMap::new();
        };

        fields
            .into_iter()
            .filter(|(key, _)| !key.ends_with("_dir") && !key.ends_with("_path"))
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect()
    }
}

/// A worker's identity within the process group, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedContext {
    pub rank: usize,
    pub world_size: usize,
    pub master_addr: String,
    pub master_port: u16,
}

impl DistributedContext {
    /// Reads `WORLD_SIZE`, `LOCAL_RANK` (or `RANK`), `MASTER_ADDR` and `MASTER_PORT`.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Builds the context out of a variable lookup, absent `WORLD_SIZE` means a
    /// single worker.
    pub fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(name: &str, raw: String) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| TrainErr::InvalidConfig(format!("{name}={raw:?} is not a valid number")))
        }

        let world_size = match var("WORLD_SIZE") {
            Some(raw) => parse("WORLD_SIZE", raw)?,
            None => 1,
        };
        let rank = match var("LOCAL_RANK").or_else(|| var("RANK")) {
            Some(raw) => parse("LOCAL_RANK", raw)?,
            None => 0,
        };
        let master_port = match var("MASTER_PORT") {
            Some(raw) => parse("MASTER_PORT", raw)?,
            None => DEFAULT_MASTER_PORT,
        };
        let master_addr = var("MASTER_ADDR").unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string());

        if world_size == 0 || rank >= world_size {
            return Err(TrainErr::InvalidConfig(format!(
                "rank {rank} out of range for world size {world_size}"
            )));
        }

        Ok(Self {
            rank,
            world_size,
            master_addr,
            master_port,
        })
    }

    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            master_addr: DEFAULT_MASTER_ADDR.to_string(),
            master_port: DEFAULT_MASTER_PORT,
        }
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }

    pub fn master(&self) -> String {
        format!("{}:{}", self.master_addr, self.master_port)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_mirror_the_workshop_constants() {
        let cfg = TrainConfig::default();
        assert_eq!(cfg.epochs, 5);
        assert_eq!(cfg.batch_size, 64);
        assert_eq!(cfg.learning_rate, 1e-3);
        assert_eq!(cfg.classes.len(), 10);
        assert_eq!(cfg.input_size(), 3 * 224 * 224);
        cfg.validate().unwrap();
    }

    #[test]
    fn json_file_overrides_only_what_it_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        fs::write(&path, r#"{"epochs": 12, "train_cutoff": 30}"#).unwrap();

        let cfg = TrainConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.epochs, 12);
        assert_eq!(cfg.cutoff(), Some(Duration::from_secs(30)));
        assert_eq!(cfg.batch_size, 64);
    }

    #[test]
    fn hyperparams_skip_directories_and_paths() {
        let params = TrainConfig::default().hyperparams();
        assert_eq!(params["epochs"], "5");
        assert_eq!(params["model_name"], "resnet");
        assert!(!params.contains_key("data_dir"));
        assert!(!params.contains_key("models_dir"));
        assert!(!params.contains_key("pretrained_path"));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let cfg = TrainConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_world_size_means_single_worker() {
        let ctx = DistributedContext::from_vars(vars(&[])).unwrap();
        assert_eq!(ctx, DistributedContext::single());
        assert!(!ctx.is_distributed());
    }

    #[test]
    fn local_rank_takes_precedence_over_rank() {
        let ctx = DistributedContext::from_vars(vars(&[
            ("WORLD_SIZE", "4"),
            ("RANK", "3"),
            ("LOCAL_RANK", "2"),
            ("MASTER_PORT", "1234"),
        ]))
        .unwrap();

        assert_eq!(ctx.rank, 2);
        assert_eq!(ctx.world_size, 4);
        assert_eq!(ctx.master(), "127.0.0.1:1234");
        assert!(!ctx.is_primary());
    }

    #[test]
    fn rank_outside_the_world_is_rejected() {
        let res = DistributedContext::from_vars(vars(&[("WORLD_SIZE", "2"), ("LOCAL_RANK", "2")]));
        assert!(res.is_err());
    }
}
