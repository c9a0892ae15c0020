use std::collections::HashMap;

use super::Synchronizer;
use crate::{Result, TrainErr};

/// The trivial group of a single worker, its barrier releases immediately.
#[derive(Debug, Default)]
pub struct LocalGroup {
    store: HashMap<String, String>,
}

impl LocalGroup {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Synchronizer for LocalGroup {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    async fn barrier_wait(&mut self) -> Result<()> {
        Ok(())
    }

    async fn publish(&mut self, key: &str, value: String) -> Result<()> {
        self.store.insert(key.to_string(), value);
        Ok(())
    }

    async fn all_reduce_mean(&mut self, _key: &str, _values: &mut [f32]) -> Result<()> {
        Ok(())
    }

    /// Nobody else can publish, so a missing key is an error instead of a wait.
    async fn fetch(&mut self, key: &str) -> Result<String> {
        self.store
            .get(key)
            .cloned()
            .ok_or_else(|| TrainErr::MissingKey(key.to_string()))
    }
}
