use std::collections::BTreeMap;

use crate::Result;

/// An experiment log that runs, their hyperparameters and per-epoch metrics are
/// reported to.
#[allow(unused)]
#[trait_variant::make(RunTracker: Send)]
pub trait LocalRunTracker {
    /// Starts a new run, or continues `run_id` if given.
    ///
    /// # Returns
    /// The identifier of the active run.
    async fn start_run(&mut self, run_id: Option<String>) -> Result<String>;

    async fn log_params(&mut self, params: &BTreeMap<String, String>) -> Result<()>;

    /// Reports `metrics` at `step` without waiting for the log to acknowledge them.
    ///
    /// # Returns
    /// An error if there is no active run. Failures of the report itself surface
    /// from `finish`.
    fn log_metrics(&mut self, metrics: &BTreeMap<String, f32>, step: usize) -> Result<()>;

    /// The latest value of every metric of a run.
    async fn get_run_metrics(&mut self, run_id: &str) -> Result<BTreeMap<String, f32>>;

    /// Waits for in-flight reports and closes the active run.
    ///
    /// # Returns
    /// The first error of a failed report, if any.
    async fn finish(&mut self) -> Result<()>;
}
