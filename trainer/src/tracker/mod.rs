//! Remote experiment logging.

use std::collections::BTreeMap;

mod mlflow;
mod offline;
mod run_tracker;

pub use mlflow::MlflowTracker;
pub use offline::OfflineTracker;
pub use run_tracker::RunTracker;

use crate::Result;

/// The tracker a worker reports to, picked at startup.
pub enum Tracker {
    Mlflow(MlflowTracker),
    Offline(OfflineTracker),
}

impl RunTracker for Tracker {
    async fn start_run(&mut self, run_id: Option<String>) -> Result<String> {
        match self {
            Tracker::Mlflow(t) => t.start_run(run_id).await,
            Tracker::Offline(t) => t.start_run(run_id).await,
        }
    }

    async fn log_params(&mut self, params: &BTreeMap<String, String>) -> Result<()> {
        match self {
            Tracker::Mlflow(t) => t.log_params(params).await,
            Tracker::Offline(t) => t.log_params(params).await,
        }
    }

    fn log_metrics(&mut self, metrics: &BTreeMap<String, f32>, step: usize) -> Result<()> {
        match self {
            Tracker::Mlflow(t) => t.log_metrics(metrics, step),
            Tracker::Offline(t) => t.log_metrics(metrics, step),
        }
    }

    async fn get_run_metrics(&mut self, run_id: &str) -> Result<BTreeMap<String, f32>> {
        match self {
            Tracker::Mlflow(t) => t.get_run_metrics(run_id).await,
            Tracker::Offline(t) => t.get_run_metrics(run_id).await,
        }
    }

    async fn finish(&mut self) -> Result<()> {
        match self {
            Tracker::Mlflow(t) => t.finish().await,
            Tracker::Offline(t) => t.finish().await,
        }
    }
}
