use std::collections::{BTreeMap, HashMap};

use super::RunTracker;
use crate::{Result, TrainErr};

/// Keeps runs in memory, for when remote logging is off.
#[derive(Debug, Default)]
pub struct OfflineTracker {
    run_id: Option<String>,
    params: BTreeMap<String, String>,
    history: HashMap<String, Vec<(usize, BTreeMap<String, f32>)>>,
}

impl OfflineTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the metrics of a past run.
    pub fn with_run(mut self, run_id: &str, metrics: BTreeMap<String, f32>) -> Self {
        self.history.entry(run_id.to_string()).or_default().push((0, metrics));
        self
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// Every `(step, metrics)` report of a run, in order.
    pub fn history(&self, run_id: &str) -> &[(usize, BTreeMap<String, f32>)] {
        self.history.get(run_id).map(Vec::as_slice).unwrap_or_default()
    }
}

impl RunTracker for OfflineTracker {
    async fn start_run(&mut self, run_id: Option<String>) -> Result<String> {
        let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        self.history.entry(run_id.clone()).or_default();
        self.run_id = Some(run_id.clone());
        Ok(run_id)
    }

    async fn log_params(&mut self, params: &BTreeMap<String, String>) -> Result<()> {
        self.params.extend(params.clone());
        Ok(())
    }

    fn log_metrics(&mut self, metrics: &BTreeMap<String, f32>, step: usize) -> Result<()> {
        let run_id = self
            .run_id
            .clone()
            .ok_or_else(|| TrainErr::InvalidConfig("no active tracking run".into()))?;

        self.history
            .entry(run_id)
            .or_default()
            .push((step, metrics.clone()));
        Ok(())
    }

    async fn get_run_metrics(&mut self, run_id: &str) -> Result<BTreeMap<String, f32>> {
        let mut latest = BTreeMap::new();
        for (_, metrics) in self.history(run_id) {
            latest.extend(metrics.iter().map(|(k, &v)| (k.clone(), v)));
        }
        Ok(latest)
    }

    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offline_tracker_returns_the_latest_metrics() {
        let mut tracker = OfflineTracker::new();
        let run_id = tracker.start_run(None).await.unwrap();

        tracker.log_metrics(&BTreeMap::from([("acc".into(), 0.5)]), 0).unwrap();
        tracker
            .log_metrics(&BTreeMap::from([("acc".into(), 0.7), ("cse".into(), 1.0)]), 1)
            .unwrap();

        let metrics = tracker.get_run_metrics(&run_id).await.unwrap();
        assert_eq!(metrics, BTreeMap::from([("acc".into(), 0.7), ("cse".into(), 1.0)]));
        assert_eq!(tracker.history(&run_id).len(), 2);
    }

    #[tokio::test]
    async fn continuing_a_run_keeps_its_id() {
        let mut tracker = OfflineTracker::new();
        assert_eq!(tracker.start_run(Some("abc".into())).await.unwrap(), "abc");
        assert_eq!(tracker.run_id(), Some("abc"));
    }

    #[test]
    fn metrics_without_a_run_are_rejected() {
        let mut tracker = OfflineTracker::new();
        let result = tracker.log_metrics(&BTreeMap::from([("acc".into(), 0.5)]), 0);

        assert!(matches!(result, Err(TrainErr::InvalidConfig(_))));
    }
}
