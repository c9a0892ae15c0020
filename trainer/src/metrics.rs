//! Per-epoch metric accumulation and its cross-rank reduction.

use std::collections::BTreeMap;

use log::debug;
use ndarray::{ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::{Result, sync::Synchronizer};

/// Name of the mean batch cross entropy.
pub const LOSS: &str = "cse";
/// Name of the classification accuracy.
pub const ACC: &str = "acc";

/// Running mean of a scalar.
#[derive(Debug, Default, Clone)]
pub struct MeanMetric {
    sum: f64,
    count: usize,
}

impl MeanMetric {
    #[inline]
    pub fn update(&mut self, value: f32) {
        self.sum += f64::from(value);
        self.count += 1;
    }

    /// The mean so far, `0.0` if nothing was recorded.
    pub fn compute(&self) -> f32 {
        match self.count {
            0 => 0.0,
            n => (self.sum / n as f64) as f32,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Fraction of samples whose highest score is on their target class.
#[derive(Debug, Default, Clone)]
pub struct Accuracy {
    correct: usize,
    total: usize,
}

impl Accuracy {
    /// Counts the hits of a batch.
    ///
    /// # Arguments
    /// * `y_pred` - Class scores, one row per sample.
    /// * `y` - One-hot targets of the same shape.
    pub fn update(&mut self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) {
        let hits = y_pred
            .axis_iter(Axis(0))
            .zip(y.axis_iter(Axis(0)))
            .filter(|(pred, target)| argmax(*pred) == argmax(*target))
            .count();

        self.correct += hits;
        self.total += y_pred.nrows();
    }

    pub fn compute(&self) -> f32 {
        match self.total {
            0 => 0.0,
            n => self.correct as f32 / n as f32,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Index of the first maximum.
fn argmax(row: ArrayView1<f32>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}

/// What each rank publishes at the end of an epoch.
#[derive(Debug, Serialize, Deserialize)]
struct EpochRecord {
    metrics: BTreeMap<String, f32>,
    stop: bool,
}

/// Metrics averaged over every rank, together with the group's stop decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ReducedMetrics {
    pub values: BTreeMap<String, f32>,
    /// Whether any rank asked to end the run after this epoch.
    pub stop: bool,
}

impl ReducedMetrics {
    /// The reduced value of `name`, `0.0` when no rank reported it.
    pub fn get(&self, name: &str) -> f32 {
        self.values.get(name).copied().unwrap_or_default()
    }
}

/// The key under which `rank` publishes its record for `epoch`.
pub fn record_key(epoch: usize, rank: usize) -> String {
    format!("metrics/{epoch}/{rank}")
}

/// The loss and accuracy of one worker over one epoch.
#[derive(Debug, Default, Clone)]
pub struct EpochMetrics {
    loss: MeanMetric,
    acc: Accuracy,
}

impl EpochMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>, loss: f32) {
        self.loss.update(loss);
        self.acc.update(y_pred, y);
    }

    /// Returns this worker's metrics and resets for the next epoch.
    pub fn compute(&mut self) -> BTreeMap<String, f32> {
        let values = BTreeMap::from([
            (LOSS.to_string(), self.loss.compute()),
            (ACC.to_string(), self.acc.compute()),
        ]);

        self.loss.reset();
        self.acc.reset();
        values
    }

    /// Averages this epoch's metrics over every rank of the group and resets.
    ///
    /// Each rank publishes its local record, waits on the barrier once, then
    /// fetches all records, so every rank observes the same reduced values.
    ///
    /// # Arguments
    /// * `sync` - This rank's handle on the group.
    /// * `epoch` - The epoch being reduced, records are scoped by it.
    /// * `stop` - Whether this rank wants the run to end after this epoch.
    ///
    /// # Returns
    /// The reduced metrics, or an error if the exchange failed.
    pub async fn compute_distributed<S: Synchronizer>(
        &mut self,
        sync: &mut S,
        epoch: usize,
        stop: bool,
    ) -> Result<ReducedMetrics> {
        let record = EpochRecord {
            metrics: self.compute(),
            stop,
        };

        let key = record_key(epoch, sync.rank());
        sync.publish(&key, serde_json::to_string(&record)?).await?;
        sync.barrier_wait().await?;

        let world_size = sync.world_size();
        let mut sums: BTreeMap<String, f32> = BTreeMap::new();
        let mut any_stop = false;

        for rank in 0..world_size {
            let raw = sync.fetch(&record_key(epoch, rank)).await?;
            let record: EpochRecord = serde_json::from_str(&raw)?;

            any_stop |= record.stop;
            for (name, value) in record.metrics {
                *sums.entry(name).or_default() += value;
            }
        }

        let values = sums
            .into_iter()
            .map(|(name, sum)| (name, sum / world_size as f32))
            .collect();

        debug!(epoch = epoch; "reduced metrics {values:?}");
        Ok(ReducedMetrics {
            values,
            stop: any_stop,
        })
    }
}
