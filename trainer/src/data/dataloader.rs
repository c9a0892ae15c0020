use std::{
    ops::Range,
    sync::{Arc, mpsc},
    thread,
};

use log::debug;
use ndarray::Array2;
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use super::{Batch, Dataset, ShardSpec};
use crate::{Result, TrainErr};

/// A lazy, restartable sequence of batches as the training loop consumes it.
pub trait BatchSource {
    /// How many batches make up one epoch.
    fn batches_per_epoch(&self) -> usize;

    /// Returns the next batch, or `None` once the source is exhausted.
    fn next_batch(&mut self) -> Result<Option<Batch>>;
}

/// Shard-aware loader making one shuffled pass over its shard.
#[derive(Debug)]
pub struct DataLoader<D> {
    dataset: Arc<D>,
    shard_range: Range<usize>,
    batch_size: usize,
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl<D: Dataset> DataLoader<D> {
    /// Creates a new `DataLoader`.
    ///
    /// # Arguments
    /// * `dataset` - The samples to load from.
    /// * `shard` - Which contiguous part of the dataset this loader covers, padded
    ///   so every rank of the group yields the same amount of batches.
    /// * `batch_size` - The maximum amount of samples per batch, the last one may be smaller.
    /// * `seed` - Seed of the per pass shuffling.
    pub fn new(dataset: Arc<D>, shard: ShardSpec, batch_size: usize, seed: u64) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainErr::InvalidConfig("batch size must be positive".into()));
        }

        let shard_range = shard.range(dataset.len());
        let order = shard.indices(dataset.len());
        let mut loader = Self {
            dataset,
            order,
            shard_range,
            batch_size,
            cursor: 0,
            rng: StdRng::seed_from_u64(seed),
        };

        loader.reset();
        Ok(loader)
    }

    #[inline]
    pub fn shard_range(&self) -> Range<usize> {
        self.shard_range.clone()
    }

    /// Amount of batches in one pass, `ceil(padded shard len / batch size)`.
    #[inline]
    pub fn len(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Starts a new pass in a fresh random order.
    pub fn reset(&mut self) {
        self.order.shuffle(&mut self.rng);
        self.cursor = 0;
    }

    /// Returns the next batch of this pass, or `None` if exhausted.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        let (features, classes) = (self.dataset.n_features(), self.dataset.n_classes());

        let mut x = Array2::zeros((indices.len(), features));
        let mut y = Array2::zeros((indices.len(), classes));

        for (row, &idx) in indices.iter().enumerate() {
            let sample = self.dataset.get(idx)?;
            if sample.x.len() != features || sample.label >= classes {
                return Err(TrainErr::Dataset(format!(
                    "sample {idx} doesn't fit {features} features and {classes} classes"
                )));
            }

            x.row_mut(row).iter_mut().zip(&sample.x).for_each(|(dst, &src)| *dst = src);
            y[[row, sample.label]] = 1.0;
        }

        self.cursor = end;
        Ok(Some(Batch { x, y }))
    }
}

enum Source<D> {
    Inline(DataLoader<D>),
    Prefetch(mpsc::Receiver<Result<Batch>>),
}

/// Wraps a finite `DataLoader` into a sequence that restarts it whenever a pass
/// ends, for `cycles` passes or indefinitely.
pub struct CyclicLoader<D> {
    source: Source<D>,
    batches_per_epoch: usize,
    remaining: Option<usize>,
}

impl<D: Dataset + 'static> CyclicLoader<D> {
    /// Creates a new `CyclicLoader`.
    ///
    /// # Arguments
    /// * `loader` - The finite loader to repeat.
    /// * `cycles` - Amount of full passes to yield, `None` repeats forever.
    pub fn new(loader: DataLoader<D>, cycles: Option<usize>) -> Self {
        let batches_per_epoch = loader.len();
        Self {
            remaining: cycles.map(|c| c * batches_per_epoch),
            batches_per_epoch,
            source: Source::Inline(loader),
        }
    }

    /// Like `new`, but batches are assembled on a background thread running at
    /// most `depth` batches ahead of the consumer.
    pub fn prefetching(loader: DataLoader<D>, cycles: Option<usize>, depth: usize) -> Result<Self> {
        let batches_per_epoch = loader.len();
        let remaining = cycles.map(|c| c * batches_per_epoch);
        let (tx, rx) = mpsc::sync_channel(depth.max(1));

        thread::Builder::new()
            .name("prefetch".into())
            .spawn(move || {
                let mut loader = loader;
                let mut budget = remaining;

                while budget != Some(0) {
                    let batch = next_cyclic(&mut loader);
                    let failed = batch.is_err();

                    if tx.send(batch).is_err() || failed {
                        break;
                    }
                    budget = budget.map(|b| b - 1);
                }

                debug!("prefetch thread done");
            })?;

        Ok(Self {
            source: Source::Prefetch(rx),
            batches_per_epoch,
            remaining,
        })
    }
}

/// Pulls from `loader`, starting a new pass when the current one is exhausted.
fn next_cyclic<D: Dataset>(loader: &mut DataLoader<D>) -> Result<Batch> {
    if let Some(batch) = loader.next_batch()? {
        return Ok(batch);
    }

    loader.reset();
    loader
        .next_batch()?
        .ok_or_else(|| TrainErr::Dataset("cannot cycle over an empty shard".into()))
}

impl<D: Dataset> BatchSource for CyclicLoader<D> {
    fn batches_per_epoch(&self) -> usize {
        self.batches_per_epoch
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.remaining == Some(0) || self.batches_per_epoch == 0 {
            return Ok(None);
        }

        let batch = match &mut self.source {
            Source::Inline(loader) => next_cyclic(loader)?,
            Source::Prefetch(rx) => match rx.recv() {
                Ok(batch) => batch?,
                Err(_) => return Ok(None),
            },
        };

        self.remaining = self.remaining.map(|r| r - 1);
        Ok(Some(batch))
    }
}
