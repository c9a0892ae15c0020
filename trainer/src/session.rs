use std::time::{Duration, Instant};

use log::{info, warn};
use machine_learning::{arch::Model, optimization::Optimizer};

use crate::{BestModelSelector, CheckpointStore, Result, tracker::RunTracker};

/// The live state of a training process: the model and optimizer it exclusively
/// owns, the next epoch to run and its wall-clock budget.
pub struct TrainingSession<M, O> {
    pub model: M,
    pub optimizer: O,
    epoch: usize,
    start: Instant,
    cutoff: Option<Duration>,
}

impl<M: Model, O: Optimizer> TrainingSession<M, O> {
    /// Creates a new `TrainingSession`, its clock starts now.
    ///
    /// # Arguments
    /// * `model` - The model to train.
    /// * `optimizer` - The optimizer updating `model`'s parameters.
    /// * `epoch` - The first epoch to run.
    /// * `cutoff` - The wall-clock budget, if any.
    pub fn new(model: M, optimizer: O, epoch: usize, cutoff: Option<Duration>) -> Self {
        Self {
            model,
            optimizer,
            epoch,
            start: Instant::now(),
            cutoff,
        }
    }

    /// The next epoch to run.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub(crate) fn advance(&mut self) {
        self.epoch += 1;
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Whether the wall-clock budget is used up.
    pub fn cutoff_reached(&self) -> bool {
        self.cutoff.is_some_and(|cutoff| self.elapsed() >= cutoff)
    }
}

/// What a resumed run continues from.
#[derive(Debug)]
pub struct Resumed {
    pub epoch: usize,
    pub run_id: Option<String>,
    pub selector: BestModelSelector,
}

/// Restores `model` and `optimizer` from the checkpoint in `store` and rebuilds the
/// best model selection from the run's tracked metrics.
///
/// The selection falls back from `selected_epoch` to the checkpoint's epoch, and
/// from `selected_acc` to the last `acc`, then to `0.0`. Without persisted best
/// weights the selection starts over.
///
/// # Returns
/// The resumed position, or `MissingCheckpoint` if the checkpoint is incomplete.
pub async fn resume<M, O, T>(
    store: &CheckpointStore,
    tracker: &mut T,
    model: &mut M,
    optimizer: &mut O,
) -> Result<Resumed>
where
    M: Model,
    O: Optimizer,
    T: RunTracker,
{
    let checkpoint = store.load()?;
    model.load_state_dict(&checkpoint.last)?;
    optimizer.load_state_dict(&checkpoint.optimizer)?;

    let init_epoch = checkpoint.metadata.init_epoch;
    let run_id = checkpoint.metadata.mlflow_run_id;

    let metrics = match &run_id {
        Some(run_id) => tracker.get_run_metrics(run_id).await?,
        None => Default::default(),
    };

    let epoch = metrics
        .get("selected_epoch")
        .map_or(init_epoch, |&epoch| epoch as usize);
    let accuracy = metrics
        .get("selected_acc")
        .or_else(|| metrics.get("acc"))
        .copied()
        .unwrap_or(0.0);

    if checkpoint.best.is_none() && accuracy > 0.0 {
        warn!("best weights of epoch {epoch} are missing, selecting again from scratch");
    }

    info!("resuming from epoch {init_epoch}, selected epoch {epoch} at accuracy {accuracy}");
    Ok(Resumed {
        epoch: init_epoch,
        run_id,
        selector: BestModelSelector::resume(checkpoint.best, epoch, accuracy),
    })
}
