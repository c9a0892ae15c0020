//! The epoch loop driving a training session.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, error, info, warn};
use machine_learning::{
    arch::{Model, loss::LossFn},
    optimization::Optimizer,
};
use ndarray::Array2;
use tokio::signal;

use crate::{
    BestModelSelector, CheckpointMetadata, CheckpointState, CheckpointStore, Result,
    SelectedSnapshot, TrainConfig, TrainingSession,
    data::{Batch, BatchSource},
    metrics::{ACC, EpochMetrics, ReducedMetrics},
    sync::Synchronizer,
    tracker::RunTracker,
};

const SEPARATOR: &str = "----------";

/// Exit status after a second ctrl-c, `128 + SIGINT`.
const EXIT_INTERRUPTED: i32 = 130;

fn gradient_key(epoch: usize, step: usize) -> String {
    format!("grad/{epoch}/{step}")
}

/// A user's request to stop, shared between the signal handler and the loop.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a task raising this interrupt on the first ctrl-c and exiting the
    /// process on the next one, e.g. when a rank hangs on a lost peer.
    pub fn listen_ctrl_c(&self) {
        let flag = self.clone();
        tokio::spawn(async move {
            while signal::ctrl_c().await.is_ok() {
                if flag.escalate() {
                    error!("interrupted again, exiting");
                    std::process::exit(EXIT_INTERRUPTED);
                }

                warn!("interrupt received, finishing the current epoch early");
            }
        });
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Raises the interrupt.
    ///
    /// # Returns
    /// Whether it had already been raised.
    pub fn escalate(&self) -> bool {
        self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// How a run ended.
#[derive(Debug)]
pub struct RunOutcome {
    /// The last epoch whose bookkeeping ran, `None` if the loop never ran one.
    pub final_epoch: Option<usize>,
    /// The epoch a resumed run would start at.
    pub next_epoch: usize,
    /// The final and best weights, only on the primary rank.
    pub selected: Option<SelectedSnapshot>,
}

/// Drives epochs of a `TrainingSession` and coordinates the metric reduction,
/// best model selection, checkpointing and experiment logging around them.
pub struct Controller<S, T> {
    epochs: usize,
    checkpointing: bool,
    hyperparams: BTreeMap<String, String>,
    sync: S,
    tracker: T,
    store: CheckpointStore,
    interrupt: Interrupt,
    run_id: Option<String>,
}

impl<S: Synchronizer, T: RunTracker> Controller<S, T> {
    /// Creates a new `Controller`.
    ///
    /// # Arguments
    /// * `cfg` - The run's configuration.
    /// * `sync` - This worker's handle on its process group.
    /// * `tracker` - The experiment log, only used by the primary rank.
    /// * `store` - The model's checkpoint directory, only written by the primary rank.
    /// * `interrupt` - The user's stop request.
    pub fn new(
        cfg: &TrainConfig,
        sync: S,
        tracker: T,
        store: CheckpointStore,
        interrupt: Interrupt,
    ) -> Self {
        Self {
            epochs: cfg.epochs,
            checkpointing: cfg.checkpointing,
            hyperparams: cfg.hyperparams(),
            sync,
            tracker,
            store,
            interrupt,
            run_id: None,
        }
    }

    /// Continues the experiment run `run_id` instead of starting a new one.
    pub fn with_run_id(mut self, run_id: Option<String>) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn sync(&self) -> &S {
        &self.sync
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn into_parts(self) -> (S, T) {
        (self.sync, self.tracker)
    }

    /// Runs the session's remaining epochs, stopping early on a cutoff or an
    /// interrupt, then finalizes the run.
    ///
    /// Every rank takes part in every epoch's reduction, including a truncated one,
    /// and all ranks leave the loop after the same epoch.
    ///
    /// # Arguments
    /// * `session` - The model and optimizer to train and the epoch to start at.
    /// * `loader` - The batches, `batches_per_epoch` of them are consumed per epoch.
    /// * `loss_fn` - The loss to minimize.
    /// * `selector` - The best model selection so far.
    ///
    /// # Returns
    /// How the run ended, or the first fatal error.
    pub async fn run<M, O, L, F>(
        &mut self,
        session: &mut TrainingSession<M, O>,
        loader: &mut L,
        loss_fn: &F,
        mut selector: BestModelSelector,
    ) -> Result<RunOutcome>
    where
        M: Model,
        O: Optimizer,
        L: BatchSource,
        F: LossFn,
    {
        let primary = self.sync.rank() == 0;
        let start_epoch = session.epoch();
        let interval = (self.epochs / 10).max(1);

        if primary {
            let run_id = self.tracker.start_run(self.run_id.take()).await?;
            self.tracker.log_params(&self.hyperparams).await?;
            self.run_id = Some(run_id);
        }

        let mut metrics = EpochMetrics::new();
        let mut final_epoch = None;
        let mut last_accuracy = 0.0;

        while session.epoch() < self.epochs {
            let epoch = session.epoch();
            if primary && (epoch + 1) % interval == 0 {
                println!("{SEPARATOR}");
            }

            let interrupted = self.run_epoch(session, loader, loss_fn, &mut metrics).await?;
            let stop = interrupted || session.cutoff_reached();

            let reduced = metrics
                .compute_distributed(&mut self.sync, epoch, stop)
                .await?;
            final_epoch = Some(epoch);
            session.advance();

            if primary {
                self.end_epoch(epoch, &reduced, session, &mut selector, interval)?;
                last_accuracy = reduced.get(ACC);
            }

            if reduced.stop {
                info!("stopping after epoch {epoch}");
                break;
            }
        }

        let next_epoch = final_epoch.map_or(start_epoch, |epoch| epoch + 1);
        let mut selected = None;
        if primary {
            let epoch = final_epoch.unwrap_or(start_epoch);
            selected = Some(self.finalize(session, selector, epoch, next_epoch, last_accuracy).await?);
        }

        Ok(RunOutcome {
            final_epoch,
            next_epoch,
            selected,
        })
    }

    /// Runs one epoch's batches.
    ///
    /// In a group every rank takes every step together: gradients are averaged
    /// before each optimizer step, and a rank that was interrupted contributes a
    /// stop request instead of a batch, which ends the epoch on every rank before
    /// that step is applied.
    ///
    /// # Returns
    /// Whether an interrupt cut the epoch short on this rank.
    async fn run_epoch<M, O, L, F>(
        &mut self,
        session: &mut TrainingSession<M, O>,
        loader: &mut L,
        loss_fn: &F,
        metrics: &mut EpochMetrics,
    ) -> Result<bool>
    where
        M: Model,
        O: Optimizer,
        L: BatchSource,
        F: LossFn,
    {
        let epoch = session.epoch();
        let distributed = self.sync.world_size() > 1;
        let mut payload = Vec::new();

        for step in 0..loader.batches_per_epoch() {
            let interrupted = self.interrupt.is_triggered();
            let batch = if interrupted { None } else { loader.next_batch()? };

            session.model.zero_grad();
            let scored = match &batch {
                Some(batch) => Some(forward_backward(&mut session.model, batch, loss_fn)?),
                None => None,
            };

            let (params, grad) = session.model.parameters();
            let mut stop = scored.is_none();
            if distributed {
                payload.clear();
                payload.extend_from_slice(grad);
                payload.push(if stop { 1.0 } else { 0.0 });

                self.sync
                    .all_reduce_mean(&gradient_key(epoch, step), &mut payload)
                    .await?;

                let (mean, requests) = payload.split_at(grad.len());
                grad.copy_from_slice(mean);
                stop = requests[0] > 0.0;
            }

            if stop {
                if interrupted {
                    warn!("epoch {epoch} interrupted");
                } else if distributed && scored.is_some() {
                    warn!("epoch {epoch} interrupted by another rank");
                }
                return Ok(interrupted);
            }

            session.optimizer.step(params, grad)?;

            if let (Some(batch), Some((y_pred, loss))) = (&batch, scored) {
                metrics.update(y_pred.view(), batch.y.view(), loss);
            }
        }

        Ok(self.interrupt.is_triggered())
    }

    /// The primary rank's bookkeeping after an epoch was reduced.
    fn end_epoch<M, O>(
        &mut self,
        epoch: usize,
        reduced: &ReducedMetrics,
        session: &TrainingSession<M, O>,
        selector: &mut BestModelSelector,
        interval: usize,
    ) -> Result<()>
    where
        M: Model,
        O: Optimizer,
    {
        self.tracker.log_metrics(&reduced.values, epoch)?;

        let accuracy = reduced.get(ACC);
        if selector.offer(epoch, accuracy, || session.model.state_dict()) {
            debug!("epoch {epoch} is the new best at accuracy {accuracy}");
        }

        if self.checkpointing {
            let metadata = CheckpointMetadata {
                init_epoch: epoch + 1,
                mlflow_run_id: self.run_id.clone(),
            };
            self.store.save_epoch(
                &session.model.state_dict(),
                &session.optimizer.state_dict(),
                &metadata,
            )?;
        }

        if (epoch + 1) % interval == 0 {
            println!("epoch\t\t\t: {}", epoch + 1);
            for (name, value) in &reduced.values {
                println!("{name}\t\t: {value}");
            }
        }

        Ok(())
    }

    /// Closes the selection, reports it and persists the run for a future resume.
    async fn finalize<M, O>(
        &mut self,
        session: &TrainingSession<M, O>,
        selector: BestModelSelector,
        epoch: usize,
        next_epoch: usize,
        last_accuracy: f32,
    ) -> Result<SelectedSnapshot>
    where
        M: Model,
        O: Optimizer,
    {
        let selected = selector.finish(session.model.state_dict(), epoch, last_accuracy);
        info!(
            "selected epoch {} at accuracy {}",
            selected.best_epoch, selected.best_accuracy
        );

        let report = BTreeMap::from([
            ("selected_epoch".to_string(), selected.best_epoch as f32),
            ("selected_acc".to_string(), selected.best_accuracy),
        ]);
        self.tracker.log_metrics(&report, epoch)?;

        if self.checkpointing {
            self.store.save(&CheckpointState {
                last: selected.last.clone(),
                optimizer: session.optimizer.state_dict(),
                best: Some(selected.best.clone()),
                metadata: CheckpointMetadata {
                    init_epoch: next_epoch,
                    mlflow_run_id: self.run_id.clone(),
                },
            })?;
        } else {
            self.store.save_weights(&selected.last, &selected.best)?;
        }

        self.tracker.finish().await?;
        println!("{SEPARATOR}");
        Ok(selected)
    }
}

/// Scores `batch` and back-propagates its loss into the model's gradient.
///
/// # Returns
/// The predictions and the batch loss.
fn forward_backward<M, F>(model: &mut M, batch: &Batch, loss_fn: &F) -> Result<(Array2<f32>, f32)>
where
    M: Model,
    F: LossFn,
{
    let y_pred = model.forward(batch.x.view())?;
    let loss = loss_fn.loss(y_pred.view(), batch.y.view())?;
    let d = loss_fn.loss_prime(y_pred.view(), batch.y.view())?;
    model.backward(d.view())?;
    Ok((y_pred, loss))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_a_repeated_interrupt_escalates() {
        let interrupt = Interrupt::new();
        let shared = interrupt.clone();

        assert!(!shared.escalate());
        assert!(interrupt.is_triggered());
        assert!(shared.escalate());
    }

    #[test]
    fn gradient_keys_are_unique_per_step() {
        assert_ne!(gradient_key(0, 1), gradient_key(1, 0));
        assert_eq!(gradient_key(2, 3), "grad/2/3");
    }
}
