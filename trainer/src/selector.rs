use machine_learning::StateDict;

/// The weights a run ends with: the final ones and the most accurate ones seen.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedSnapshot {
    pub last: StateDict,
    pub best: StateDict,
    pub best_epoch: usize,
    pub best_accuracy: f32,
}

/// Keeps the highest accuracy snapshot offered across the epochs of a logical run.
#[derive(Debug, Clone)]
pub struct BestModelSelector {
    best: Option<StateDict>,
    epoch: usize,
    accuracy: f32,
}

impl BestModelSelector {
    /// Creates a selector for a run starting at `init_epoch` with nothing selected yet.
    pub fn new(init_epoch: usize) -> Self {
        Self {
            best: None,
            epoch: init_epoch,
            accuracy: 0.0,
        }
    }

    /// Creates a selector continuing a previous run's selection.
    ///
    /// A selection whose weights were not persisted cannot be reported, so without
    /// `best` the selection starts over and any later epoch replaces it.
    ///
    /// # Arguments
    /// * `best` - The selected weights, if they were persisted.
    /// * `epoch` - The epoch they were selected at.
    /// * `accuracy` - Their accuracy, later epochs must beat it.
    pub fn resume(best: Option<StateDict>, epoch: usize, accuracy: f32) -> Self {
        match best {
            Some(best) => Self {
                best: Some(best),
                epoch,
                accuracy,
            },
            None => Self::new(epoch),
        }
    }

    /// Offers an epoch's accuracy. Only a strictly better accuracy replaces the
    /// selection, in which case `snapshot` is called to copy the current weights.
    ///
    /// # Returns
    /// Whether the offer became the new best.
    pub fn offer<F>(&mut self, epoch: usize, accuracy: f32, snapshot: F) -> bool
    where
        F: FnOnce() -> StateDict,
    {
        if accuracy <= self.accuracy {
            return false;
        }

        self.best = Some(snapshot());
        self.epoch = epoch;
        self.accuracy = accuracy;
        true
    }

    pub fn best_epoch(&self) -> usize {
        self.epoch
    }

    pub fn best_accuracy(&self) -> f32 {
        self.accuracy
    }

    /// Closes the selection. When nothing was ever selected the final weights
    /// stand in as the best, at `epoch` with `accuracy`.
    pub fn finish(self, last: StateDict, epoch: usize, accuracy: f32) -> SelectedSnapshot {
        match self.best {
            Some(best) => SelectedSnapshot {
                last,
                best,
                best_epoch: self.epoch,
                best_accuracy: self.accuracy,
            },
            None => SelectedSnapshot {
                best: last.clone(),
                last,
                best_epoch: epoch,
                best_accuracy: accuracy,
            },
        }
    }
}
