use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{Result, TrainErr};

/// The sum of a round's contributions and how many ranks took part so far.
#[derive(Debug)]
struct Round {
    sum: Box<[f32]>,
    contributed: usize,
    collected: usize,
}

/// Accumulates one buffer per rank under a key and hands every rank their mean.
///
/// A round is dropped once every rank collected its mean, so keys only have to be
/// unique among the rounds in flight.
#[derive(Debug)]
pub(super) struct MeanReducer {
    world_size: usize,
    rounds: Mutex<HashMap<String, Round>>,
    completed: Notify,
}

impl MeanReducer {
    pub fn new(world_size: usize) -> Self {
        Self {
            world_size,
            rounds: Mutex::new(HashMap::new()),
            completed: Notify::new(),
        }
    }

    /// Adds `values` to the round under `key` and waits for the other ranks.
    ///
    /// # Returns
    /// The element-wise mean over every rank's contribution, the same on every rank.
    pub async fn all_reduce_mean(&self, key: &str, values: &[f32]) -> Result<Vec<f32>> {
        self.contribute(key, values)?;

        loop {
            let completed = self.completed.notified();

            if let Some(mean) = self.collect(key) {
                return Ok(mean);
            }

            completed.await;
        }
    }

    fn contribute(&self, key: &str, values: &[f32]) -> Result<()> {
        let mut rounds = self.rounds.lock();
        let round = rounds.entry(key.to_string()).or_insert_with(|| Round {
            sum: vec![0.; values.len()].into_boxed_slice(),
            contributed: 0,
            collected: 0,
        });

        if round.sum.len() != values.len() {
            return Err(TrainErr::Store(format!(
                "reduction {key:?} expects {} values, got {}",
                round.sum.len(),
                values.len()
            )));
        }

        for (acc, v) in round.sum.iter_mut().zip(values) {
            *acc += v;
        }
        round.contributed += 1;

        if round.contributed == self.world_size {
            self.completed.notify_waiters();
        }

        Ok(())
    }

    fn collect(&self, key: &str) -> Option<Vec<f32>> {
        let mut rounds = self.rounds.lock();
        let round = rounds.get_mut(key)?;
        if round.contributed < self.world_size {
            return None;
        }

        let n = self.world_size as f32;
        let mean = round.sum.iter().map(|v| v / n).collect();

        round.collected += 1;
        if round.collected == self.world_size {
            rounds.remove(key);
        }

        Some(mean)
    }

    #[cfg(test)]
    fn rounds_in_flight(&self) -> usize {
        self.rounds.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn every_rank_gets_the_same_mean() {
        let reducer = Arc::new(MeanReducer::new(3));
        let tasks: Vec<_> = (0..3)
            .map(|rank| {
                let reducer = reducer.clone();
                tokio::spawn(async move {
                    let values = [rank as f32, 2.0 * rank as f32];
                    reducer.all_reduce_mean("grad/0/0", &values).await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), vec![1.0, 2.0]);
        }
        assert_eq!(reducer.rounds_in_flight(), 0);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let reducer = MeanReducer::new(2);
        reducer.contribute("k", &[1.0, 2.0]).unwrap();

        assert!(matches!(reducer.contribute("k", &[1.0]), Err(TrainErr::Store(_))));
        assert!(reducer.collect("k").is_none());
    }
}
