use std::sync::Arc;

use tokio::sync::Barrier;

use super::{Synchronizer, kv::KvStore, reduce::MeanReducer};
use crate::Result;

/// A group of ranks living as tasks of the same process.
#[derive(Clone)]
pub struct ThreadGroup {
    rank: usize,
    world_size: usize,
    barrier: Arc<Barrier>,
    kv: Arc<KvStore>,
    reducer: Arc<MeanReducer>,
}

impl ThreadGroup {
    /// Creates the handles of a new group, one per rank, in rank order.
    ///
    /// # Arguments
    /// * `world_size` - The amount of ranks in the group.
    pub fn new(world_size: usize) -> Vec<Self> {
        let barrier = Arc::new(Barrier::new(world_size));
        let kv = Arc::new(KvStore::default());
        let reducer = Arc::new(MeanReducer::new(world_size));

        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                barrier: barrier.clone(),
                kv: kv.clone(),
                reducer: reducer.clone(),
            })
            .collect()
    }
}

impl Synchronizer for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn barrier_wait(&mut self) -> Result<()> {
        self.barrier.wait().await;
        Ok(())
    }

    async fn publish(&mut self, key: &str, value: String) -> Result<()> {
        self.kv.set(key.to_string(), value);
        Ok(())
    }

    async fn fetch(&mut self, key: &str) -> Result<String> {
        Ok(self.kv.get(key).await)
    }

    async fn all_reduce_mean(&mut self, key: &str, values: &mut [f32]) -> Result<()> {
        let mean = self.reducer.all_reduce_mean(key, values).await?;
        values.copy_from_slice(&mean);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn fetch_waits_for_the_publish() {
        let mut group = ThreadGroup::new(2);
        let mut writer = group.pop().unwrap();
        let mut reader = group.pop().unwrap();

        let fetch = tokio::spawn(async move { reader.fetch("k").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.publish("k", "v".into()).await.unwrap();

        assert_eq!(fetch.await.unwrap().unwrap(), "v");
    }

    #[tokio::test]
    async fn barrier_releases_once_every_rank_arrived() {
        let group = ThreadGroup::new(3);
        let tasks: Vec<_> = group
            .into_iter()
            .map(|mut rank| tokio::spawn(async move { rank.barrier_wait().await }))
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn all_reduce_mean_averages_across_ranks() {
        let tasks: Vec<_> = ThreadGroup::new(2)
            .into_iter()
            .map(|mut rank| {
                tokio::spawn(async move {
                    let mut values = [rank.rank() as f32, 4.0];
                    rank.all_reduce_mean("grad/0/0", &mut values).await.unwrap();
                    values
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap(), [0.5, 4.0]);
        }
    }
}
