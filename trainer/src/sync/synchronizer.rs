use crate::Result;

/// A worker's handle on its process group.
///
/// Every rank writes only keys namespaced by its own rank, reads are open to all.
/// A `fetch` issued after an intervening `barrier_wait` observes every `publish`
/// that returned before the barrier on any rank.
#[allow(unused)]
#[trait_variant::make(Synchronizer: Send)]
pub trait LocalSynchronizer {
    /// This worker's rank, `0` is the primary.
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Blocks until every rank in the group has called it, then releases them all.
    async fn barrier_wait(&mut self) -> Result<()>;

    /// Stores `value` under `key`, visible to every rank.
    async fn publish(&mut self, key: &str, value: String) -> Result<()>;

    /// Returns the value under `key`, waiting for it to be published if needed.
    async fn fetch(&mut self, key: &str) -> Result<String>;

    /// Replaces `values` with their element-wise mean over every rank.
    ///
    /// Every rank calls it with the same `key` and length, and no rank returns
    /// before all of them contributed. A `key` may be reused once the previous
    /// reduction under it returned on every rank.
    async fn all_reduce_mean(&mut self, key: &str, values: &mut [f32]) -> Result<()>;
}
