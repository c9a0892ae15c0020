//! Process group primitives: a barrier, a small shared key-value exchange and a
//! mean all-reduce for gradients.

mod kv;
mod local;
mod process;
mod reduce;
mod store;
mod synchronizer;
mod thread;

pub use local::LocalGroup;
pub use process::ProcessGroup;
pub use store::{StoreServer, TcpStoreClient};
pub use synchronizer::Synchronizer;
pub use thread::ThreadGroup;

use crate::{DistributedContext, Result};

/// The process group a worker runs in, picked at startup.
pub enum Group {
    Local(LocalGroup),
    Process(ProcessGroup),
}

impl Group {
    /// Joins the group described by `ctx`: a `LocalGroup` for single worker runs,
    /// otherwise a `ProcessGroup` rendezvousing at the master address.
    pub async fn init(ctx: &DistributedContext) -> Result<Self> {
        if ctx.is_distributed() {
            Ok(Group::Process(ProcessGroup::init(ctx).await?))
        } else {
            Ok(Group::Local(LocalGroup::new()))
        }
    }

    /// Leaves the group, waiting for the store to wind down on the primary rank.
    pub async fn shutdown(self) -> Result<()> {
        match self {
            Group::Local(_) => Ok(()),
            Group::Process(group) => group.shutdown().await,
        }
    }
}

impl Synchronizer for Group {
    fn rank(&self) -> usize {
        match self {
            Group::Local(g) => g.rank(),
            Group::Process(g) => g.rank(),
        }
    }

    fn world_size(&self) -> usize {
        match self {
            Group::Local(g) => g.world_size(),
            Group::Process(g) => g.world_size(),
        }
    }

    async fn barrier_wait(&mut self) -> Result<()> {
        match self {
            Group::Local(g) => g.barrier_wait().await,
            Group::Process(g) => g.barrier_wait().await,
        }
    }

    async fn publish(&mut self, key: &str, value: String) -> Result<()> {
        match self {
            Group::Local(g) => g.publish(key, value).await,
            Group::Process(g) => g.publish(key, value).await,
        }
    }

    async fn fetch(&mut self, key: &str) -> Result<String> {
        match self {
            Group::Local(g) => g.fetch(key).await,
            Group::Process(g) => g.fetch(key).await,
        }
    }

    async fn all_reduce_mean(&mut self, key: &str, values: &mut [f32]) -> Result<()> {
        match self {
            Group::Local(g) => g.all_reduce_mean(key, values).await,
            Group::Process(g) => g.all_reduce_mean(key, values).await,
        }
    }
}
