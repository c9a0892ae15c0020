use std::time::Duration;

use log::info;

use super::{StoreServer, Synchronizer, TcpStoreClient};
use crate::{DistributedContext, Result, TrainErr};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

/// A rank of a multi-process group coordinating through the TCP store.
pub struct ProcessGroup {
    rank: usize,
    world_size: usize,
    client: TcpStoreClient,
    server: Option<StoreServer>,
}

impl ProcessGroup {
    /// Joins the group described by `ctx`, hosting the store on the primary rank.
    pub async fn init(ctx: &DistributedContext) -> Result<Self> {
        let mut server = None;
        if ctx.is_primary() {
            server = Some(StoreServer::bind(ctx.master(), ctx.world_size).await?);
        }

        Self::connect(ctx.rank, ctx.world_size, &ctx.master(), server).await
    }

    /// Connects as `rank` to the store at `addr` and waits for the rest of the group.
    ///
    /// # Arguments
    /// * `rank` - This worker's rank.
    /// * `world_size` - The expected size of the group.
    /// * `addr` - The store's address.
    /// * `server` - The store itself, when this rank hosts it.
    pub async fn connect(
        rank: usize,
        world_size: usize,
        addr: &str,
        server: Option<StoreServer>,
    ) -> Result<Self> {
        let mut client = TcpStoreClient::connect(addr, rank, CONNECT_TIMEOUT).await?;

        if client.world_size() != world_size {
            return Err(TrainErr::InvalidConfig(format!(
                "expected a world of {world_size}, the store serves {}",
                client.world_size()
            )));
        }

        client.barrier().await?;
        info!("rank {rank} of {world_size} ready");

        Ok(Self {
            rank,
            world_size,
            client,
            server,
        })
    }

    /// Leaves the group; the primary rank also waits for the store to drain.
    pub async fn shutdown(self) -> Result<()> {
        self.client.disconnect().await?;

        if let Some(server) = self.server {
            server.join().await?;
        }

        Ok(())
    }
}

impl Synchronizer for ProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn barrier_wait(&mut self) -> Result<()> {
        self.client.barrier().await
    }

    async fn publish(&mut self, key: &str, value: String) -> Result<()> {
        self.client.set(key, value).await
    }

    async fn fetch(&mut self, key: &str) -> Result<String> {
        self.client.get(key).await
    }

    async fn all_reduce_mean(&mut self, key: &str, values: &mut [f32]) -> Result<()> {
        self.client.reduce(key, values).await
    }
}
