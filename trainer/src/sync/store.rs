//! The rendezvous key-value store hosted by the primary rank.

use std::{
    borrow::Cow,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use comms::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg},
};
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{
        TcpListener, TcpStream, ToSocketAddrs,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Barrier,
    task::{JoinHandle, JoinSet},
    time,
};

use super::{kv::KvStore, reduce::MeanReducer};
use crate::{Result, TrainErr};

const RETRY_INTERVAL: Duration = Duration::from_millis(200);

fn unexpected(expected: &'static str, got: &Msg) -> TrainErr {
    TrainErr::UnexpectedMessage {
        expected,
        got: format!("{got:?}"),
    }
}

/// Serves `Set`, `Get`, `Reduce` and `Barrier` to exactly `world_size` ranks and finishes once
/// all of them disconnected.
pub struct StoreServer {
    addr: SocketAddr,
    task: JoinHandle<Result<()>>,
}

impl StoreServer {
    /// Binds the store and starts serving in the background.
    ///
    /// # Arguments
    /// * `addr` - Where to listen.
    /// * `world_size` - The amount of ranks that will connect.
    pub async fn bind(addr: impl ToSocketAddrs, world_size: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!("store listening at {addr}");

        let task = tokio::spawn(Self::serve(listener, world_size));
        Ok(Self { addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Waits for every rank to disconnect.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| TrainErr::Store(format!("store task failed: {e}")))?
    }

    async fn serve(listener: TcpListener, world_size: usize) -> Result<()> {
        let kv = Arc::new(KvStore::default());
        let barrier = Arc::new(Barrier::new(world_size));
        let reducer = Arc::new(MeanReducer::new(world_size));
        let mut tasks = JoinSet::new();

        for _ in 0..world_size {
            let (stream, peer) = listener.accept().await?;
            debug!("store connection from {peer}");

            let (rx, tx) = comms::tcp_channel(stream)?;
            let shared = Shared {
                kv: kv.clone(),
                barrier: barrier.clone(),
                reducer: reducer.clone(),
            };
            tasks.spawn(serve_peer(rx, tx, world_size, shared));
        }

        for result in tasks.join_all().await {
            result?;
        }

        info!("every rank left the store");
        Ok(())
    }
}

/// The state every peer's connection works on.
struct Shared {
    kv: Arc<KvStore>,
    barrier: Arc<Barrier>,
    reducer: Arc<MeanReducer>,
}

/// Decodes the native endian `f32`s of a `Value` frame.
fn decode_values(raw: &[u8]) -> Result<Vec<f32>> {
    if raw.len() % size_of::<f32>() != 0 {
        return Err(TrainErr::Store(format!(
            "{} bytes do not hold whole f32 values",
            raw.len()
        )));
    }

    Ok(bytemuck::pod_collect_to_vec(raw))
}

async fn serve_peer<R, W>(
    mut rx: OnoReceiver<R>,
    mut tx: OnoSender<W>,
    world_size: usize,
    shared: Shared,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let rank = match rx.recv().await? {
        Msg::Control(Command::Join { rank }) => rank,
        other => return Err(unexpected("join", &other)),
    };

    tx.send(&Msg::Control(Command::Joined { world_size })).await?;
    info!("rank {rank} joined the store");

    loop {
        let cmd = match rx.recv().await? {
            Msg::Control(cmd) => cmd,
            other => return Err(unexpected("a command", &other)),
        };

        match cmd {
            Command::Set { key, value } => {
                shared.kv.set(key, value);
                tx.send(&Msg::Control(Command::Stored)).await?;
            }
            Command::Get { key } => {
                let value = shared.kv.get(&key).await;
                tx.send(&Msg::Value(value.as_bytes())).await?;
            }
            Command::Reduce { key } => {
                let values = match rx.recv().await? {
                    Msg::Value(raw) => decode_values(raw)?,
                    other => return Err(unexpected("value", &other)),
                };

                match shared.reducer.all_reduce_mean(&key, &values).await {
                    Ok(mean) => tx.send(&Msg::Value(bytemuck::cast_slice(&mean))).await?,
                    Err(e) => {
                        warn!("rank {rank} failed to reduce {key:?}: {e}");
                        tx.send(&Msg::Err(Cow::Owned(e.to_string()))).await?;
                    }
                }
            }
            Command::Barrier => {
                shared.barrier.wait().await;
                tx.send(&Msg::Control(Command::Released)).await?;
            }
            Command::Disconnect => {
                debug!("rank {rank} left the store");
                return Ok(());
            }
            other => {
                warn!("rank {rank} sent {other:?}");
                let err = Msg::Err(Cow::Owned(format!("unexpected command {other:?}")));
                tx.send(&err).await?;
            }
        }
    }
}

/// A rank's connection to the `StoreServer`.
pub struct TcpStoreClient {
    world_size: usize,
    rx: OnoReceiver<OwnedReadHalf>,
    tx: OnoSender<OwnedWriteHalf>,
}

impl TcpStoreClient {
    /// Connects to the store, retrying until it is reachable or `timeout` elapses,
    /// and joins as `rank`.
    ///
    /// # Returns
    /// The connected client, or an io error if the store never came up.
    pub async fn connect(addr: &str, rank: usize, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;

        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    debug!("store at {addr} not reachable yet: {e}");
                    time::sleep(RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        };
        let (mut rx, mut tx) = comms::tcp_channel(stream)?;

        tx.send(&Msg::Control(Command::Join { rank })).await?;
        let world_size = match rx.recv().await? {
            Msg::Control(Command::Joined { world_size }) => world_size,
            other => return Err(unexpected("joined", &other)),
        };

        Ok(Self { world_size, rx, tx })
    }

    /// The size of the group as announced by the store.
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub async fn set(&mut self, key: &str, value: String) -> Result<()> {
        let cmd = Command::Set {
            key: key.to_string(),
            value,
        };
        self.tx.send(&Msg::Control(cmd)).await?;

        match self.rx.recv().await? {
            Msg::Control(Command::Stored) => Ok(()),
            Msg::Err(e) => Err(TrainErr::Store(e.into_owned())),
            other => Err(unexpected("stored", &other)),
        }
    }

    /// Returns the value under `key`, the store answers once it exists.
    pub async fn get(&mut self, key: &str) -> Result<String> {
        let cmd = Command::Get {
            key: key.to_string(),
        };
        self.tx.send(&Msg::Control(cmd)).await?;

        match self.rx.recv().await? {
            Msg::Value(raw) => {
                String::from_utf8(raw.to_vec()).map_err(|e| TrainErr::Store(e.to_string()))
            }
            Msg::Err(e) => Err(TrainErr::Store(e.into_owned())),
            other => Err(unexpected("value", &other)),
        }
    }

    /// Contributes `values` to the reduction under `key` and overwrites them with
    /// the mean over every rank, once the store has it.
    pub async fn reduce(&mut self, key: &str, values: &mut [f32]) -> Result<()> {
        let cmd = Command::Reduce {
            key: key.to_string(),
        };
        self.tx.send(&Msg::Control(cmd)).await?;
        self.tx.send(&Msg::Value(bytemuck::cast_slice(values))).await?;

        let mean = match self.rx.recv().await? {
            Msg::Value(raw) => decode_values(raw)?,
            Msg::Err(e) => return Err(TrainErr::Store(e.into_owned())),
            other => return Err(unexpected("value", &other)),
        };

        if mean.len() != values.len() {
            return Err(TrainErr::Store(format!(
                "reduction {key:?} returned {} values, expected {}",
                mean.len(),
                values.len()
            )));
        }

        values.copy_from_slice(&mean);
        Ok(())
    }

    pub async fn barrier(&mut self) -> Result<()> {
        self.tx.send(&Msg::Control(Command::Barrier)).await?;

        match self.rx.recv().await? {
            Msg::Control(Command::Released) => Ok(()),
            Msg::Err(e) => Err(TrainErr::Store(e.into_owned())),
            other => Err(unexpected("released", &other)),
        }
    }

    pub async fn disconnect(mut self) -> Result<()> {
        self.tx.send(&Msg::Control(Command::Disconnect)).await?;
        Ok(())
    }
}
