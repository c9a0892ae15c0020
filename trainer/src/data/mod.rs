pub mod dataloader;
pub mod dataset;
pub mod shard;

pub use dataloader::{BatchSource, CyclicLoader, DataLoader};
pub use dataset::{Batch, Dataset, ImageFolder, InMemoryDataset, Sample};
pub use shard::{ShardSpec, shard_range};
