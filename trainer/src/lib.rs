pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod data;
pub mod error;
pub mod metrics;
pub mod selector;
pub mod session;
pub mod sync;
pub mod tracker;

pub use checkpoint::{CheckpointMetadata, CheckpointState, CheckpointStore};
pub use config::{DistributedContext, TrainConfig};
pub use controller::{Controller, Interrupt, RunOutcome};
pub use error::{Result, TrainErr};
pub use selector::{BestModelSelector, SelectedSnapshot};
pub use session::{Resumed, TrainingSession, resume};
