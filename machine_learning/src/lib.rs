pub mod arch;
pub mod error;
pub mod optimization;
pub mod state;

pub use error::{MlErr, Result};
pub use state::{StateDict, Tensor};
