use std::{
    error::Error,
    fmt::{self, Display},
};

use safetensors::SafeTensorError;

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug)]
pub enum MlErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    ShapeMismatch {
        name: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    MissingEntry(String),
    UnsupportedDtype {
        name: String,
        dtype: String,
    },
    InvalidConfig(String),
    SafeTensors(SafeTensorError),
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "There's a size mismatch in {what}, got {got} and expected {expected}"
            ),
            MlErr::ShapeMismatch {
                name,
                got,
                expected,
            } => write!(
                f,
                "Tensor {name} has shape {got:?}, expected {expected:?}"
            ),
            MlErr::MissingEntry(name) => write!(f, "The state dict has no entry named {name}"),
            MlErr::UnsupportedDtype { name, dtype } => {
                write!(f, "Tensor {name} has dtype {dtype}, only F32 is supported")
            }
            MlErr::InvalidConfig(detail) => write!(f, "Invalid model configuration: {detail}"),
            MlErr::SafeTensors(e) => write!(f, "safetensors error: {e}"),
        }
    }
}

impl Error for MlErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MlErr::SafeTensors(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SafeTensorError> for MlErr {
    fn from(value: SafeTensorError) -> Self {
        Self::SafeTensors(value)
    }
}
