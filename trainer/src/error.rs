use std::{error::Error, fmt, io, path::PathBuf};

use machine_learning::MlErr;

/// The trainer module's result type.
pub type Result<T> = std::result::Result<T, TrainErr>;

/// Training runtime failures.
#[derive(Debug)]
pub enum TrainErr {
    Io(io::Error),
    Json(serde_json::Error),
    Ml(MlErr),
    Image(image::ImageError),
    Http(reqwest::Error),
    Task(tokio::task::JoinError),
    /// A checkpoint artifact required to resume is absent.
    MissingCheckpoint(PathBuf),
    /// A key was fetched that no rank will ever publish.
    MissingKey(String),
    UnexpectedMessage {
        expected: &'static str,
        got: String,
    },
    Store(String),
    Tracker {
        operation: &'static str,
        status: u16,
        body: String,
    },
    InvalidConfig(String),
    Dataset(String),
}

impl fmt::Display for TrainErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainErr::Io(e) => write!(f, "io error: {e}"),
            TrainErr::Json(e) => write!(f, "json error: {e}"),
            TrainErr::Ml(e) => write!(f, "model error: {e}"),
            TrainErr::Image(e) => write!(f, "image error: {e}"),
            TrainErr::Http(e) => write!(f, "http error: {e}"),
            TrainErr::Task(e) => write!(f, "background task failed: {e}"),
            TrainErr::MissingCheckpoint(path) => {
                write!(f, "cannot resume, missing checkpoint file {}", path.display())
            }
            TrainErr::MissingKey(key) => write!(f, "key {key:?} was never published"),
            TrainErr::UnexpectedMessage { expected, got } => {
                write!(f, "unexpected message: expected {expected}, got {got}")
            }
            TrainErr::Store(e) => write!(f, "store error: {e}"),
            TrainErr::Tracker {
                operation,
                status,
                body,
            } => write!(f, "tracker {operation} failed with status {status}: {body}"),
            TrainErr::InvalidConfig(e) => write!(f, "invalid configuration: {e}"),
            TrainErr::Dataset(e) => write!(f, "dataset error: {e}"),
        }
    }
}

impl Error for TrainErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrainErr::Io(e) => Some(e),
            TrainErr::Json(e) => Some(e),
            TrainErr::Ml(e) => Some(e),
            TrainErr::Image(e) => Some(e),
            TrainErr::Http(e) => Some(e),
            TrainErr::Task(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TrainErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for TrainErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<MlErr> for TrainErr {
    fn from(value: MlErr) -> Self {
        Self::Ml(value)
    }
}

impl From<image::ImageError> for TrainErr {
    fn from(value: image::ImageError) -> Self {
        Self::Image(value)
    }
}

impl From<reqwest::Error> for TrainErr {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value)
    }
}

impl From<tokio::task::JoinError> for TrainErr {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::Task(value)
    }
}
