// crates/core/src/error.rs

use std::path::PathBuf;

use thiserror::Error;

/// Persistence failures. The only error class that escapes the gate.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid capability name '{0}'")]
    InvalidName(String),

    #[error("store I/O failed at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode record for {}: {source}", .path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
