use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("block {block_id} corrupt: {reason}")]
    Corrupt { block_id: u32, reason: String },
    #[error("block {block_id} not found")]
    BlockNotFound { block_id: u32 },
    #[error("label space exhausted: all 255 distinct labels already assigned")]
    LabelSpaceExhausted,
    #[error("vertex space exhausted: u32 id range already assigned")]
    VertexSpaceExhausted,
    #[error("memory limit exceeded: {used_mb} MiB used of {limit_mb} MiB")]
    MemoryLimitExceeded { used_mb: u64, limit_mb: u64 },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GraphError {
    /// Wraps an `io::Error` with the path the failing operation touched.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        GraphError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn corrupt(block_id: u32, reason: impl Into<String>) -> Self {
        GraphError::Corrupt {
            block_id,
            reason: reason.into(),
        }
    }
}
