//! Error and result types shared by every layer of the index.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while building, persisting or querying a tree.
#[derive(Debug, Error)]
pub enum StrataError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Node address overflow: depth {depth} exceeds the maximum of {max} for {dimensions} dimensions")]
    AddressOverflow {
        depth: u32,
        dimensions: u32,
        max: u32,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No metadata found at {0:?}")]
    MissingMetadata(PathBuf),

    #[error("Cannot save while insertions are in flight")]
    IngestionActive,

    #[error("No branch owns node index {0}")]
    NoOwningBranch(u64),
}

/// Result type for index operations
pub type StrataResult<T> = Result<T, StrataError>;

impl StrataError {
    pub(crate) fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        StrataError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<bincode::error::EncodeError> for StrataError {
    fn from(err: bincode::error::EncodeError) -> Self {
        StrataError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for StrataError {
    fn from(err: bincode::error::DecodeError) -> Self {
        StrataError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::Serialization(err.to_string())
    }
}

/// Attaches a path to a bare `io::Result`.
pub(crate) trait IoContext<T> {
    fn at(self, path: impl AsRef<Path>) -> StrataResult<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: impl AsRef<Path>) -> StrataResult<T> {
        self.map_err(|e| StrataError::io(path, e))
    }
}
