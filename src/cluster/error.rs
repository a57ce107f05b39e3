use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;

/// Fatal failures while bringing the clustering runtime up. No retry at this
/// layer; an outer supervisor owns restarts.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("no local node registered")]
    NoLocalNode,

    #[error("no metadata directory configured")]
    NoMetadataDir,

    #[error("could not create metadata directory {path:?}: {source}")]
    MetadataDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not bind cluster listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("could not build cluster runtime: {0}")]
    Runtime(#[source] io::Error),
}

/// Replicated map failures. `Replica` covers the transient coordination
/// errors the map retries internally; everything else surfaces immediately.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cluster runtime is not started")]
    RuntimeNotStarted,

    #[error("key of {len} bytes exceeds the {max} byte limit")]
    KeyTooLarge { len: usize, max: usize },

    #[error("store lock poisoned by an earlier panic")]
    LockPoisoned,

    #[error("value codec failure: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("replica write failed: {0}")]
    Replica(#[source] io::Error),

    #[error("store log {path:?} is corrupted: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("write failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<StoreError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Only replica coordination failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Replica(_))
    }
}

/// Umbrella error for the one-shot context pipeline.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
