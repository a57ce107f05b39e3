use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal, non-retryable configuration defects. None of these leave a partial
/// topology behind.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed property on line {line}: {content:?}")]
    Malformed { line: usize, content: String },

    #[error("node indices must be contiguous from 0, index [{missing}] is missing")]
    NonContiguousIndex { missing: usize },

    #[error("missing required property {0:?}")]
    MissingField(String),

    #[error("property {key:?} has invalid value {value:?}, expected {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("local id {local:?} matches {matches} configured nodes, expected exactly one")]
    LocalNodeUnresolved { local: String, matches: usize },
}
