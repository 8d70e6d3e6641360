//! Error types for extent and cache operations

use std::sync::Arc;
use thiserror::Error;

/// A fetch failure shared between the fetching caller and every coalesced waiter
pub type SharedError = Arc<anyhow::Error>;

#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("extent {extent} overlaps existing map entry {existing}")]
    Overlap { extent: String, existing: String },

    #[error("disjoint extents: {left} and {right}")]
    Disjoint { left: String, right: String },

    #[error("illegal offset {0}")]
    InvalidOffset(u64),

    #[error("argument(s) out of range: {0}")]
    OutOfRange(String),

    #[error("extent {0} is not representable as a bufferable extent")]
    NotBufferable(String),

    #[error("{extent} not contained within {bounds}")]
    OutOfBounds { extent: String, bounds: String },

    #[error("index {index} out of range (limit {limit})")]
    IndexOutOfRange { index: usize, limit: usize },

    #[error("buffer {0} is read-only")]
    ReadOnly(String),

    #[error("stride must be positive")]
    InvalidStride,

    #[error("fetch failed: {0}")]
    FetchFailed(SharedError),

    #[error("buffer map for version {0} already exists")]
    VersionExists(String),

    #[error("no policy info for {extent} in version {version}")]
    MissingPolicyInfo { version: String, extent: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<toml::de::Error> for CacheError {
    fn from(err: toml::de::Error) -> Self {
        CacheError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
