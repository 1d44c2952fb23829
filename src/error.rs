//! Error taxonomy for the tree, storage and metric layers.

use thiserror::Error;

/// Errors surfaced by slimdb operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The object cannot fit in an empty leaf page.
    #[error("object of {size} bytes exceeds maximum insertable size of {max} bytes")]
    ObjectTooLarge { size: usize, max: usize },

    /// Internal inconsistency (bad entry index, negative distance,
    /// non-metric weights). Fatal for the enclosing operation.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Page read/write failure; the enclosing tree operation is aborted.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Bad magic, unsupported geometry or undecodable bytes.
    #[error("format error: {0}")]
    Format(String),
}

pub type Result<T> = std::result::Result<T, Error>;
