//! Error types for the svogi core

use thiserror::Error;

/// Main error type for the GI core.
///
/// `Corrupt` is the fatal class: short reads, decompression failures and
/// out-of-range sizes in persisted data. These are never retried; worker
/// threads route them through the streaming completion queue so they surface
/// from the per-frame update instead of vanishing.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("data corruption: {0}")]
    Corrupt(String),

    #[error("streaming error: {0}")]
    Streaming(String),

    #[error("tree error: {0}")]
    Tree(String),
}
