//! Process-edge errors for the catalog binary.

use marquee_core::{MarqueeError, StorageError};
use thiserror::Error;

/// Errors raised while bootstrapping or shutting down the catalog process.
///
/// Everything below the process edge speaks [`MarqueeError`]; this type only
/// adds the failures that can happen around it.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Marquee(#[from] MarqueeError),

    #[error("Failed to initialize tracing: {0}")]
    Telemetry(String),

    #[error("Failed to create connection pool: {0}")]
    Pool(String),

    #[error("Signal handling failed: {0}")]
    Signal(#[from] std::io::Error),
}

impl From<StorageError> for CatalogError {
    fn from(err: StorageError) -> Self {
        CatalogError::Marquee(err.into())
    }
}

pub type CatalogResult<T> = Result<T, CatalogError>;
