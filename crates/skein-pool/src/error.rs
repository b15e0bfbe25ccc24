//! Error types for the resource pool.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors returned by [`crate::Pool`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    /// Every slot is busy and the wait queue is full. Retry later.
    #[error("pool exhausted: {size} resources busy, {waiting} callers queued")]
    Exhausted { size: usize, waiting: usize },

    #[error("resource creation failed: {0}")]
    Create(String),

    #[error("timed out after {0:?} waiting for a resource")]
    Timeout(Duration),

    #[error("pool is draining")]
    Draining,

    #[error("pool closed")]
    Closed,
}
