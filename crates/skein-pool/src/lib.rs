//! skein-pool — bounded pool of asynchronously created resources.
//!
//! A [`Pool`] owns at most `size` resources. Callers [`Pool::request`] a
//! resource and receive a [`Pending`] future that resolves to a [`Lease`].
//! Dropping the lease hands the resource back to the pool, where the
//! oldest queued caller picks it up.
//!
//! # Architecture
//!
//! ```text
//! request()
//!   → enqueue caller (FIFO)
//!     → idle resource available  → hand over head-of-idle (stale entries skipped)
//!     → below size cap           → Manager::create() on a spawned task
//!     → at cap, queue full       → PoolError::Exhausted (caller retries)
//!
//! Lease dropped
//!   → Manager::on_release() ok   → back to idle, serve next queued caller
//!   → removed / rejected         → Manager::close(), slot freed
//! ```
//!
//! Resource creation is delegated to an injected [`Manager`], which is
//! how database and socket pools plug their connect/ping/close strategy
//! into the generic pool.

pub mod error;
pub mod manager;
pub mod pool;

pub use error::{PoolError, PoolResult};
pub use manager::Manager;
pub use pool::{Lease, Pending, Pool, PoolConfig, PoolStats, ResourceId};
