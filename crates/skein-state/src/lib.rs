//! skein-state — the shared membership table of a register server.
//!
//! Backed by [redb](https://docs.rs/redb), either on disk or in memory.
//!
//! # Architecture
//!
//! Host records are JSON-serialized into a `&[u8]` value column keyed by
//! `{group}/{id:010}`, so a prefix scan returns one group in id order. A
//! second table maps a connection id to the host key it registered, which
//! makes disconnect handling a point lookup.
//!
//! Every multi-step change (id allocation, soft delete, sweep) runs inside
//! one write transaction through [`StateStore::transact`], so concurrent
//! workers never observe half-applied updates.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{HostTxn, StateStore};
pub use types::*;
