//! Object cache for `GhostDB`.
//!
//! Keeps a bounded working set of materialized objects and demotes the rest
//! to ghosts:
//! - [`ObjectCache`]: ghost and active maps keyed by object id
//! - [`WeakHandle`]: non-owning entry handle
//! - [`EvictionHook`]: notice sent back to the cache when an object is dropped
//!
//! # Thread-Safety
//!
//! The cache has no internal locks; mutation requires `&mut self`. The owner
//! wraps it in a single `parking_lot::Mutex` (see [`crate::Database`]).
//! Eviction notices arrive over a channel from whichever thread drops the
//! last reference and are applied at the start of the next mutation.

mod object_cache;
mod weak;

pub use object_cache::{CacheStatistics, ObjectCache, ShrinkReport};
pub use weak::{EvictionHook, WeakHandle};

#[cfg(test)]
mod tests;
