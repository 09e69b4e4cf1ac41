//! # `GhostDB` Core
//!
//! In-process object database built from three pieces:
//!
//! - **Object cache**: ghost and active maps keyed by object id, holding weak
//!   handles only. A shrink pass ghostifies least-recently-used and idle
//!   objects so the working set stays bounded.
//! - **Conflict resolution**: when a commit is based on a stale revision, the
//!   class's registered merge strategy combines the base, committed and new
//!   states instead of failing the transaction.
//! - **Transaction log**: an append-only file of committed transactions with
//!   a record copier that preserves back-pointers, used for log copying and
//!   packing.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ghostdb_core::{CounterMerge, Database, GhostConfig};
//! use serde_json::json;
//!
//! let db = Database::open(GhostConfig::load()?)?;
//! db.registry().register("PageViews", CounterMerge::new(["hits"]));
//!
//! let page = db.create("PageViews", json!({ "hits": 0 }))?;
//! page.set_state_data(json!({ "hits": 1 }))?;
//! db.commit(&page)?;
//!
//! // Ghostify whatever exceeds the configured working set.
//! let report = db.shrink_cache();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// =============================================================================
// NUMERIC CAST LINTS
// =============================================================================
// Log offsets and lengths are u64 on disk and usize in memory; the format
// module bounds-checks before casting.
// =============================================================================
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_lossless)]
// =============================================================================
// STYLISTIC LINTS - Safe to allow globally (no bug risk)
// =============================================================================
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::redundant_pub_crate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod cache;
pub mod clock;
pub mod codec;
pub mod config;
pub mod conflict;
mod database;
pub mod error;
pub mod oid;
pub mod persistent;
#[cfg(test)]
mod persistent_tests;
pub mod storage;

pub use cache::{CacheStatistics, ObjectCache, ShrinkReport};
pub use clock::{DayClock, ManualDayClock, SystemDayClock};
pub use config::{ConfigError, GhostConfig};
pub use conflict::{
    ConflictMergeable, ConflictResolver, CounterMerge, MergeError, MergeRegistry, MergeStrategy,
    SerialLoader, ThreeWayMerge,
};
pub use database::{Database, StoreOutcome};
pub use error::{ConflictReason, Error, Result};
pub use oid::{ObjectId, Serial, Tid};
pub use persistent::{ObjectState, Persistent, PersistentObject};
pub use storage::{FileLog, PackStats, RecordWrite, TxnMeta};
