//! Append-only transaction log.
//!
//! # Public Types
//!
//! - [`FileLog`]: the log file with its object index
//! - [`TxnRecord`], [`LogRecord`]: transactions and records as read back
//! - [`format`]: the on-disk layout
//!
//! Data records are written through a record copier that replaces payloads
//! already present earlier in the destination by back-pointers, which is what
//! keeps restores and packs from duplicating large states.

mod copier;
mod file_log;
pub mod format;
mod pack;

#[cfg(test)]
mod file_log_tests;

pub use file_log::{CopyStats, FileLog, LogRecord, RecordWrite, TxnIter, TxnMeta, TxnRecord};
pub use format::{RecordData, TxnStatus};
pub use pack::PackStats;
