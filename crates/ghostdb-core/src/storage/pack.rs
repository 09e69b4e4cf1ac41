//! Packing: rewriting a log without revisions superseded before a pack time.

use super::file_log::{FileLog, PendingRecord};
use super::format::TxnStatus;
use crate::error::Result;
use crate::oid::{ObjectId, Tid};
use rustc_hash::{FxHashMap, FxHashSet};
use std::io;
use std::path::Path;
use tracing::info;

/// Counters reported by a pack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackStats {
    /// Transactions written to the packed log.
    pub transactions: usize,
    /// Data records written.
    pub records: usize,
    /// Data records dropped as superseded or uncreated before the pack time.
    pub dropped: usize,
    /// Size of the source log.
    pub bytes_before: u64,
    /// Size of the packed log.
    pub bytes_after: u64,
}

impl FileLog {
    /// Writes a packed copy of this log to `dest`.
    ///
    /// Transactions up to and including `pack_tid` keep only the revision of
    /// each object that was current at `pack_tid`, and are marked packed;
    /// objects uncreated at that point are dropped. Later transactions are
    /// copied unchanged.
    ///
    /// # Errors
    ///
    /// Returns any read or write error; `dest` is then incomplete.
    pub fn pack(&self, pack_tid: Tid, dest: impl AsRef<Path>) -> Result<PackStats> {
        let mut current: FxHashMap<ObjectId, u64> = FxHashMap::default();
        for txn in self.transactions() {
            let txn = txn?;
            if txn.tid > pack_tid {
                break;
            }
            for r in &txn.records {
                current.insert(r.oid, r.pos);
            }
        }

        let mut out = FileLog::create(dest)?.with_sync_on_commit(false);
        let mut written: FxHashSet<Tid> = FxHashSet::default();
        let mut stats = PackStats {
            bytes_before: self.end(),
            ..PackStats::default()
        };

        for txn in self.transactions() {
            let txn = txn?;
            let packed = txn.tid <= pack_tid;
            let kept: Vec<_> = txn
                .records
                .iter()
                .filter(|r| !packed || (current.get(&r.oid) == Some(&r.pos) && r.data.is_some()))
                .map(|r| PendingRecord {
                    oid: r.oid,
                    serial: r.serial,
                    data: r.data.as_deref(),
                    refs: &r.refs,
                    version: r.version.as_deref(),
                    prev_txn: r.data_txn.filter(|t| written.contains(t)),
                })
                .collect();
            stats.dropped += txn.records.len() - kept.len();
            if kept.is_empty() && packed {
                continue;
            }
            let status = if packed { TxnStatus::Packed } else { txn.status };
            out.write_transaction(txn.tid, status, &txn.meta, &kept)?;
            written.insert(txn.tid);
            stats.transactions += 1;
            stats.records += kept.len();
        }

        out.sync()?;
        stats.bytes_after = out.end();
        info!(
            source = %self.path().display(),
            dest = %out.path().display(),
            %pack_tid,
            transactions = stats.transactions,
            records = stats.records,
            dropped = stats.dropped,
            bytes_before = stats.bytes_before,
            bytes_after = stats.bytes_after,
            "packed transaction log"
        );
        Ok(stats)
    }

    /// Packs this log in place, swapping the packed file in atomically.
    ///
    /// # Errors
    ///
    /// See [`Self::pack`]. On failure the original log is left untouched.
    pub fn pack_in_place(&mut self, pack_tid: Tid) -> Result<PackStats> {
        let path = self.path().to_path_buf();
        let tmp = path.with_extension("glog.pack");
        let stats = match self.pack(pack_tid, &tmp) {
            Ok(stats) => stats,
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                return Err(e);
            }
        };
        atomic_replace(&tmp, &path)?;
        let sync = self.sync_on_commit();
        *self = FileLog::open(&path)?.with_sync_on_commit(sync);
        Ok(stats)
    }
}

/// Cross-platform atomic file replacement.
///
/// On Unix, `rename()` atomically replaces the destination.
/// On Windows, `rename()` fails if destination exists, so the destination is
/// moved aside first and restored if the swap fails.
fn atomic_replace(src: &Path, dst: &Path) -> io::Result<()> {
    #[cfg(windows)]
    {
        let backup = dst.with_extension("glog.bak");
        let _ = std::fs::remove_file(&backup);
        if dst.exists() {
            std::fs::rename(dst, &backup)?;
        }
        match std::fs::rename(src, dst) {
            Ok(()) => {
                let _ = std::fs::remove_file(&backup);
                Ok(())
            }
            Err(e) => {
                if backup.exists() {
                    let _ = std::fs::rename(&backup, dst);
                }
                Err(e)
            }
        }
    }

    #[cfg(not(windows))]
    {
        std::fs::rename(src, dst)
    }
}
