//! Relocation of data records into a destination log.
//!
//! The copier builds the body of one destination transaction. Records whose
//! payload already exists in an earlier destination transaction are written
//! as back-pointers to that copy instead of duplicating the bytes.

use super::format::{
    read_at, read_data_header, read_txn_header, read_u64_at, DataRecord, RecordData, VersionInfo,
    DATA_HEADER_LEN, FILE_HEADER_LEN, TRAILER_LEN,
};
use crate::error::{Error, Result};
use crate::oid::{ObjectId, Tid};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fs::File;
use tracing::warn;

/// Committed state of the destination log the copier reads from.
#[derive(Clone, Copy)]
pub(crate) struct Destination<'a> {
    /// Destination file; only committed bytes are read.
    pub file: &'a File,
    /// End of the last committed transaction.
    pub end: u64,
    /// Latest record offset per object.
    pub index: &'a FxHashMap<ObjectId, u64>,
    /// Latest record offset per version.
    pub vindex: &'a FxHashMap<String, u64>,
}

/// Output of one copier pass.
#[derive(Debug, Default)]
pub(crate) struct CopiedTransaction {
    /// Encoded data records.
    pub body: Vec<u8>,
    /// Record offset per object written in this pass.
    pub tindex: FxHashMap<ObjectId, u64>,
    /// Last record offset per version written in this pass.
    pub tvindex: FxHashMap<String, u64>,
    /// Records written as back-pointers.
    pub back_pointers: usize,
}

/// Writes the data records of one destination transaction.
pub(crate) struct RecordCopier<'a> {
    dest: Destination<'a>,
    out: CopiedTransaction,
    written: FxHashSet<ObjectId>,
}

impl<'a> RecordCopier<'a> {
    pub(crate) fn new(dest: Destination<'a>) -> Self {
        Self {
            dest,
            out: CopiedTransaction::default(),
            written: FxHashSet::default(),
        }
    }

    /// Bytes buffered so far.
    pub(crate) fn pending_len(&self) -> u64 {
        self.out.body.len() as u64
    }

    /// Appends one data record.
    ///
    /// `data` of `None` (or empty) writes an uncreation. When `prev_txn` is
    /// given and the destination transaction with that id holds an identical
    /// payload for `oid`, a back-pointer to it is written instead of the
    /// bytes. `data_pos` must be the offset this record will occupy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRecord`] if `oid` was already written in this
    /// pass and [`Error::CorruptRecord`] if `prev_txn` is not in the
    /// destination or a header cannot be read.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn copy(
        &mut self,
        oid: ObjectId,
        serial: Tid,
        data: Option<&[u8]>,
        refs: &[ObjectId],
        version: Option<&str>,
        prev_txn: Option<Tid>,
        txn_pos: u64,
        data_pos: u64,
    ) -> Result<()> {
        if !self.written.insert(oid) {
            return Err(Error::DuplicateRecord(oid));
        }

        let data = data.filter(|d| !d.is_empty());
        let prev_pos = match (prev_txn, data) {
            (Some(tid), Some(bytes)) => {
                let txn_start = self.find_txn(tid)?;
                self.find_data(txn_start, oid, bytes)?
            }
            _ => None,
        };
        let old = self.dest.index.get(&oid).copied().unwrap_or(0);

        let version = match version.filter(|v| !v.is_empty()) {
            Some(name) => {
                let pnv = self.restore_pnv(oid, old, prev_pos)?.unwrap_or(old);
                let vprev = self
                    .out
                    .tvindex
                    .get(name)
                    .or_else(|| self.dest.vindex.get(name))
                    .copied()
                    .unwrap_or(0);
                self.out.tvindex.insert(name.to_string(), data_pos);
                Some(VersionInfo {
                    pnv,
                    vprev,
                    name: name.to_string(),
                })
            }
            None => None,
        };

        let (data, refs) = match (prev_pos, data) {
            (Some(pos), _) => {
                self.out.back_pointers += 1;
                (RecordData::BackPointer(pos), Vec::new())
            }
            (None, Some(bytes)) => (RecordData::Payload(bytes.to_vec()), refs.to_vec()),
            (None, None) => (RecordData::Uncreation, Vec::new()),
        };

        let record = DataRecord {
            oid,
            serial,
            prev: old,
            txn_pos,
            version,
            refs,
            data,
        };
        record.encode(&mut self.out.body)?;
        self.out.tindex.insert(oid, data_pos);
        Ok(())
    }

    /// Finishes the pass.
    pub(crate) fn finish(self) -> CopiedTransaction {
        self.out
    }

    /// Locates the destination transaction `tid` by walking backwards over
    /// the trailing lengths.
    fn find_txn(&self, tid: Tid) -> Result<u64> {
        let mut file = self.dest.file;
        let mut pos = self.dest.end;
        while pos > FILE_HEADER_LEN {
            let tlen = read_u64_at(&mut file, pos - TRAILER_LEN, "transaction trailer")?;
            let start = tlen
                .checked_add(TRAILER_LEN)
                .and_then(|n| pos.checked_sub(n))
                .filter(|s| *s >= FILE_HEADER_LEN)
                .ok_or_else(|| {
                    Error::corrupt(pos - TRAILER_LEN, "transaction length overruns file start")
                })?;
            let found = Tid(read_u64_at(&mut file, start, "transaction id")?);
            if found == tid {
                return Ok(start);
            }
            if found < tid {
                break;
            }
            pos = start;
        }
        Err(Error::corrupt(
            self.dest.end,
            format!("transaction {tid} not found in destination"),
        ))
    }

    /// Looks for a record of `oid` in the transaction at `txn_start` whose
    /// payload equals `data`. A record that is itself a back-pointer is
    /// trusted.
    fn find_data(&self, txn_start: u64, oid: ObjectId, data: &[u8]) -> Result<Option<u64>> {
        let mut file = self.dest.file;
        let (header, _) = read_txn_header(&mut file, txn_start)?;
        let txn_end = txn_start + header.tlen;
        let mut pos = txn_start + header.header_len();
        while pos < txn_end {
            let h = read_data_header(&mut file, pos)?;
            if h.oid == oid {
                if h.plen == 0 {
                    let bp = read_u64_at(&mut file, pos + h.payload_offset(), "back-pointer")?;
                    return Ok((bp != 0).then_some(pos));
                }
                if h.plen != data.len() as u64 {
                    warn!(%oid, pos, "payload length differs from back-pointer candidate");
                    return Ok(None);
                }
                let stored = read_at(&mut file, pos + h.payload_offset(), h.plen, "payload")?;
                return Ok((stored == data).then_some(pos));
            }
            pos += h.record_len();
        }
        Ok(None)
    }

    /// Previous-non-version pointer inherited from the record at `prev`.
    ///
    /// When `prev` is not a version record but this record back-points at
    /// `bp`, the record undoes a version abort or commit and the pointer
    /// comes from the version record at `bp`.
    fn restore_pnv(&self, oid: ObjectId, prev: u64, bp: Option<u64>) -> Result<Option<u64>> {
        if prev == 0 {
            return Ok(None);
        }
        let mut file = self.dest.file;
        let h = read_data_header(&mut file, prev)?;
        if h.vlen > 0 {
            return Ok(Some(read_u64_at(&mut file, prev + DATA_HEADER_LEN, "pnv")?));
        }
        let Some(bp) = bp else {
            return Ok(None);
        };
        let target = read_data_header(&mut file, bp)?;
        if target.vlen > 0 {
            return Ok(Some(read_u64_at(&mut file, bp + DATA_HEADER_LEN, "pnv")?));
        }
        warn!(%oid, prev, bp, "no previous-non-version data at predecessor or back-pointer");
        Ok(None)
    }
}
