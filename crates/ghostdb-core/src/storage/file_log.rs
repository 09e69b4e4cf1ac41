//! Append-only transaction log file.
//!
//! A [`FileLog`] keeps an in-memory index from object id to the offset of its
//! latest data record, rebuilt by scanning the file on open. Transactions are
//! written with status `'c'`, flushed, then flipped to `' '`; a tail left in
//! `'c'` (or cut short) by a crash is truncated on the next open.

use super::copier::{CopiedTransaction, Destination, RecordCopier};
use super::format::{
    check_file_header, encode_file_header, read_at, read_data_header, read_data_record,
    read_txn_header, read_u64_at, DataRecord, RecordData, TxnHeader, TxnStatus, FILE_HEADER_LEN,
    TRAILER_LEN, TXN_HEADER_LEN,
};
use crate::conflict::SerialLoader;
use crate::error::{Error, Result};
use crate::oid::{ObjectId, Serial, Tid};
use rustc_hash::FxHashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Maximum back-pointer hops followed before a chain is declared corrupt.
const MAX_BACK_POINTER_HOPS: usize = 1024;

/// User, description and extension of a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnMeta {
    /// Who committed the transaction.
    pub user: String,
    /// Free-form description.
    pub description: String,
    /// Opaque extension bytes.
    pub extension: Vec<u8>,
}

impl TxnMeta {
    /// Metadata with a user and description and no extension.
    #[must_use]
    pub fn new(user: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            description: description.into(),
            extension: Vec::new(),
        }
    }

    fn lengths(&self) -> Result<(u16, u16, u16)> {
        let fit = |len: usize, what: &str| {
            u16::try_from(len).map_err(|_| Error::Storage(format!("{what} too long: {len} bytes")))
        };
        Ok((
            fit(self.user.len(), "user")?,
            fit(self.description.len(), "description")?,
            fit(self.extension.len(), "extension")?,
        ))
    }
}

/// One object revision to append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordWrite {
    /// Object written.
    pub oid: ObjectId,
    /// Encoded state; `None` uncreates the object.
    pub data: Option<Vec<u8>>,
    /// Objects referenced by the state.
    pub refs: Vec<ObjectId>,
    /// Named version, if any.
    pub version: Option<String>,
}

impl RecordWrite {
    /// A non-version store of `data`.
    #[must_use]
    pub fn store(oid: ObjectId, data: Vec<u8>, refs: Vec<ObjectId>) -> Self {
        Self {
            oid,
            data: Some(data),
            refs,
            version: None,
        }
    }

    /// A non-version uncreation.
    #[must_use]
    pub fn uncreate(oid: ObjectId) -> Self {
        Self {
            oid,
            data: None,
            refs: Vec::new(),
            version: None,
        }
    }
}

/// A data record as seen by a reader, with back-pointers resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Object the record belongs to.
    pub oid: ObjectId,
    /// Tid of the transaction that wrote the revision.
    pub serial: Serial,
    /// Offset of the record.
    pub pos: u64,
    /// Version name, if any.
    pub version: Option<String>,
    /// References of the resolved payload.
    pub refs: Vec<ObjectId>,
    /// Resolved payload; `None` for an uncreation.
    pub data: Option<Vec<u8>>,
    /// Tid of the transaction that stores the payload, when the record is a
    /// back-pointer.
    pub data_txn: Option<Tid>,
}

/// A committed transaction as seen by a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnRecord {
    /// Transaction id.
    pub tid: Tid,
    /// Commit status.
    pub status: TxnStatus,
    /// Offset of the transaction header.
    pub pos: u64,
    /// User, description and extension.
    pub meta: TxnMeta,
    /// Data records in file order.
    pub records: Vec<LogRecord>,
}

/// Counters reported by [`FileLog::copy_transactions_from`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    /// Transactions written.
    pub transactions: usize,
    /// Data records written.
    pub records: usize,
    /// Records written as back-pointers instead of payload copies.
    pub back_pointers: usize,
}

/// A record queued for [`FileLog::write_transaction`].
pub(crate) struct PendingRecord<'r> {
    pub oid: ObjectId,
    pub serial: Serial,
    pub data: Option<&'r [u8]>,
    pub refs: &'r [ObjectId],
    pub version: Option<&'r str>,
    pub prev_txn: Option<Tid>,
}

/// Append-only transaction log.
pub struct FileLog {
    path: PathBuf,
    file: File,
    end: u64,
    last_tid: Tid,
    index: FxHashMap<ObjectId, u64>,
    vindex: FxHashMap<String, u64>,
    sync_on_commit: bool,
}

impl FileLog {
    /// Creates a new, empty log at `path`, replacing any existing file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let mut header = Vec::with_capacity(FILE_HEADER_LEN as usize);
        encode_file_header(&mut header);
        file.write_all(&header)?;
        file.sync_all()?;
        debug!(path = %path.display(), "created transaction log");

        Ok(Self {
            path,
            file,
            end: FILE_HEADER_LEN,
            last_tid: Tid::ZERO,
            index: FxHashMap::default(),
            vindex: FxHashMap::default(),
            sync_on_commit: true,
        })
    }

    /// Opens an existing log, rebuilding the index.
    ///
    /// An incomplete trailing transaction is truncated with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptRecord`] if committed data is malformed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_len = file.metadata()?.len();

        let header = read_at(&mut file, 0, FILE_HEADER_LEN, "file header")?;
        let mut fixed = [0u8; FILE_HEADER_LEN as usize];
        fixed.copy_from_slice(&header);
        check_file_header(&fixed)?;

        let mut log = Self {
            path,
            file,
            end: FILE_HEADER_LEN,
            last_tid: Tid::ZERO,
            index: FxHashMap::default(),
            vindex: FxHashMap::default(),
            sync_on_commit: true,
        };
        log.scan(file_len)?;
        Ok(log)
    }

    /// Creates the log if `path` does not exist, opens it otherwise.
    ///
    /// # Errors
    ///
    /// See [`Self::create`] and [`Self::open`].
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    /// Sets whether commits are fsynced.
    #[must_use]
    pub fn with_sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    /// Whether commits are fsynced.
    #[must_use]
    pub fn sync_on_commit(&self) -> bool {
        self.sync_on_commit
    }

    /// Flushes file contents and metadata to disk.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the sync fails.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn scan(&mut self, file_len: u64) -> Result<()> {
        let mut pos = FILE_HEADER_LEN;
        while pos < file_len {
            let Some(header) = self.check_txn_at(pos, file_len)? else {
                warn!(
                    path = %self.path.display(),
                    offset = pos,
                    dropped = file_len - pos,
                    "truncating incomplete transaction at end of log"
                );
                self.file.set_len(pos)?;
                self.file.sync_all()?;
                break;
            };
            if header.tid <= self.last_tid {
                return Err(Error::corrupt(
                    pos,
                    format!("transaction {} not after {}", header.tid, self.last_tid),
                ));
            }

            let txn_end = pos + header.tlen;
            let mut rpos = pos + header.header_len();
            while rpos < txn_end {
                let record = read_data_record(&mut self.file, rpos)?;
                if record.txn_pos != pos {
                    return Err(Error::corrupt(rpos, "record belongs to another transaction"));
                }
                if let Some(v) = &record.version {
                    self.vindex.insert(v.name.clone(), rpos);
                }
                self.index.insert(record.oid, rpos);
                rpos += record.encoded_len();
            }
            if rpos != txn_end {
                return Err(Error::corrupt(rpos, "data records overrun transaction"));
            }

            self.last_tid = header.tid;
            pos = txn_end + TRAILER_LEN;
        }
        self.end = pos.min(file_len).max(FILE_HEADER_LEN);
        debug!(
            path = %self.path.display(),
            objects = self.index.len(),
            end = self.end,
            "scanned transaction log"
        );
        Ok(())
    }

    /// Validates the transaction at `pos`. `None` means an incomplete tail.
    fn check_txn_at(&mut self, pos: u64, file_len: u64) -> Result<Option<TxnHeader>> {
        if file_len - pos < TXN_HEADER_LEN {
            return Ok(None);
        }
        let fixed = read_at(&mut self.file, pos, TXN_HEADER_LEN, "transaction header")?;
        let header = TxnHeader::decode(&fixed, pos)?;
        if header.tlen < header.header_len() {
            return Err(Error::corrupt(pos, "transaction length shorter than header"));
        }
        let complete = pos
            .checked_add(header.tlen)
            .and_then(|e| e.checked_add(TRAILER_LEN))
            .is_some_and(|e| e <= file_len);
        if !complete {
            return Ok(None);
        }
        if !header.status.is_committed() {
            if pos + header.tlen + TRAILER_LEN < file_len {
                return Err(Error::corrupt(pos + 16, "uncommitted transaction before end of log"));
            }
            return Ok(None);
        }
        let trailer = read_u64_at(&mut self.file, pos + header.tlen, "transaction trailer")?;
        if trailer != header.tlen {
            return Err(Error::corrupt(
                pos + header.tlen,
                format!("trailer {trailer} does not match length {}", header.tlen),
            ));
        }
        Ok(Some(header))
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// End offset of the last committed transaction.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Tid of the last committed transaction.
    #[must_use]
    pub fn last_tid(&self) -> Tid {
        self.last_tid
    }

    /// Number of objects with at least one record.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.index.len()
    }

    /// Ids of all objects with at least one record, sorted.
    #[must_use]
    pub fn object_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<_> = self.index.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    // =====================================================================
    // Writes
    // =====================================================================

    /// Appends a transaction of new records and returns its tid.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRecord`] if an object appears twice, or an
    /// I/O error; on failure the file is truncated back to its previous end.
    pub fn append(&mut self, meta: &TxnMeta, writes: &[RecordWrite]) -> Result<Tid> {
        let tid = Tid::after(self.last_tid);
        let pending: Vec<_> = writes
            .iter()
            .map(|w| PendingRecord {
                oid: w.oid,
                serial: tid,
                data: w.data.as_deref(),
                refs: &w.refs,
                version: w.version.as_deref(),
                prev_txn: None,
            })
            .collect();
        self.write_transaction(tid, TxnStatus::Committed, meta, &pending)?;
        Ok(tid)
    }

    /// Writes one transaction through the record copier.
    pub(crate) fn write_transaction(
        &mut self,
        tid: Tid,
        status: TxnStatus,
        meta: &TxnMeta,
        records: &[PendingRecord<'_>],
    ) -> Result<CopiedTransaction> {
        if tid <= self.last_tid {
            return Err(Error::Storage(format!(
                "transaction {tid} not after last transaction {}",
                self.last_tid
            )));
        }
        let (ulen, dlen, elen) = meta.lengths()?;
        let txn_pos = self.end;
        let mut header = TxnHeader {
            tid,
            tlen: 0,
            status: TxnStatus::Committing,
            ulen,
            dlen,
            elen,
        };
        let header_len = header.header_len();

        let mut copier = RecordCopier::new(self.destination());
        for r in records {
            let data_pos = txn_pos + header_len + copier.pending_len();
            copier.copy(
                r.oid, r.serial, r.data, r.refs, r.version, r.prev_txn, txn_pos, data_pos,
            )?;
        }
        let copied = copier.finish();
        header.tlen = header_len + copied.body.len() as u64;

        let mut buf = Vec::with_capacity((header.tlen + TRAILER_LEN) as usize);
        header.encode(&mut buf);
        buf.extend_from_slice(meta.user.as_bytes());
        buf.extend_from_slice(meta.description.as_bytes());
        buf.extend_from_slice(&meta.extension);
        buf.extend_from_slice(&copied.body);
        buf.extend_from_slice(&header.tlen.to_be_bytes());

        if let Err(e) = self.commit_bytes(txn_pos, &buf, status) {
            if let Err(trunc) = self.file.set_len(txn_pos) {
                warn!(offset = txn_pos, error = %trunc, "failed to truncate after write error");
            }
            return Err(e);
        }

        self.index
            .extend(copied.tindex.iter().map(|(oid, pos)| (*oid, *pos)));
        self.vindex
            .extend(copied.tvindex.iter().map(|(v, pos)| (v.clone(), *pos)));
        self.end = txn_pos + header.tlen + TRAILER_LEN;
        self.last_tid = tid;
        debug!(%tid, records = records.len(), bytes = buf.len(), "committed transaction");
        Ok(copied)
    }

    /// Committed state seen by a record copier.
    pub(crate) fn destination(&self) -> Destination<'_> {
        Destination {
            file: &self.file,
            end: self.end,
            index: &self.index,
            vindex: &self.vindex,
        }
    }

    fn commit_bytes(&mut self, txn_pos: u64, buf: &[u8], status: TxnStatus) -> Result<()> {
        self.file.seek(SeekFrom::Start(txn_pos))?;
        self.file.write_all(buf)?;
        if self.sync_on_commit {
            self.file.sync_data()?;
        }
        self.file.seek(SeekFrom::Start(txn_pos + 16))?;
        self.file.write_all(&[status.as_byte()])?;
        if self.sync_on_commit {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Restores every transaction of `source` into this log.
    ///
    /// Payloads already present in an earlier restored transaction are
    /// written as back-pointers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if a source tid is not after this log's last
    /// tid, or any read/write error. The log keeps every transaction
    /// committed before the failure.
    pub fn copy_transactions_from(&mut self, source: &FileLog) -> Result<CopyStats> {
        let mut stats = CopyStats::default();
        for txn in source.transactions() {
            let txn = txn?;
            let pending: Vec<_> = txn
                .records
                .iter()
                .map(|r| PendingRecord {
                    oid: r.oid,
                    serial: r.serial,
                    data: r.data.as_deref(),
                    refs: &r.refs,
                    version: r.version.as_deref(),
                    prev_txn: r.data_txn,
                })
                .collect();
            let copied = self.write_transaction(txn.tid, txn.status, &txn.meta, &pending)?;
            stats.transactions += 1;
            stats.records += pending.len();
            stats.back_pointers += copied.back_pointers;
        }
        info!(
            source = %source.path().display(),
            dest = %self.path.display(),
            transactions = stats.transactions,
            records = stats.records,
            back_pointers = stats.back_pointers,
            "restored transactions"
        );
        Ok(stats)
    }

    // =====================================================================
    // Reads
    // =====================================================================

    /// Iterates committed transactions in file order.
    #[must_use]
    pub fn transactions(&self) -> TxnIter<'_> {
        TxnIter {
            log: self,
            pos: FILE_HEADER_LEN,
        }
    }

    /// Reads the transaction at `pos` and returns it with the offset of the
    /// next one.
    fn read_transaction(&self, pos: u64) -> Result<(TxnRecord, u64)> {
        let mut file = &self.file;
        let (header, meta_bytes) = read_txn_header(&mut file, pos)?;
        let meta = decode_meta(&header, &meta_bytes, pos)?;

        let txn_end = pos + header.tlen;
        let mut records = Vec::new();
        let mut rpos = pos + header.header_len();
        while rpos < txn_end {
            let record = read_data_record(&mut file, rpos)?;
            let len = record.encoded_len();
            records.push(self.resolve_record(record, rpos)?);
            rpos += len;
        }
        let txn = TxnRecord {
            tid: header.tid,
            status: header.status,
            pos,
            meta,
            records,
        };
        Ok((txn, txn_end + TRAILER_LEN))
    }

    fn resolve_record(&self, record: DataRecord, pos: u64) -> Result<LogRecord> {
        let is_back_pointer = matches!(record.data, RecordData::BackPointer(_));
        let (target, target_pos) = self.follow_back_pointers(record.clone(), pos)?;
        let data_txn = if is_back_pointer {
            let mut file = &self.file;
            Some(Tid(read_u64_at(&mut file, target.txn_pos, "transaction id")?))
        } else {
            None
        };
        let (data, refs) = match target.data {
            RecordData::Payload(bytes) => (Some(bytes), target.refs),
            RecordData::Uncreation => (None, Vec::new()),
            RecordData::BackPointer(_) => {
                return Err(Error::corrupt(target_pos, "unresolved back-pointer"));
            }
        };
        Ok(LogRecord {
            oid: record.oid,
            serial: record.serial,
            pos,
            version: record.version.map(|v| v.name),
            refs,
            data,
            data_txn,
        })
    }

    /// Follows back-pointers from `record` to the record holding its data.
    fn follow_back_pointers(
        &self,
        mut record: DataRecord,
        mut pos: u64,
    ) -> Result<(DataRecord, u64)> {
        let mut file = &self.file;
        for _ in 0..MAX_BACK_POINTER_HOPS {
            let RecordData::BackPointer(bp) = record.data else {
                return Ok((record, pos));
            };
            let target = read_data_record(&mut file, bp)?;
            if target.oid != record.oid {
                return Err(Error::corrupt(
                    pos,
                    format!("back-pointer {bp} targets object {}", target.oid),
                ));
            }
            record = target;
            pos = bp;
        }
        Err(Error::corrupt(pos, "back-pointer chain too long"))
    }

    /// Loads the latest state of `oid` and its serial.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ObjectNotFound`] if the object has no record or its
    /// latest record is an uncreation.
    pub fn load(&self, oid: ObjectId) -> Result<(Vec<u8>, Serial)> {
        let pos = *self.index.get(&oid).ok_or(Error::ObjectNotFound(oid))?;
        let mut file = &self.file;
        let record = read_data_record(&mut file, pos)?;
        let serial = record.serial;
        match self.follow_back_pointers(record, pos)?.0.data {
            RecordData::Payload(bytes) => Ok((bytes, serial)),
            _ => Err(Error::ObjectNotFound(oid)),
        }
    }

    /// Serial of the latest record of `oid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record header cannot be read.
    pub fn last_serial(&self, oid: ObjectId) -> Result<Option<Serial>> {
        let Some(&pos) = self.index.get(&oid) else {
            return Ok(None);
        };
        let mut file = &self.file;
        Ok(Some(read_data_header(&mut file, pos)?.serial))
    }

    /// Walks the record chain of `oid` back to the revision written by
    /// `serial`.
    fn find_revision(&self, oid: ObjectId, serial: Serial) -> Result<(DataRecord, u64)> {
        let mut pos = *self.index.get(&oid).ok_or(Error::ObjectNotFound(oid))?;
        let mut file = &self.file;
        while pos != 0 {
            let record = read_data_record(&mut file, pos)?;
            if record.oid != oid {
                return Err(Error::corrupt(pos, format!("record chain of {oid} crosses objects")));
            }
            if record.serial == serial {
                return Ok((record, pos));
            }
            if record.serial < serial || record.prev >= pos {
                break;
            }
            pos = record.prev;
        }
        Err(Error::RevisionNotFound { oid, serial })
    }

    /// Loads the state of `oid` as written by `serial`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RevisionNotFound`] if no such revision exists or it
    /// is an uncreation.
    pub fn load_serial(&self, oid: ObjectId, serial: Serial) -> Result<Vec<u8>> {
        let (record, pos) = self.find_revision(oid, serial)?;
        match self.follow_back_pointers(record, pos)?.0.data {
            RecordData::Payload(bytes) => Ok(bytes),
            _ => Err(Error::RevisionNotFound { oid, serial }),
        }
    }
}

impl SerialLoader for FileLog {
    fn load_serial(&self, oid: ObjectId, serial: Serial) -> Result<Vec<u8>> {
        FileLog::load_serial(self, oid, serial)
    }
}

impl std::fmt::Debug for FileLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLog")
            .field("path", &self.path)
            .field("end", &self.end)
            .field("last_tid", &self.last_tid)
            .field("objects", &self.index.len())
            .finish_non_exhaustive()
    }
}

/// Iterator over committed transactions.
pub struct TxnIter<'a> {
    log: &'a FileLog,
    pos: u64,
}

impl Iterator for TxnIter<'_> {
    type Item = Result<TxnRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.log.end {
            return None;
        }
        match self.log.read_transaction(self.pos) {
            Ok((txn, next)) => {
                self.pos = next;
                Some(Ok(txn))
            }
            Err(e) => {
                self.pos = self.log.end;
                Some(Err(e))
            }
        }
    }
}

fn decode_meta(header: &TxnHeader, bytes: &[u8], pos: u64) -> Result<TxnMeta> {
    let (user, rest) = bytes.split_at(usize::from(header.ulen));
    let (description, extension) = rest.split_at(usize::from(header.dlen));
    let text = |b: &[u8], what: &str| {
        String::from_utf8(b.to_vec())
            .map_err(|_| Error::corrupt(pos + TXN_HEADER_LEN, format!("{what} is not UTF-8")))
    };
    Ok(TxnMeta {
        user: text(user, "user")?,
        description: text(description, "description")?,
        extension: extension.to_vec(),
    })
}
