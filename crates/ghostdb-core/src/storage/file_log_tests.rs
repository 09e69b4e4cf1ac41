//! Tests for the transaction log file.

use super::file_log::{FileLog, PendingRecord, RecordWrite, TxnMeta};
use super::format::TxnStatus;
use crate::conflict::SerialLoader;
use crate::error::Error;
use crate::oid::{ObjectId, Tid};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tempfile::TempDir;

// -------------------------------------------------------------------------
// Helpers
// -------------------------------------------------------------------------

fn log_path(dir: &TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

fn store(oid: u64, data: &[u8]) -> RecordWrite {
    RecordWrite::store(ObjectId(oid), data.to_vec(), vec![])
}

fn meta() -> TxnMeta {
    TxnMeta::new("alice", "test commit")
}

/// Log with three transactions: oid 1 at v1/v2/v3, oid 2 created in the first.
fn sample_log(dir: &TempDir) -> (FileLog, [Tid; 3]) {
    let mut log = FileLog::create(log_path(dir, "sample.glog")).unwrap();
    let t1 = log.append(&meta(), &[store(1, b"v1"), store(2, b"two")]).unwrap();
    let t2 = log.append(&meta(), &[store(1, b"v2")]).unwrap();
    let t3 = log.append(&meta(), &[store(1, b"v3")]).unwrap();
    (log, [t1, t2, t3])
}

// ========== create / append / load ==========

#[test]
fn test_new_log_is_empty() {
    let dir = TempDir::new().unwrap();

    let log = FileLog::create(log_path(&dir, "empty.glog")).unwrap();

    assert_eq!(log.end(), 16);
    assert_eq!(log.last_tid(), Tid::ZERO);
    assert_eq!(log.transactions().count(), 0);
    assert!(matches!(
        log.load(ObjectId(1)),
        Err(Error::ObjectNotFound(_))
    ));
}

#[test]
fn test_append_then_load_latest() {
    let dir = TempDir::new().unwrap();

    let (log, [_, _, t3]) = sample_log(&dir);

    assert_eq!(log.load(ObjectId(1)).unwrap(), (b"v3".to_vec(), t3));
    assert_eq!(log.last_serial(ObjectId(1)).unwrap(), Some(t3));
    assert_eq!(log.last_serial(ObjectId(99)).unwrap(), None);
    assert_eq!(log.object_ids(), vec![ObjectId(1), ObjectId(2)]);
}

#[test]
fn test_tids_are_strictly_increasing() {
    let dir = TempDir::new().unwrap();

    let (_log, [t1, t2, t3]) = sample_log(&dir);

    assert!(t1 < t2 && t2 < t3);
}

#[test]
fn test_load_serial_reads_history() {
    let dir = TempDir::new().unwrap();
    let (log, [t1, t2, _]) = sample_log(&dir);

    assert_eq!(log.load_serial(ObjectId(1), t1).unwrap(), b"v1");
    assert_eq!(log.load_serial(ObjectId(1), t2).unwrap(), b"v2");
    assert_eq!(log.load_serial(ObjectId(2), t1).unwrap(), b"two");
}

#[test]
fn test_load_serial_missing_revision() {
    let dir = TempDir::new().unwrap();
    let (log, [_, t2, _]) = sample_log(&dir);

    let err = log.load_serial(ObjectId(2), t2).unwrap_err();

    assert!(matches!(
        err,
        Error::RevisionNotFound { oid: ObjectId(2), serial } if serial == t2
    ));
}

#[test]
fn test_log_is_a_serial_loader() {
    let dir = TempDir::new().unwrap();
    let (log, [t1, _, _]) = sample_log(&dir);
    let loader: &dyn SerialLoader = &log;

    assert_eq!(loader.load_serial(ObjectId(1), t1).unwrap(), b"v1");
}

#[test]
fn test_refs_and_meta_read_back() {
    let dir = TempDir::new().unwrap();
    let mut log = FileLog::create(log_path(&dir, "refs.glog")).unwrap();
    let mut txn_meta = TxnMeta::new("bob", "with refs");
    txn_meta.extension = vec![1, 2, 3];

    log.append(
        &txn_meta,
        &[RecordWrite::store(
            ObjectId(1),
            b"root".to_vec(),
            vec![ObjectId(2), ObjectId(3)],
        )],
    )
    .unwrap();

    let txn = log.transactions().next().unwrap().unwrap();
    assert_eq!(txn.meta, txn_meta);
    assert_eq!(txn.status, TxnStatus::Committed);
    assert_eq!(txn.records[0].refs, vec![ObjectId(2), ObjectId(3)]);
    assert_eq!(txn.records[0].data_txn, None);
}

// ========== reopen / recovery ==========

#[test]
fn test_reopen_rebuilds_index() {
    // Arrange
    let dir = TempDir::new().unwrap();
    let (log, [t1, _, t3]) = sample_log(&dir);
    let path = log.path().to_path_buf();
    let end = log.end();
    drop(log);

    // Act
    let reopened = FileLog::open(&path).unwrap();

    // Assert
    assert_eq!(reopened.end(), end);
    assert_eq!(reopened.last_tid(), t3);
    assert_eq!(reopened.load(ObjectId(1)).unwrap().0, b"v3");
    assert_eq!(reopened.load_serial(ObjectId(1), t1).unwrap(), b"v1");
}

#[test]
fn test_appends_after_reopen_continue_tids() {
    let dir = TempDir::new().unwrap();
    let (log, [_, _, t3]) = sample_log(&dir);
    let path = log.path().to_path_buf();
    drop(log);

    let mut reopened = FileLog::open(&path).unwrap();
    let t4 = reopened.append(&meta(), &[store(3, b"three")]).unwrap();

    assert!(t4 > t3);
    assert_eq!(reopened.transactions().count(), 4);
}

#[test]
fn test_truncated_tail_is_dropped_on_open() {
    // Arrange
    let dir = TempDir::new().unwrap();
    let (log, [_, t2, _]) = sample_log(&dir);
    let path = log.path().to_path_buf();
    let last_start = log.transactions().last().unwrap().unwrap().pos;
    drop(log);
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(last_start + 30).unwrap();
    drop(file);

    // Act
    let reopened = FileLog::open(&path).unwrap();

    // Assert
    assert_eq!(reopened.end(), last_start);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), last_start);
    assert_eq!(reopened.load(ObjectId(1)).unwrap(), (b"v2".to_vec(), t2));
}

#[test]
fn test_committing_tail_is_dropped_on_open() {
    let dir = TempDir::new().unwrap();
    let (log, _) = sample_log(&dir);
    let path = log.path().to_path_buf();
    let last_start = log.transactions().last().unwrap().unwrap().pos;
    drop(log);
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    std::io::Seek::seek(&mut file, std::io::SeekFrom::Start(last_start + 16)).unwrap();
    file.write_all(b"c").unwrap();
    drop(file);

    let reopened = FileLog::open(&path).unwrap();

    assert_eq!(reopened.end(), last_start);
    assert_eq!(reopened.transactions().count(), 2);
}

#[test]
fn test_garbage_tail_is_dropped_on_open() {
    let dir = TempDir::new().unwrap();
    let (log, _) = sample_log(&dir);
    let path = log.path().to_path_buf();
    let end = log.end();
    drop(log);
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0xAB; 7]).unwrap();
    drop(file);

    let reopened = FileLog::open(&path).unwrap();

    assert_eq!(reopened.end(), end);
}

#[test]
fn test_bad_magic_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = log_path(&dir, "bogus.glog");
    std::fs::write(&path, b"this is not a log file").unwrap();

    let err = FileLog::open(&path).unwrap_err();

    assert!(matches!(err, Error::CorruptRecord { offset: 0, .. }));
    assert!(!err.is_recoverable());
}

#[test]
fn test_corrupt_trailer_in_middle_is_an_error() {
    let dir = TempDir::new().unwrap();
    let (log, _) = sample_log(&dir);
    let path = log.path().to_path_buf();
    let second = log.transactions().nth(1).unwrap().unwrap().pos;
    drop(log);
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    std::io::Seek::seek(&mut file, std::io::SeekFrom::Start(second - 8)).unwrap();
    file.write_all(&u64::MAX.to_be_bytes()).unwrap();
    drop(file);

    let err = FileLog::open(&path).unwrap_err();

    assert!(matches!(err, Error::CorruptRecord { .. }));
}

#[test]
fn test_oversized_payload_length_is_an_error() {
    // Arrange: plen of the first data record set to u64::MAX
    let dir = TempDir::new().unwrap();
    let (log, _) = sample_log(&dir);
    let path = log.path().to_path_buf();
    let record = log.transactions().next().unwrap().unwrap().records[0].pos;
    drop(log);
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    std::io::Seek::seek(&mut file, std::io::SeekFrom::Start(record + 36)).unwrap();
    file.write_all(&u64::MAX.to_be_bytes()).unwrap();
    drop(file);

    // Act
    let err = FileLog::open(&path).unwrap_err();

    // Assert
    assert!(matches!(err, Error::CorruptRecord { offset, .. } if offset == record));
}

#[test]
fn test_open_or_create() {
    let dir = TempDir::new().unwrap();
    let path = log_path(&dir, "nested/dir/db.glog");

    let mut created = FileLog::open_or_create(&path).unwrap();
    created.append(&meta(), &[store(1, b"x")]).unwrap();
    drop(created);
    let opened = FileLog::open_or_create(&path).unwrap();

    assert_eq!(opened.load(ObjectId(1)).unwrap().0, b"x");
}

// ========== restore ==========

/// Source log where the third transaction re-stores oid 1's first payload as
/// a back-pointer, like an undo would.
fn source_with_back_pointer(dir: &TempDir) -> FileLog {
    let mut log = FileLog::create(log_path(dir, "source.glog")).unwrap();
    let t1 = log.append(&meta(), &[store(1, b"original")]).unwrap();
    log.append(&meta(), &[store(1, b"changed")]).unwrap();
    let undo = PendingRecord {
        oid: ObjectId(1),
        serial: Tid::after(log.last_tid()),
        data: Some(b"original"),
        refs: &[],
        version: None,
        prev_txn: Some(t1),
    };
    let tid = undo.serial;
    log.write_transaction(tid, TxnStatus::Committed, &TxnMeta::new("", "undo"), &[undo])
        .unwrap();
    log
}

#[test]
fn test_iterator_resolves_back_pointers() {
    let dir = TempDir::new().unwrap();
    let source = source_with_back_pointer(&dir);

    let txns: Vec<_> = source.transactions().map(Result::unwrap).collect();

    let undo = &txns[2].records[0];
    assert_eq!(undo.data.as_deref(), Some(&b"original"[..]));
    assert_eq!(undo.data_txn, Some(txns[0].tid));
}

#[test]
fn test_copy_restores_every_transaction() {
    // Arrange
    let dir = TempDir::new().unwrap();
    let source = source_with_back_pointer(&dir);
    let mut dest = FileLog::create(log_path(&dir, "dest.glog")).unwrap();

    // Act
    let stats = dest.copy_transactions_from(&source).unwrap();

    // Assert
    assert_eq!(stats.transactions, 3);
    assert_eq!(stats.records, 3);
    assert_eq!(stats.back_pointers, 1);
    assert_eq!(dest.last_tid(), source.last_tid());
    let src: Vec<_> = source.transactions().map(Result::unwrap).collect();
    let dst: Vec<_> = dest.transactions().map(Result::unwrap).collect();
    assert_eq!(src, dst);
}

#[test]
fn test_copy_is_deterministic() {
    let dir = TempDir::new().unwrap();
    let source = source_with_back_pointer(&dir);
    let mut a = FileLog::create(log_path(&dir, "a.glog")).unwrap();
    let mut b = FileLog::create(log_path(&dir, "b.glog")).unwrap();

    a.copy_transactions_from(&source).unwrap();
    b.copy_transactions_from(&source).unwrap();

    let bytes_a = std::fs::read(a.path()).unwrap();
    let bytes_b = std::fs::read(b.path()).unwrap();
    assert_eq!(bytes_a, bytes_b);
    assert_eq!(bytes_a, std::fs::read(source.path()).unwrap());
}

#[test]
fn test_copy_into_newer_log_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (source, _) = sample_log(&dir);
    let mut dest = FileLog::create(log_path(&dir, "newer.glog")).unwrap();
    dest.append(&meta(), &[store(5, b"later")]).unwrap();
    let end = dest.end();

    let err = dest.copy_transactions_from(&source).unwrap_err();

    assert!(matches!(err, Error::Storage(_)));
    assert_eq!(dest.end(), end);
}
