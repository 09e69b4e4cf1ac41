//! Subcommand implementations.
//!
//! Each command writes its report to the given writer so tests can capture it.

use crate::OutputFormat;
use anyhow::{Context, Result};
use ghostdb_core::codec;
use ghostdb_core::storage::{LogRecord, TxnRecord, TxnStatus};
use ghostdb_core::{FileLog, GhostConfig, Tid};
use serde_json::{json, Value};
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// Parses a tid as printed by `inspect` (hex, optional `0x` prefix).
pub(crate) fn parse_tid(s: &str) -> Result<Tid, String> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() || digits.len() > 16 {
        return Err(format!("'{s}' is not a tid (1 to 16 hex digits)"));
    }
    u64::from_str_radix(digits, 16)
        .map(Tid)
        .map_err(|e| format!("'{s}' is not a tid: {e}"))
}

pub(crate) fn status_name(status: TxnStatus) -> &'static str {
    match status {
        TxnStatus::Committed => "committed",
        TxnStatus::Packed => "packed",
        TxnStatus::Uncommitted => "uncommitted",
        TxnStatus::Committing => "committing",
    }
}

fn ensure_distinct(src: &Path, dst: &Path) -> Result<()> {
    let same = match (src.canonicalize(), dst.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => src == dst,
    };
    anyhow::ensure!(!same, "destination {} is the source log", dst.display());
    Ok(())
}

fn open_log(path: &Path) -> Result<FileLog> {
    FileLog::open(path).with_context(|| format!("cannot open log {}", path.display()))
}

/// Lists every transaction and its records.
pub(crate) fn inspect(path: &Path, format: OutputFormat, out: &mut impl Write) -> Result<()> {
    let log = open_log(path)?;
    debug!(path = %path.display(), end = log.end(), "inspecting log");

    let mut txns = Vec::new();
    for txn in log.transactions() {
        txns.push(txn?);
    }

    match format {
        OutputFormat::Text => {
            writeln!(
                out,
                "{}: {} transactions, {} objects, last tid {}",
                path.display(),
                txns.len(),
                log.object_count(),
                log.last_tid()
            )?;
            for txn in &txns {
                write_txn_text(txn, &mut *out)?;
            }
        }
        OutputFormat::Json => {
            let doc = json!({
                "path": path.display().to_string(),
                "last_tid": log.last_tid().to_string(),
                "objects": log.object_count(),
                "transactions": txns.iter().map(txn_json).collect::<Vec<_>>(),
            });
            serde_json::to_writer_pretty(&mut *out, &doc)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

fn write_txn_text(txn: &TxnRecord, out: &mut impl Write) -> Result<()> {
    writeln!(
        out,
        "tid {} @{} {} user={:?} description={:?} records={}",
        txn.tid,
        txn.pos,
        status_name(txn.status),
        txn.meta.user,
        txn.meta.description,
        txn.records.len()
    )?;
    for record in &txn.records {
        write!(out, "  oid {} serial {}", record.oid, record.serial)?;
        match &record.data {
            Some(data) => write!(out, " {} bytes class={}", data.len(), class_label(data))?,
            None => write!(out, " uncreated")?,
        }
        if let Some(data_txn) = record.data_txn {
            write!(out, " backpointer={data_txn}")?;
        }
        if let Some(version) = &record.version {
            write!(out, " version={version:?}")?;
        }
        if !record.refs.is_empty() {
            let refs: Vec<String> = record.refs.iter().map(ToString::to_string).collect();
            write!(out, " refs=[{}]", refs.join(", "))?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Class name of a state record, or `-` for payloads that are not one.
fn class_label(data: &[u8]) -> String {
    codec::class_of(data).unwrap_or_else(|_| "-".to_string())
}

fn record_json(record: &LogRecord) -> Value {
    json!({
        "oid": record.oid.to_string(),
        "serial": record.serial.to_string(),
        "pos": record.pos,
        "version": record.version,
        "refs": record.refs.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "bytes": record.data.as_ref().map(Vec::len),
        "class": record.data.as_deref().map(class_label),
        "backpointer": record.data_txn.map(|t| t.to_string()),
    })
}

fn txn_json(txn: &TxnRecord) -> Value {
    json!({
        "tid": txn.tid.to_string(),
        "pos": txn.pos,
        "status": status_name(txn.status),
        "user": txn.meta.user,
        "description": txn.meta.description,
        "records": txn.records.iter().map(record_json).collect::<Vec<_>>(),
    })
}

/// Restores every transaction of `src` into a fresh log at `dst`.
pub(crate) fn copy(src: &Path, dst: &Path, out: &mut impl Write) -> Result<()> {
    ensure_distinct(src, dst)?;
    let source = open_log(src)?;
    let mut dest =
        FileLog::create(dst).with_context(|| format!("cannot create log {}", dst.display()))?;
    let stats = dest
        .copy_transactions_from(&source)
        .with_context(|| format!("copy into {} failed", dst.display()))?;
    dest.sync()?;
    writeln!(
        out,
        "copied {} transactions ({} records, {} back-pointers) to {}",
        stats.transactions,
        stats.records,
        stats.back_pointers,
        dst.display()
    )?;
    Ok(())
}

/// Writes a packed copy of `src` to `dst`.
pub(crate) fn pack(
    src: &Path,
    dst: &Path,
    before: Option<Tid>,
    out: &mut impl Write,
) -> Result<()> {
    ensure_distinct(src, dst)?;
    let source = open_log(src)?;
    let pack_tid = before.unwrap_or_else(|| source.last_tid());
    let stats = source
        .pack(pack_tid, dst)
        .with_context(|| format!("pack into {} failed", dst.display()))?;
    writeln!(
        out,
        "packed at {}: {} transactions, {} records kept, {} dropped, {} -> {} bytes",
        pack_tid,
        stats.transactions,
        stats.records,
        stats.dropped,
        stats.bytes_before,
        stats.bytes_after
    )?;
    Ok(())
}

/// Prints the effective configuration.
pub(crate) fn config(file: Option<&Path>, out: &mut impl Write) -> Result<()> {
    let config = match file {
        Some(path) => GhostConfig::load_from_path(path)
            .with_context(|| format!("cannot load {}", path.display()))?,
        None => GhostConfig::load()?,
    };
    config.validate()?;
    write!(out, "{}", config.to_toml()?)?;
    Ok(())
}
