//! On-disk layout of the transaction log.
//!
//! All integers are big-endian.
//!
//! ```text
//! file header  [magic "GLOG": 4][version: 1][reserved: 11]
//! transaction  [tid: 8][tlen: 8][status: 1][ulen: 2][dlen: 2][elen: 2]
//!              [user][description][extension]
//!              [data records ...]
//!              [tlen: 8]
//! data record  [oid: 8][serial: 8][prev: 8][txn pos: 8][vlen: 2][nrefs: 2][plen: 8]
//!              if vlen > 0: [pnv: 8][vprev: 8][version]
//!              [refs: 8 * nrefs]
//!              [payload: plen] or, if plen == 0, [back-pointer: 8]
//! ```
//!
//! `tlen` covers the transaction header through the last data record, so the
//! trailing copy sits at `txn_pos + tlen` and a reader walking backwards from
//! `end` finds the transaction start at `end - 8 - tlen`. A back-pointer of
//! zero marks an uncreation.

use crate::error::{Error, Result};
use crate::oid::{ObjectId, Tid};
use bytes::{Buf, BufMut};
use std::io::{self, Read, Seek, SeekFrom};

/// Magic bytes at the start of every log file.
pub const MAGIC: &[u8; 4] = b"GLOG";

/// Current format version.
pub const FORMAT_VERSION: u8 = 1;

/// Length of the file header.
pub const FILE_HEADER_LEN: u64 = 16;

/// Length of the fixed part of a transaction header.
pub const TXN_HEADER_LEN: u64 = 23;

/// Length of the fixed part of a data record header.
pub const DATA_HEADER_LEN: u64 = 44;

/// Length of the trailing transaction length.
pub const TRAILER_LEN: u64 = 8;

/// Length of the version block that follows a versioned record header.
const VERSION_PREFIX_LEN: u64 = 16;

/// Status byte of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnStatus {
    /// Committed (`' '`).
    Committed,
    /// Committed and rewritten by a pack (`'p'`).
    Packed,
    /// Uncommitted or checkpoint (`'u'`).
    Uncommitted,
    /// Being committed (`'c'`); never valid after a clean shutdown.
    Committing,
}

impl TxnStatus {
    /// Byte written to disk.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Committed => b' ',
            Self::Packed => b'p',
            Self::Uncommitted => b'u',
            Self::Committing => b'c',
        }
    }

    /// Parses a status byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b' ' => Some(Self::Committed),
            b'p' => Some(Self::Packed),
            b'u' => Some(Self::Uncommitted),
            b'c' => Some(Self::Committing),
            _ => None,
        }
    }

    /// True for statuses a reader may expose.
    #[must_use]
    pub const fn is_committed(self) -> bool {
        matches!(self, Self::Committed | Self::Packed)
    }
}

/// Writes the file header.
pub fn encode_file_header(buf: &mut impl BufMut) {
    buf.put_slice(MAGIC);
    buf.put_u8(FORMAT_VERSION);
    buf.put_bytes(0, 11);
}

/// Checks a file header.
///
/// # Errors
///
/// Returns [`Error::CorruptRecord`] on a bad magic or an unknown version.
pub fn check_file_header(bytes: &[u8; FILE_HEADER_LEN as usize]) -> Result<()> {
    if &bytes[..4] != MAGIC {
        return Err(Error::corrupt(0, "not a GhostDB log (bad magic)"));
    }
    if bytes[4] != FORMAT_VERSION {
        return Err(Error::corrupt(
            4,
            format!("unsupported format version {}", bytes[4]),
        ));
    }
    Ok(())
}

/// Fixed part of a transaction header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnHeader {
    /// Transaction id.
    pub tid: Tid,
    /// Length from the header start to the end of the last data record.
    pub tlen: u64,
    /// Commit status.
    pub status: TxnStatus,
    /// Length of the user name.
    pub ulen: u16,
    /// Length of the description.
    pub dlen: u16,
    /// Length of the extension bytes.
    pub elen: u16,
}

impl TxnHeader {
    /// Header length including user, description and extension.
    #[must_use]
    pub fn header_len(&self) -> u64 {
        TXN_HEADER_LEN + u64::from(self.ulen) + u64::from(self.dlen) + u64::from(self.elen)
    }

    /// Encodes the fixed part.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.tid.0);
        buf.put_u64(self.tlen);
        buf.put_u8(self.status.as_byte());
        buf.put_u16(self.ulen);
        buf.put_u16(self.dlen);
        buf.put_u16(self.elen);
    }

    /// Decodes the fixed part read at `pos`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptRecord`] on an unknown status byte.
    pub fn decode(mut bytes: &[u8], pos: u64) -> Result<Self> {
        let tid = Tid(bytes.get_u64());
        let tlen = bytes.get_u64();
        let status_byte = bytes.get_u8();
        let status = TxnStatus::from_byte(status_byte).ok_or_else(|| {
            Error::corrupt(pos + 16, format!("unknown transaction status {status_byte:#04x}"))
        })?;
        Ok(Self {
            tid,
            tlen,
            status,
            ulen: bytes.get_u16(),
            dlen: bytes.get_u16(),
            elen: bytes.get_u16(),
        })
    }
}

/// Fixed part of a data record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    /// Object the record belongs to.
    pub oid: ObjectId,
    /// Tid of the transaction that wrote the revision.
    pub serial: Tid,
    /// Offset of the previous record for the object, 0 if none.
    pub prev: u64,
    /// Offset of the enclosing transaction.
    pub txn_pos: u64,
    /// Length of the version name, 0 if not in a version.
    pub vlen: u16,
    /// Number of references.
    pub nrefs: u16,
    /// Payload length, 0 when a back-pointer follows.
    pub plen: u64,
}

impl DataHeader {
    /// Decodes the fixed part.
    #[must_use]
    pub fn decode(mut bytes: &[u8]) -> Self {
        Self {
            oid: ObjectId(bytes.get_u64()),
            serial: Tid(bytes.get_u64()),
            prev: bytes.get_u64(),
            txn_pos: bytes.get_u64(),
            vlen: bytes.get_u16(),
            nrefs: bytes.get_u16(),
            plen: bytes.get_u64(),
        }
    }

    /// Offset of the reference list relative to the record start.
    #[must_use]
    pub fn refs_offset(&self) -> u64 {
        let version = if self.vlen > 0 {
            VERSION_PREFIX_LEN + u64::from(self.vlen)
        } else {
            0
        };
        DATA_HEADER_LEN + version
    }

    /// Offset of the payload (or back-pointer) relative to the record start.
    #[must_use]
    pub fn payload_offset(&self) -> u64 {
        self.refs_offset() + 8 * u64::from(self.nrefs)
    }

    /// Length of the payload or back-pointer.
    #[must_use]
    pub fn data_len(&self) -> u64 {
        if self.plen == 0 {
            8
        } else {
            self.plen
        }
    }

    /// Total record length.
    ///
    /// Saturates on overflow; headers returned by [`read_data_header`] are
    /// known to fit inside the log.
    #[must_use]
    pub fn record_len(&self) -> u64 {
        self.payload_offset().saturating_add(self.data_len())
    }

    /// Offset just past the record when it starts at `pos`, `None` on
    /// overflow.
    #[must_use]
    pub fn checked_end(&self, pos: u64) -> Option<u64> {
        pos.checked_add(self.payload_offset())?
            .checked_add(self.data_len())
    }
}

/// Version block of a record written inside a named version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    /// Offset of the previous non-version record of the object.
    pub pnv: u64,
    /// Offset of the previous record in the same version.
    pub vprev: u64,
    /// Version name.
    pub name: String,
}

/// Contents of a data record after its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    /// The payload is stored inline.
    Payload(Vec<u8>),
    /// The payload lives in the record at this offset.
    BackPointer(u64),
    /// The object does not exist as of this record.
    Uncreation,
}

impl RecordData {
    fn from_back_pointer(pos: u64) -> Self {
        if pos == 0 {
            Self::Uncreation
        } else {
            Self::BackPointer(pos)
        }
    }
}

/// A full data record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRecord {
    /// Object the record belongs to.
    pub oid: ObjectId,
    /// Tid of the transaction that wrote the revision.
    pub serial: Tid,
    /// Offset of the previous record for the object, 0 if none.
    pub prev: u64,
    /// Offset of the enclosing transaction.
    pub txn_pos: u64,
    /// Version block, if the record belongs to a named version.
    pub version: Option<VersionInfo>,
    /// Objects referenced by the payload.
    pub refs: Vec<ObjectId>,
    /// Payload, back-pointer or uncreation marker.
    pub data: RecordData,
}

impl DataRecord {
    /// Appends the encoded record to `buf`.
    ///
    /// An empty inline payload is written as an uncreation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the version name or the reference list
    /// does not fit its length field.
    pub fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        let vlen = match &self.version {
            Some(v) => u16::try_from(v.name.len())
                .map_err(|_| Error::Storage(format!("version name too long: {}", v.name.len())))?,
            None => 0,
        };
        let nrefs = u16::try_from(self.refs.len())
            .map_err(|_| Error::Storage(format!("too many references: {}", self.refs.len())))?;
        let plen = match &self.data {
            RecordData::Payload(bytes) => bytes.len() as u64,
            RecordData::BackPointer(_) | RecordData::Uncreation => 0,
        };

        buf.put_u64(self.oid.0);
        buf.put_u64(self.serial.0);
        buf.put_u64(self.prev);
        buf.put_u64(self.txn_pos);
        buf.put_u16(vlen);
        buf.put_u16(nrefs);
        buf.put_u64(plen);
        if let Some(v) = &self.version {
            buf.put_u64(v.pnv);
            buf.put_u64(v.vprev);
            buf.put_slice(v.name.as_bytes());
        }
        for r in &self.refs {
            buf.put_u64(r.0);
        }
        match &self.data {
            RecordData::Payload(bytes) if !bytes.is_empty() => buf.put_slice(bytes),
            RecordData::BackPointer(pos) => buf.put_u64(*pos),
            RecordData::Payload(_) | RecordData::Uncreation => buf.put_u64(0),
        }
        Ok(())
    }

    /// Encoded length.
    #[must_use]
    pub fn encoded_len(&self) -> u64 {
        let version = self
            .version
            .as_ref()
            .map_or(0, |v| VERSION_PREFIX_LEN + v.name.len() as u64);
        let data = match &self.data {
            RecordData::Payload(bytes) if !bytes.is_empty() => bytes.len() as u64,
            _ => 8,
        };
        DATA_HEADER_LEN + version + 8 * self.refs.len() as u64 + data
    }
}

// =========================================================================
// Positioned reads
// =========================================================================

/// Reads exactly `len` bytes at `pos`, reporting a short read as corruption.
///
/// # Errors
///
/// Returns [`Error::CorruptRecord`] if the source ends early, [`Error::Io`]
/// on other failures.
pub fn read_at<R: Read + Seek>(reader: &mut R, pos: u64, len: u64, what: &str) -> Result<Vec<u8>> {
    let available = reader.seek(SeekFrom::End(0))?;
    if !pos.checked_add(len).is_some_and(|end| end <= available) {
        return Err(Error::corrupt(pos, format!("truncated {what}")));
    }
    let len = usize::try_from(len)
        .map_err(|_| Error::corrupt(pos, format!("{what} length {len} overflows")))?;
    let mut buf = vec![0u8; len];
    reader.seek(SeekFrom::Start(pos))?;
    reader.read_exact(&mut buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::corrupt(pos, format!("truncated {what}")),
        _ => Error::Io(e),
    })?;
    Ok(buf)
}

/// Reads a big-endian `u64` at `pos`.
///
/// # Errors
///
/// See [`read_at`].
pub fn read_u64_at<R: Read + Seek>(reader: &mut R, pos: u64, what: &str) -> Result<u64> {
    let bytes = read_at(reader, pos, 8, what)?;
    Ok((&bytes[..]).get_u64())
}

/// Reads the transaction header at `pos`, including user, description and
/// extension bytes.
///
/// # Errors
///
/// Returns [`Error::CorruptRecord`] on a truncated or malformed header.
pub fn read_txn_header<R: Read + Seek>(
    reader: &mut R,
    pos: u64,
) -> Result<(TxnHeader, Vec<u8>)> {
    let fixed = read_at(reader, pos, TXN_HEADER_LEN, "transaction header")?;
    let header = TxnHeader::decode(&fixed, pos)?;
    let meta_len = header.header_len() - TXN_HEADER_LEN;
    let meta = read_at(reader, pos + TXN_HEADER_LEN, meta_len, "transaction metadata")?;
    Ok((header, meta))
}

/// Reads only the fixed data record header at `pos`.
///
/// # Errors
///
/// Returns [`Error::CorruptRecord`] on a truncated header or one whose
/// lengths run past the end of the log.
pub fn read_data_header<R: Read + Seek>(reader: &mut R, pos: u64) -> Result<DataHeader> {
    let fixed = read_at(reader, pos, DATA_HEADER_LEN, "data record header")?;
    let header = DataHeader::decode(&fixed);
    let available = reader.seek(SeekFrom::End(0))?;
    if !header.checked_end(pos).is_some_and(|end| end <= available) {
        return Err(Error::corrupt(
            pos,
            format!("record length (payload {}) overruns the log", header.plen),
        ));
    }
    Ok(header)
}

/// Reads the full data record at `pos`.
///
/// # Errors
///
/// Returns [`Error::CorruptRecord`] on truncation, a non-UTF-8 version name or
/// a back-pointer that does not point backwards.
pub fn read_data_record<R: Read + Seek>(reader: &mut R, pos: u64) -> Result<DataRecord> {
    let header = read_data_header(reader, pos)?;
    let body_len = header.record_len() - DATA_HEADER_LEN;
    let body = read_at(reader, pos + DATA_HEADER_LEN, body_len, "data record body")?;
    let mut cursor = &body[..];

    let version = if header.vlen > 0 {
        let pnv = cursor.get_u64();
        let vprev = cursor.get_u64();
        let (name, rest) = cursor.split_at(usize::from(header.vlen));
        cursor = rest;
        let name = String::from_utf8(name.to_vec())
            .map_err(|_| Error::corrupt(pos, "version name is not UTF-8"))?;
        Some(VersionInfo { pnv, vprev, name })
    } else {
        None
    };

    let refs = (0..header.nrefs)
        .map(|_| ObjectId(cursor.get_u64()))
        .collect();

    let data = if header.plen == 0 {
        let bp = cursor.get_u64();
        if bp >= pos {
            return Err(Error::corrupt(
                pos,
                format!("back-pointer {bp} does not point backwards"),
            ));
        }
        RecordData::from_back_pointer(bp)
    } else {
        RecordData::Payload(cursor.to_vec())
    };

    Ok(DataRecord {
        oid: header.oid,
        serial: header.serial,
        prev: header.prev,
        txn_pos: header.txn_pos,
        version,
        refs,
        data,
    })
}
