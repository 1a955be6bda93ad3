//! On-disk WAL record encoding.
//!
//! Two record forms share a 16-bit header: bit 15 is the truncate flag,
//! bit 14 distinguishes a writer *introduction* (0) from a writer
//! *reference* (1), and the low 14 bits carry the writer reference assigned
//! sequentially from 0 within each file. An introduction additionally
//! carries the length-prefixed serialized writer id; every record then
//! carries a checksum, the entry length, index, term, and entry bytes.
//! All integers are big-endian.

use crate::error::{CohortError, Result};
use crate::types::{LogIndex, Term};
use adler32::RollingAdler32;

/// Highest writer reference expressible in the 14-bit header field.
pub const MAX_WRITER_REF: u16 = (1 << 14) - 1;

const TRUNCATE_BIT: u16 = 1 << 15;
const REF_BIT: u16 = 1 << 14;

/// Fixed bytes after the writer portion: checksum + entry_len + idx + term.
const BODY_HEADER_LEN: usize = 4 + 4 + 8 + 8;

/// Writer naming within a record: full id on first occurrence in a file,
/// bare reference afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterKey<'a> {
    /// First record for this writer in the file.
    Introduce { writer_ref: u16, writer_id: &'a [u8] },
    /// Subsequent record for an already-introduced writer.
    Reference(u16),
}

/// A record decoded from a WAL file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub truncate: bool,
    pub writer_ref: u16,
    /// Present only on introduction records.
    pub writer_id: Option<Vec<u8>>,
    pub index: LogIndex,
    pub term: Term,
    pub entry: Vec<u8>,
}

/// Adler32 over `idx ‖ term ‖ entry_bytes` with big-endian integers.
pub fn record_checksum(index: LogIndex, term: Term, entry: &[u8]) -> u32 {
    let mut adler = RollingAdler32::new();
    adler.update_buffer(&index.to_be_bytes());
    adler.update_buffer(&term.to_be_bytes());
    adler.update_buffer(entry);
    adler.hash()
}

/// Size of a record as it will appear on disk.
pub fn encoded_len(writer: &WriterKey<'_>, entry_len: usize) -> usize {
    let writer_len = match writer {
        WriterKey::Introduce { writer_id, .. } => 2 + 2 + writer_id.len(),
        WriterKey::Reference(_) => 2,
    };
    writer_len + BODY_HEADER_LEN + entry_len
}

/// Append an encoded record to `buf`.
///
/// `compute_checksums = false` writes a zero checksum, which disables
/// validation for this record on recovery.
pub fn encode_record(
    buf: &mut Vec<u8>,
    truncate: bool,
    writer: WriterKey<'_>,
    index: LogIndex,
    term: Term,
    entry: &[u8],
    compute_checksums: bool,
) -> Result<()> {
    let (writer_ref, intro) = match writer {
        WriterKey::Introduce { writer_ref, writer_id } => (writer_ref, Some(writer_id)),
        WriterKey::Reference(writer_ref) => (writer_ref, None),
    };

    if writer_ref > MAX_WRITER_REF {
        return Err(CohortError::Internal(format!(
            "writer reference {} exceeds 14-bit space",
            writer_ref
        )));
    }

    let mut header = writer_ref;
    if truncate {
        header |= TRUNCATE_BIT;
    }
    if intro.is_none() {
        header |= REF_BIT;
    }
    buf.extend_from_slice(&header.to_be_bytes());

    if let Some(writer_id) = intro {
        let id_len = u16::try_from(writer_id.len()).map_err(|_| {
            CohortError::Internal("writer id exceeds 16-bit length".to_string())
        })?;
        buf.extend_from_slice(&id_len.to_be_bytes());
        buf.extend_from_slice(writer_id);
    }

    let checksum = if compute_checksums {
        record_checksum(index, term, entry)
    } else {
        0
    };
    buf.extend_from_slice(&checksum.to_be_bytes());
    buf.extend_from_slice(&(entry.len() as u32).to_be_bytes());
    buf.extend_from_slice(&index.to_be_bytes());
    buf.extend_from_slice(&term.to_be_bytes());
    buf.extend_from_slice(entry);
    Ok(())
}

/// Decode one record from the front of `buf`.
///
/// Returns the record and the number of bytes consumed, or `None` when the
/// buffer holds only a torn tail (a crash mid-write; never acknowledged, so
/// recovery stops there). A complete record whose checksum does not match
/// is corruption and fails.
pub fn decode_record(buf: &[u8]) -> Result<Option<(DecodedRecord, usize)>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let header = u16::from_be_bytes([buf[0], buf[1]]);
    let truncate = header & TRUNCATE_BIT != 0;
    let is_reference = header & REF_BIT != 0;
    let writer_ref = header & MAX_WRITER_REF;
    let mut pos = 2;

    let writer_id = if is_reference {
        None
    } else {
        if buf.len() < pos + 2 {
            return Ok(None);
        }
        let id_len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
        pos += 2;
        if buf.len() < pos + id_len {
            return Ok(None);
        }
        let id = buf[pos..pos + id_len].to_vec();
        pos += id_len;
        Some(id)
    };

    if buf.len() < pos + BODY_HEADER_LEN {
        return Ok(None);
    }
    let checksum = read_u32(buf, pos);
    let entry_len = read_u32(buf, pos + 4) as usize;
    let index = read_u64(buf, pos + 8);
    let term = read_u64(buf, pos + 16);
    pos += BODY_HEADER_LEN;

    if buf.len() < pos + entry_len {
        return Ok(None);
    }
    let entry = buf[pos..pos + entry_len].to_vec();
    pos += entry_len;

    if checksum != 0 {
        let actual = record_checksum(index, term, &entry);
        if actual != checksum {
            return Err(CohortError::ChecksumMismatch { expected: checksum, actual });
        }
    }

    Ok(Some((
        DecodedRecord { truncate, writer_ref, writer_id, index, term, entry },
        pos,
    )))
}

// Callers bound-check before reading.
fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(bytes)
}
