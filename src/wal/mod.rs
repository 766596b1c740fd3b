//! Write-Ahead Logging (WAL) Module
//!
//! This module implements the **append-only**, **CRC-protected** transaction log that makes
//! every applied batch durable before it reaches the memtable.
//!
//! ## Design Overview
//!
//! The log is a sequence of fixed 32 KiB physical blocks. A logical transaction (one encoded
//! batch) is written as one or more physical records; a record never crosses a block boundary,
//! so a transaction that does not fit in the current block is split into `FIRST`, `MIDDLE`*, and
//! `LAST` pieces. When fewer than [`HEADER_SIZE`] bytes are left in a block the writer fills them
//! with zeros and starts the next record at the following block.
//!
//! # On-disk layout
//!
//! ```text
//! block 0: [CRC32 BE (4)][TYPE (1)][LEN BE (2)][PAYLOAD (LEN)] [record] ... [zero padding < 7]
//! block 1: ...
//! ```
//!
//! - **CRC32**: IEEE checksum of the payload only.
//! - **TYPE**: [`RecordType`]: `FULL=1`, `FIRST=2`, `MIDDLE=3`, `LAST=4`.
//! - **LEN**: payload length; at most `BLOCK_SIZE - HEADER_SIZE`.
//!
//! # Concurrency model
//!
//! - A [`LogWriter`] is owned by the engine and used under its write lock.
//! - A [`LogReader`] works on an immutable snapshot of the file and is only used during recovery.
//!
//! # Guarantees
//!
//! - **Integrity:** every record's payload checksum is verified during replay.
//! - **Framing:** a transaction must open with `FULL` or `FIRST`, and a split transaction may only
//!   continue with `MIDDLE` or `LAST`; anything else is reported as corruption.
//! - **Corruption is fatal:** replay surfaces the first error and stops; nothing is skipped.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fmt,
    io::{self, Write},
};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::trace;

use crate::storage::StorageError;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Physical block size.
pub const BLOCK_SIZE: usize = 32768;

/// Physical record header: CRC32 (4), type (1), length (2).
pub const HEADER_SIZE: usize = 7;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error from the storage backend.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Data integrity failure: checksum did not match.
    #[error("Checksum mismatch at offset {offset}: stored {stored:#010X}, computed {computed:#010X}")]
    ChecksumMismatch {
        /// File offset of the record header.
        offset: u64,
        /// Checksum stored in the header.
        stored: u32,
        /// Checksum of the payload read.
        computed: u32,
    },

    /// A record header carries an unknown type code.
    #[error("Unknown record type {code} at offset {offset}")]
    BadRecordType {
        /// File offset of the record header.
        offset: u64,
        /// The type byte read.
        code: u8,
    },

    /// Records appear in an order no writer produces.
    #[error("Unexpected {found:?} record at offset {offset}")]
    BadRecordSequence {
        /// File offset of the record header.
        offset: u64,
        /// The record type found.
        found: RecordType,
    },

    /// A record extends past the end of the log.
    #[error("Truncated record at offset {offset}: {needed} bytes needed, {available} available")]
    Truncated {
        /// File offset of the record header.
        offset: u64,
        /// Bytes the record requires.
        needed: usize,
        /// Bytes left in the log.
        available: usize,
    },
}

// ------------------------------------------------------------------------------------------------
// Record type
// ------------------------------------------------------------------------------------------------

/// Position of a physical record within its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// The whole transaction.
    Full = 1,
    /// First piece of a split transaction.
    First = 2,
    /// Interior piece of a split transaction.
    Middle = 3,
    /// Final piece of a split transaction.
    Last = 4,
}

impl RecordType {
    /// Decodes a header type byte.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Full),
            2 => Some(Self::First),
            3 => Some(Self::Middle),
            4 => Some(Self::Last),
            _ => None,
        }
    }
}

/// Bytes left in the physical block containing `position`.
#[inline]
fn block_remaining(position: u64) -> usize {
    BLOCK_SIZE - (position % BLOCK_SIZE as u64) as usize
}

// ------------------------------------------------------------------------------------------------
// Writer
// ------------------------------------------------------------------------------------------------

/// Appends transactions to a log.
pub struct LogWriter<W: Write> {
    out: W,
    position: u64,
}

impl<W: Write> fmt::Debug for LogWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogWriter")
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl<W: Write> LogWriter<W> {
    /// A writer appending to `out`, whose current length is `position`.
    pub fn new(out: W, position: u64) -> Self {
        Self { out, position }
    }

    /// Byte offset of the next write.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// The underlying sink.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.out
    }

    /// Consumes the writer, returning the sink.
    pub fn into_inner(self) -> W {
        self.out
    }

    /// Appends one logical transaction, splitting it across blocks as needed.
    ///
    /// Data is handed to the sink but not flushed; call [`LogWriter::flush`]
    /// (and sync the sink) for durability.
    pub fn write_transaction(&mut self, mut data: &[u8]) -> Result<(), WalError> {
        let remaining = block_remaining(self.position);
        if remaining < HEADER_SIZE {
            self.out.write_all(&[0u8; HEADER_SIZE][..remaining])?;
            self.position += remaining as u64;
        }

        let total = data.len();
        let mut records = 0usize;
        let mut record_type = RecordType::Full;
        while data.len() > block_remaining(self.position) - HEADER_SIZE {
            record_type = match record_type {
                RecordType::Full => RecordType::First,
                _ => RecordType::Middle,
            };
            let (piece, rest) = data.split_at(block_remaining(self.position) - HEADER_SIZE);
            self.write_record(piece, record_type)?;
            data = rest;
            records += 1;
        }

        if record_type != RecordType::Full {
            record_type = RecordType::Last;
        }
        self.write_record(data, record_type)?;
        records += 1;

        trace!(len = total, records, position = self.position, "wal transaction written");
        Ok(())
    }

    fn write_record(&mut self, payload: &[u8], record_type: RecordType) -> Result<(), WalError> {
        let mut header = [0u8; HEADER_SIZE];
        header[..4].copy_from_slice(&crc32fast::hash(payload).to_be_bytes());
        header[4] = record_type as u8;
        // Payload never exceeds BLOCK_SIZE - HEADER_SIZE, which fits in u16.
        header[5..].copy_from_slice(&(payload.len() as u16).to_be_bytes());

        self.out.write_all(&header)?;
        self.out.write_all(payload)?;
        self.position += (HEADER_SIZE + payload.len()) as u64;
        Ok(())
    }

    /// Flushes buffered bytes to the sink.
    pub fn flush(&mut self) -> Result<(), WalError> {
        self.out.flush()?;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// Replays the transactions of a log snapshot.
#[derive(Debug, Clone)]
pub struct LogReader {
    data: Bytes,
}

impl LogReader {
    /// A reader over the full contents of a log.
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    /// Iterates the logical transactions in write order.
    pub fn transactions(&self) -> Transactions {
        Transactions {
            data: self.data.clone(),
            position: 0,
            failed: false,
        }
    }
}

/// Iterator over logical transactions; yields at most one error.
#[derive(Debug)]
pub struct Transactions {
    data: Bytes,
    position: usize,
    failed: bool,
}

impl Transactions {
    /// Offset just past the last record consumed.
    pub fn position(&self) -> u64 {
        self.position as u64
    }

    /// Reads the next physical record, skipping block-tail padding.
    fn read_record(&mut self) -> Result<(RecordType, Bytes, u64), WalError> {
        let remaining = block_remaining(self.position as u64);
        if remaining < HEADER_SIZE {
            self.position += remaining;
        }

        let offset = self.position as u64;
        let available = self.data.len().saturating_sub(self.position);
        if available < HEADER_SIZE {
            return Err(WalError::Truncated {
                offset,
                needed: HEADER_SIZE,
                available,
            });
        }

        let header = &self.data[self.position..self.position + HEADER_SIZE];
        let stored = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let code = header[4];
        let len = u16::from_be_bytes([header[5], header[6]]) as usize;

        let record_type =
            RecordType::from_code(code).ok_or(WalError::BadRecordType { offset, code })?;

        if available < HEADER_SIZE + len {
            return Err(WalError::Truncated {
                offset,
                needed: HEADER_SIZE + len,
                available,
            });
        }

        let start = self.position + HEADER_SIZE;
        let payload = self.data.slice(start..start + len);
        let computed = crc32fast::hash(&payload);
        if computed != stored {
            return Err(WalError::ChecksumMismatch {
                offset,
                stored,
                computed,
            });
        }

        self.position = start + len;
        Ok((record_type, payload, offset))
    }

    fn read_transaction(&mut self) -> Result<Bytes, WalError> {
        let (record_type, payload, offset) = self.read_record()?;
        match record_type {
            RecordType::Full => return Ok(payload),
            RecordType::First => {}
            found => return Err(WalError::BadRecordSequence { offset, found }),
        }

        let mut buf = BytesMut::from(&payload[..]);
        loop {
            let (record_type, payload, offset) = self.read_record()?;
            buf.extend_from_slice(&payload);
            match record_type {
                RecordType::Middle => {}
                RecordType::Last => return Ok(buf.freeze()),
                found => return Err(WalError::BadRecordSequence { offset, found }),
            }
        }
    }

    /// Returns `true` once fewer than a header's worth of bytes remain,
    /// after stepping over any block-tail padding.
    fn at_end(&self) -> bool {
        let mut position = self.position;
        let remaining = block_remaining(position as u64);
        if remaining < HEADER_SIZE {
            position += remaining;
        }
        self.data.len().saturating_sub(position) < HEADER_SIZE
    }
}

impl Iterator for Transactions {
    type Item = Result<Bytes, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.at_end() {
            return None;
        }
        let result = self.read_transaction();
        self.failed = result.is_err();
        Some(result)
    }
}
