//! # Block Module
//!
//! Prefix-compressed, restart-indexed runs of sorted key/value entries: the
//! unit a tablet stores, checksums, and compresses.
//!
//! ## Design Overview
//!
//! Consecutive keys in a sorted run usually share a prefix, so each entry only
//! stores the bytes that differ from the previous key. Every
//! `restart_interval`-th entry (starting with the first) is a **restart point**:
//! it stores its full key (shared length forced to 0) and its byte offset is
//! recorded in a trailer, so a reader can binary-search restart keys without
//! decoding the entries between them.
//!
//! # On-disk layout
//!
//! ```text
//! [shared varint][suffix raw][value raw | nil]     <- entry 0 (restart)
//! [shared varint][suffix raw][value raw | nil]     <- entry 1
//! ...
//! [restart offset u32 BE] × N
//! [N u32 BE]
//! ```
//!
//! - **shared**: bytes borrowed from the previous key (0 at restart points).
//! - **suffix**: remaining key bytes, length-prefixed.
//! - **value**: length-prefixed value, or the nil marker for a tombstone.
//!
//! # Guarantees
//!
//! - Keys reconstructed by [`BlockIter`] are byte-identical to the appended keys.
//! - `Block::find(Some(term))` yields exactly the entries `find(None)` yields
//!   with every key `< term` dropped, including when `term` precedes the first
//!   key or follows the last one.
//! - Malformed entries surface as errors, never as a silent end of data.

#[cfg(test)]
mod tests;

use std::cmp::Ordering;

use bytes::Bytes;
use thiserror::Error;

use crate::encoding::{self, EncodingError, Reader};
use crate::view::{ByteView, KeyValue, common_prefix_length, compare};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Default number of entries between restart points.
pub const DEFAULT_RESTART_INTERVAL: usize = 16;

const U32_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by block encoding and decoding.
#[derive(Debug, Error)]
pub enum BlockError {
    /// A length or flag byte could not be decoded.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The block's structure is inconsistent.
    #[error("Corrupt block: {0}")]
    Corrupt(String),

    /// A restart point outside the block was requested.
    #[error("Restart index {index} out of range ({count} restarts)")]
    InvalidRestart {
        /// Requested restart index.
        index: usize,
        /// Number of restart points in the block.
        count: usize,
    },

    /// Caller misuse (bad interval, append after finish).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

// ------------------------------------------------------------------------------------------------
// Writer
// ------------------------------------------------------------------------------------------------

/// Builds a single block from entries appended in ascending key order.
///
/// The writer is reusable: after [`finish`](Self::finish) has produced the
/// block bytes, [`reset`](Self::reset) clears it for the next block.
#[derive(Debug)]
pub struct BlockWriter {
    buf: Vec<u8>,
    restarts: Vec<u32>,
    restart_interval: usize,
    prev_key: Vec<u8>,
    first_key: Option<Vec<u8>>,
    entries: usize,
    finished: bool,
}

impl BlockWriter {
    /// Creates an empty writer that places a restart point every
    /// `restart_interval` entries.
    pub fn new(restart_interval: usize) -> Result<Self, BlockError> {
        if restart_interval == 0 {
            return Err(BlockError::InvalidArgument(
                "restart_interval must be >= 1".into(),
            ));
        }
        Ok(Self {
            buf: Vec::new(),
            restarts: Vec::new(),
            restart_interval,
            prev_key: Vec::new(),
            first_key: None,
            entries: 0,
            finished: false,
        })
    }

    /// Appends one entry. `None` writes a tombstone.
    pub fn append(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<(), BlockError> {
        if self.finished {
            return Err(BlockError::InvalidArgument(
                "append after finish; call reset first".into(),
            ));
        }

        let shared = if self.entries % self.restart_interval == 0 {
            let offset = u32::try_from(self.buf.len()).map_err(|_| {
                BlockError::InvalidArgument("block exceeds 4 GiB restart offset range".into())
            })?;
            self.restarts.push(offset);
            0
        } else {
            common_prefix_length(&self.prev_key, key)
        };

        if self.first_key.is_none() {
            self.first_key = Some(key.to_vec());
        }

        encoding::put_uint(&mut self.buf, shared as u64);
        encoding::put_raw(&mut self.buf, &key[shared..])?;
        encoding::put_raw_or_nil(&mut self.buf, value)?;

        self.prev_key.clear();
        self.prev_key.extend_from_slice(key);
        self.entries += 1;
        Ok(())
    }

    /// Size of the block if it were finished now, in bytes.
    pub fn size(&self) -> usize {
        if self.finished {
            return self.buf.len();
        }
        self.buf.len() + U32_SIZE * self.restarts.len() + U32_SIZE
    }

    /// Number of entries appended since the last reset.
    pub fn len(&self) -> usize {
        self.entries
    }

    /// Returns `true` if no entry has been appended since the last reset.
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// The first key appended since the last reset.
    pub fn first_key(&self) -> Option<&[u8]> {
        self.first_key.as_deref()
    }

    /// Appends the restart trailer and returns the complete block bytes.
    ///
    /// Calling `finish` again without a `reset` returns the same bytes.
    pub fn finish(&mut self) -> &[u8] {
        if !self.finished {
            for offset in &self.restarts {
                self.buf.extend_from_slice(&offset.to_be_bytes());
            }
            self.buf
                .extend_from_slice(&(self.restarts.len() as u32).to_be_bytes());
            self.finished = true;
        }
        &self.buf
    }

    /// Clears all state so the writer can build another block.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.restarts.clear();
        self.prev_key.clear();
        self.first_key = None;
        self.entries = 0;
        self.finished = false;
    }
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// A decoded view over finished block bytes.
///
/// Cloning is cheap; all clones share the same buffer.
#[derive(Debug, Clone)]
pub struct Block {
    data: Bytes,
    entries_end: usize,
    num_restarts: usize,
}

impl Block {
    /// Parses the restart trailer of `data`.
    pub fn new(data: Bytes) -> Result<Self, BlockError> {
        if data.len() < U32_SIZE {
            return Err(BlockError::Corrupt(format!(
                "block of {} bytes has no restart count",
                data.len()
            )));
        }

        let num_restarts = Reader::at(data.clone(), data.len() - U32_SIZE).read_u32_be()? as usize;
        let trailer = num_restarts
            .checked_mul(U32_SIZE)
            .and_then(|n| n.checked_add(U32_SIZE))
            .filter(|n| *n <= data.len())
            .ok_or_else(|| {
                BlockError::Corrupt(format!(
                    "{num_restarts} restarts do not fit in a {} byte block",
                    data.len()
                ))
            })?;

        Ok(Self {
            entries_end: data.len() - trailer,
            data,
            num_restarts,
        })
    }

    /// Number of restart points.
    pub fn num_restarts(&self) -> usize {
        self.num_restarts
    }

    /// Total encoded size, trailer included.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the block holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries_end == 0
    }

    /// Byte offset of restart point `index` within the entry region.
    pub fn restart_offset(&self, index: usize) -> Result<usize, BlockError> {
        if index >= self.num_restarts {
            return Err(BlockError::InvalidRestart {
                index,
                count: self.num_restarts,
            });
        }
        let at = self.entries_end + index * U32_SIZE;
        let offset = Reader::at(self.data.clone(), at).read_u32_be()? as usize;
        if offset >= self.entries_end {
            return Err(BlockError::Corrupt(format!(
                "restart {index} points at {offset}, past entry region of {} bytes",
                self.entries_end
            )));
        }
        Ok(offset)
    }

    /// Full key stored at restart point `index`.
    pub fn restart_key(&self, index: usize) -> Result<Bytes, BlockError> {
        let offset = self.restart_offset(index)?;
        let mut reader = Reader::at(self.entries(), offset);
        let shared = reader.read_uint()?;
        if shared != 0 {
            return Err(BlockError::Corrupt(format!(
                "restart {index} has shared prefix length {shared}"
            )));
        }
        Ok(reader.read_raw()?)
    }

    /// Iterates every entry in the block.
    pub fn iter(&self) -> BlockIter {
        BlockIter::new(self.entries(), 0)
    }

    /// Iterates entries with key `>= term`, or every entry when `term` is
    /// `None` or empty.
    ///
    /// With more than one restart point the scan starts at the last restart
    /// whose key is `<= term` (the first restart if none is), so a `term`
    /// beyond the last key scans the final run and yields nothing.
    pub fn find(&self, term: Option<&[u8]>) -> Result<BlockIter, BlockError> {
        let term = match term {
            Some(term) if !term.is_empty() => term,
            _ => return Ok(self.iter()),
        };

        let start = if self.num_restarts <= 1 {
            0
        } else {
            // Count of restarts whose key is <= term.
            let (mut lo, mut hi) = (0, self.num_restarts);
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                if compare(&self.restart_key(mid)?, term) != Ordering::Greater {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            match lo.checked_sub(1) {
                Some(restart) => self.restart_offset(restart)?,
                None => 0,
            }
        };

        let mut iter = BlockIter::new(self.entries(), start);
        iter.seek(term)?;
        Ok(iter)
    }

    fn entries(&self) -> Bytes {
        self.data.slice(..self.entries_end)
    }
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

/// Forward cursor over a block's entries.
///
/// Keys at restart points and values are zero-copy slices of the block
/// buffer; prefix-compressed keys are rebuilt into fresh buffers.
#[derive(Debug)]
pub struct BlockIter {
    reader: Reader,
    prev_key: Bytes,
    /// Entry already decoded by `seek`, returned before reading further.
    pending: Option<KeyValue>,
    failed: bool,
}

impl BlockIter {
    fn new(entries: Bytes, start: usize) -> Self {
        Self {
            reader: Reader::at(entries, start),
            prev_key: Bytes::new(),
            pending: None,
            failed: false,
        }
    }

    /// Skips entries with key `< term`, parking the first `>= term` entry.
    fn seek(&mut self, term: &[u8]) -> Result<(), BlockError> {
        while !self.reader.is_empty() {
            let kv = self.read_entry()?;
            if compare(&kv.key, term) != Ordering::Less {
                self.pending = Some(kv);
                break;
            }
        }
        Ok(())
    }

    fn read_entry(&mut self) -> Result<KeyValue, BlockError> {
        let shared = self.reader.read_uint()? as usize;
        let suffix = self.reader.read_raw()?;

        let key = if shared == 0 {
            suffix
        } else {
            if shared > self.prev_key.len() {
                return Err(BlockError::Corrupt(format!(
                    "shared prefix {shared} longer than previous key ({} bytes)",
                    self.prev_key.len()
                )));
            }
            let mut key = Vec::with_capacity(shared + suffix.len());
            key.extend_from_slice(&self.prev_key[..shared]);
            key.extend_from_slice(&suffix);
            Bytes::from(key)
        };
        self.prev_key = key.clone();

        let value = self.reader.read_raw_or_nil()?;
        Ok(KeyValue {
            key: ByteView::from(key),
            value: value.map(ByteView::from),
        })
    }
}

impl Iterator for BlockIter {
    type Item = Result<KeyValue, BlockError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(kv) = self.pending.take() {
            return Some(Ok(kv));
        }
        if self.reader.is_empty() {
            return None;
        }
        match self.read_entry() {
            Ok(kv) => Some(Ok(kv)),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
