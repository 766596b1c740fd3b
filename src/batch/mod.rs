//! # Batch Module
//!
//! An ordered group of puts and deletes applied atomically: one batch is one
//! write-ahead log transaction and one memtable update.
//!
//! ## Encoding
//!
//! ```text
//! put:    [key raw][value raw]
//! delete: [key raw][0xC0]
//! ```
//!
//! Operations are concatenated in call order with no count or trailer, so a
//! batch read back from the log is decoded until its bytes run out.
//!
//! A batch built with [`Batch::wrap`] aliases an existing buffer and is
//! read-only.


use bytes::Bytes;
use thiserror::Error;

use crate::encoding::{self, EncodingError, Reader};
use crate::view::{ByteView, KeyValue};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Batch`] operations.
#[derive(Debug, Error)]
pub enum BatchError {
    /// An operation could not be encoded or decoded.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The batch wraps external bytes and cannot be extended.
    #[error("Batch is read-only")]
    ReadOnly,
}

// ------------------------------------------------------------------------------------------------
// Batch
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Buffer {
    Owned(Vec<u8>),
    Wrapped(Bytes),
}

/// A serialized sequence of puts and deletes.
#[derive(Debug, Clone)]
pub struct Batch {
    buf: Buffer,
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

impl Batch {
    /// An empty, writable batch.
    pub fn new() -> Self {
        Self {
            buf: Buffer::Owned(Vec::new()),
        }
    }

    /// A read-only batch over already-encoded operations.
    pub fn wrap(data: impl Into<Bytes>) -> Self {
        Self {
            buf: Buffer::Wrapped(data.into()),
        }
    }

    fn owned(&mut self) -> Result<&mut Vec<u8>, BatchError> {
        match &mut self.buf {
            Buffer::Owned(buf) => Ok(buf),
            Buffer::Wrapped(_) => Err(BatchError::ReadOnly),
        }
    }

    /// Appends a put of `key` → `value`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), BatchError> {
        let buf = self.owned()?;
        let mark = buf.len();
        let result = encoding::put_raw(buf, key).and_then(|()| encoding::put_raw(buf, value));
        if result.is_err() {
            buf.truncate(mark);
        }
        Ok(result?)
    }

    /// Appends a delete of `key`.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), BatchError> {
        let buf = self.owned()?;
        encoding::put_raw(buf, key)?;
        encoding::put_nil(buf);
        Ok(())
    }

    /// Returns `true` if the batch holds no operations.
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Returns `true` if the batch was built with [`Batch::wrap`].
    pub fn is_read_only(&self) -> bool {
        matches!(self.buf, Buffer::Wrapped(_))
    }

    /// Encoded size in bytes.
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// The encoded operations, as written to the log.
    pub fn as_bytes(&self) -> &[u8] {
        match &self.buf {
            Buffer::Owned(buf) => buf,
            Buffer::Wrapped(data) => data,
        }
    }

    /// The encoded operations as a view; copies for an owned batch.
    pub fn as_view(&self) -> ByteView {
        match &self.buf {
            Buffer::Owned(buf) => ByteView::copy_from(buf),
            Buffer::Wrapped(data) => ByteView::from(data.clone()),
        }
    }

    /// Decodes the operations in order; deletes come back as tombstones.
    ///
    /// Entries of a wrapped batch borrow its buffer without copying.
    pub fn pairs(&self) -> BatchIter {
        BatchIter {
            reader: Reader::new(self.as_view().into()),
            failed: false,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

/// Single-pass decoder over a batch's operations.
#[derive(Debug)]
pub struct BatchIter {
    reader: Reader,
    failed: bool,
}

impl BatchIter {
    fn read_pair(&mut self) -> Result<KeyValue, BatchError> {
        let key = self.reader.read_raw()?;
        let value = self.reader.read_raw_or_nil()?;
        Ok(KeyValue {
            key: ByteView::from(key),
            value: value.map(ByteView::from),
        })
    }
}

impl Iterator for BatchIter {
    type Item = Result<KeyValue, BatchError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.reader.is_empty() {
            return None;
        }
        let pair = self.read_pair();
        self.failed = pair.is_err();
        Some(pair)
    }
}
