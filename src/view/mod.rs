//! # Byte View Module
//!
//! Shared, immutable views over byte buffers and the global key ordering.
//!
//! ## Design Overview
//!
//! A [`ByteView`] is a `(buffer, offset, length)` window backed by a
//! reference-counted [`Bytes`] buffer. Sub-viewing never copies: a key decoded
//! from a data block, a value sliced out of a log record, or a batch wrapped
//! over a replayed transaction all share the buffer they were read from.
//! [`ByteView::detach`] produces an owned copy when a view must outlive a large
//! backing buffer.
//!
//! Every comparison in the crate goes through [`compare`]: unsigned-byte
//! lexicographic order, with the shorter input ordered first on a common-prefix
//! tie. `ByteView`'s `Ord` implementation is the same ordering.
//!
//! [`KeyValue`] is the unit every source (block, tablet, memtable, batch, engine)
//! yields. A tombstone is a `KeyValue` without a value.


use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::ops::Deref;

use bytes::Bytes;
use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned when constructing or sub-viewing a [`ByteView`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ViewError {
    /// Requested window does not fit inside the backing buffer.
    #[error("view out of bounds (offset {offset}, length {length}, capacity {capacity})")]
    OutOfBounds {
        /// Start of the requested window.
        offset: isize,
        /// Length of the requested window.
        length: usize,
        /// Length of the buffer being viewed.
        capacity: usize,
    },
}

// ------------------------------------------------------------------------------------------------
// Ordering helpers
// ------------------------------------------------------------------------------------------------

/// Unsigned-byte lexicographic comparison; on a common-prefix tie the shorter
/// input is less.
#[inline]
pub fn compare(a: &[u8], b: &[u8]) -> Ordering {
    // Slice ordering on `u8` is exactly unsigned lexicographic with a length tiebreak.
    a.cmp(b)
}

/// Number of leading bytes `a` and `b` have in common.
#[inline]
pub fn common_prefix_length(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Returns `true` if `value` starts with `prefix`.
#[inline]
pub fn is_prefix(value: &[u8], prefix: &[u8]) -> bool {
    value.starts_with(prefix)
}

// ------------------------------------------------------------------------------------------------
// ByteView
// ------------------------------------------------------------------------------------------------

/// Immutable window over a shared byte buffer.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct ByteView {
    data: Bytes,
}

impl ByteView {
    /// Creates a view of `length` bytes starting at `offset` inside `buffer`.
    pub fn new(buffer: Bytes, offset: usize, length: usize) -> Result<Self, ViewError> {
        let end = offset.checked_add(length);
        match end {
            Some(end) if end <= buffer.len() => Ok(Self {
                data: buffer.slice(offset..end),
            }),
            _ => Err(ViewError::OutOfBounds {
                offset: offset as isize,
                length,
                capacity: buffer.len(),
            }),
        }
    }

    /// Creates a view over a static byte string without copying.
    pub const fn from_static(bytes: &'static [u8]) -> Self {
        Self {
            data: Bytes::from_static(bytes),
        }
    }

    /// Creates an owned view holding a copy of `bytes`.
    pub fn copy_from(bytes: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(bytes),
        }
    }

    /// Length of the view in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the view covers no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The viewed bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// The underlying shared buffer handle, already narrowed to this view.
    #[inline]
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    /// Sub-view starting `skip` bytes in.
    ///
    /// A negative `skip` counts from the end of the view. `length` is taken
    /// from the computed offset; `None` means "to the end".
    pub fn sub(&self, skip: isize, length: Option<usize>) -> Result<Self, ViewError> {
        let capacity = self.len();
        let offset = if skip < 0 {
            capacity.checked_sub(skip.unsigned_abs())
        } else {
            Some(skip as usize).filter(|o| *o <= capacity)
        };

        let Some(offset) = offset else {
            return Err(ViewError::OutOfBounds {
                offset: skip,
                length: length.unwrap_or(0),
                capacity,
            });
        };

        let length = length.unwrap_or(capacity - offset);
        match offset.checked_add(length) {
            Some(end) if end <= capacity => Ok(Self {
                data: self.data.slice(offset..end),
            }),
            _ => Err(ViewError::OutOfBounds {
                offset: skip,
                length,
                capacity,
            }),
        }
    }

    /// Owned copy of the viewed bytes, releasing the reference to the
    /// original backing buffer.
    pub fn detach(&self) -> Self {
        Self::copy_from(&self.data)
    }

    /// Copies the viewed bytes into a `Vec`.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }
}

impl Ord for ByteView {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(&self.data, &other.data)
    }
}

impl PartialOrd for ByteView {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Deref for ByteView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for ByteView {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Borrow<[u8]> for ByteView {
    fn borrow(&self) -> &[u8] {
        &self.data
    }
}

impl From<Bytes> for ByteView {
    fn from(data: Bytes) -> Self {
        Self { data }
    }
}

impl From<Vec<u8>> for ByteView {
    fn from(data: Vec<u8>) -> Self {
        Self {
            data: Bytes::from(data),
        }
    }
}

impl From<&[u8]> for ByteView {
    fn from(data: &[u8]) -> Self {
        Self::copy_from(data)
    }
}

impl From<&str> for ByteView {
    fn from(data: &str) -> Self {
        Self::copy_from(data.as_bytes())
    }
}

impl From<ByteView> for Bytes {
    fn from(view: ByteView) -> Self {
        view.data
    }
}

impl fmt::Debug for ByteView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteView({})", HexKey(&self.data))
    }
}

// ------------------------------------------------------------------------------------------------
// KeyValue
// ------------------------------------------------------------------------------------------------

/// A key with its value, or a tombstone when `value` is `None`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    /// The entry key.
    pub key: ByteView,
    /// The stored value; `None` records a deletion.
    pub value: Option<ByteView>,
}

impl KeyValue {
    /// A live entry.
    pub fn put(key: impl Into<ByteView>, value: impl Into<ByteView>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// A deletion marker for `key`.
    pub fn tombstone(key: impl Into<ByteView>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    /// Returns `true` if this entry records a deletion.
    #[inline]
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Copies key and value out of whatever buffers they share.
    pub fn detach(&self) -> Self {
        Self {
            key: self.key.detach(),
            value: self.value.as_ref().map(ByteView::detach),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Log formatting
// ------------------------------------------------------------------------------------------------

/// Hex rendering of a key for log output; long keys are truncated.
pub(crate) struct HexKey<'a>(pub &'a [u8]);

impl fmt::Display for HexKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() <= 32 {
            for byte in self.0 {
                write!(f, "{:02x}", byte)?;
            }
        } else {
            for byte in &self.0[..16] {
                write!(f, "{:02x}", byte)?;
            }
            write!(f, "...[{} bytes]", self.0.len())?;
        }
        Ok(())
    }
}
