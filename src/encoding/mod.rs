//! Deterministic MessagePack-style framing for on-disk persistence.
//!
//! Every length and integer written by the block, tablet, batch, and log
//! layers goes through the primitives in this module, so the byte layout of
//! a tablet or log record is fully determined here.
//!
//! # Wire format
//!
//! | Item                 | Encoding                                              |
//! |----------------------|-------------------------------------------------------|
//! | uint `0x00..=0x7F`   | the byte itself                                       |
//! | uint `<= u8::MAX`    | `0xCC` + 1 byte                                       |
//! | uint `<= u16::MAX`   | `0xCD` + 2 bytes, big-endian                          |
//! | uint `<= u32::MAX`   | `0xCE` + 4 bytes, big-endian                          |
//! | uint (otherwise)     | `0xCF` + 8 bytes, big-endian                          |
//! | raw, len `< 32`      | `0xA0 \| len` + bytes                                 |
//! | raw, len `< 65536`   | `0xDA` + 2-byte big-endian length + bytes             |
//! | raw (otherwise)      | `0xDB` + 4-byte big-endian length + bytes             |
//! | nil                  | `0xC0` (marks a tombstone in place of a value)        |
//!
//! Fixed-width 64-bit fields (the tablet footer) always use the `0xCF` form.
//!
//! # Zero-panic guarantee
//!
//! No function in this module uses `unwrap()`, `expect()`, or any other
//! panicking path.  All errors are propagated via [`EncodingError`].
//!
//! # Convenience helpers
//!
//! ```rust,ignore
//! use tabletdb::encoding::{encode_to_vec, decode_from_slice};
//!
//! let bytes = encode_to_vec(&my_struct)?;
//! let (decoded, consumed) = decode_from_slice::<MyStruct>(&bytes)?;
//! ```
//!
//! Fixed records implement [`Encode`]/[`Decode`]; streams of entries that
//! should share their source buffer are read through the zero-copy [`Reader`].


use bytes::Bytes;
use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Format markers
// ------------------------------------------------------------------------------------------------

/// Nil marker; stands in for a value to record a deletion.
pub const NIL: u8 = 0xC0;

const UINT8: u8 = 0xCC;
const UINT16: u8 = 0xCD;
const UINT32: u8 = 0xCE;
const UINT64: u8 = 0xCF;

const FIXRAW: u8 = 0xA0;
const FIXRAW_MASK: u8 = 0xE0;
const FIXRAW_MAX: usize = 31;
const RAW16: u8 = 0xDA;
const RAW32: u8 = 0xDB;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced during encoding or decoding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// A format marker byte did not match any accepted form.
    #[error("unexpected {expected} flag byte 0x{flag:02X}")]
    InvalidFlag {
        /// The byte that was read.
        flag: u8,
        /// What the decoder was looking for.
        expected: &'static str,
    },

    /// A length exceeded what the wire format can represent.
    #[error("length overflow: {0}")]
    LengthOverflow(String),

    /// Application-level decode error.
    #[error("{0}")]
    Custom(String),
}

// ------------------------------------------------------------------------------------------------
// Core traits
// ------------------------------------------------------------------------------------------------

/// Serialize `self` into a byte buffer.
///
/// Implementations **must** produce deterministic output: the same
/// logical value always yields the exact same byte sequence.
pub trait Encode {
    /// Append the encoded representation of `self` to `buf`.
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Deserialize a value from a byte slice.
///
/// Returns `(value, bytes_consumed)` on success so that callers can
/// advance a cursor through a buffer containing multiple encoded items.
pub trait Decode: Sized {
    /// Decode one value starting at `buf[0]`.
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

// ------------------------------------------------------------------------------------------------
// Convenience functions
// ------------------------------------------------------------------------------------------------

/// Encode a value into a freshly-allocated `Vec<u8>`.
pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

/// Decode a value from the beginning of `buf`.
///
/// Returns `(value, bytes_consumed)`.
pub fn decode_from_slice<T: Decode>(buf: &[u8]) -> Result<(T, usize), EncodingError> {
    T::decode_from(buf)
}

// ------------------------------------------------------------------------------------------------
// Internal helpers
// ------------------------------------------------------------------------------------------------

/// Verify that `buf` has at least `needed` bytes, returning
/// [`EncodingError::UnexpectedEof`] if not.
#[inline]
fn require(buf: &[u8], needed: usize) -> Result<(), EncodingError> {
    if buf.len() < needed {
        Err(EncodingError::UnexpectedEof {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

#[inline]
fn be_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

#[inline]
fn be_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

#[inline]
fn be_u64(buf: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[..8]);
    u64::from_be_bytes(bytes)
}

// ------------------------------------------------------------------------------------------------
// Writers
// ------------------------------------------------------------------------------------------------

/// Append an unsigned integer in its smallest form.
pub fn put_uint(buf: &mut Vec<u8>, value: u64) {
    if value <= 0x7F {
        buf.push(value as u8);
    } else if value <= u8::MAX as u64 {
        buf.push(UINT8);
        buf.push(value as u8);
    } else if value <= u16::MAX as u64 {
        buf.push(UINT16);
        buf.extend_from_slice(&(value as u16).to_be_bytes());
    } else if value <= u32::MAX as u64 {
        buf.push(UINT32);
        buf.extend_from_slice(&(value as u32).to_be_bytes());
    } else {
        put_uint64(buf, value);
    }
}

/// Append an unsigned integer in the fixed 9-byte `0xCF` form.
pub fn put_uint64(buf: &mut Vec<u8>, value: u64) {
    buf.push(UINT64);
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Append the framing header for a raw byte string of `len` bytes.
pub fn put_raw_len(buf: &mut Vec<u8>, len: usize) -> Result<(), EncodingError> {
    if len <= FIXRAW_MAX {
        buf.push(FIXRAW | len as u8);
    } else if len <= u16::MAX as usize {
        buf.push(RAW16);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        let len = u32::try_from(len)
            .map_err(|_| EncodingError::LengthOverflow(format!("raw length {len} exceeds u32::MAX")))?;
        buf.push(RAW32);
        buf.extend_from_slice(&len.to_be_bytes());
    }
    Ok(())
}

/// Append a length-prefixed raw byte string.
pub fn put_raw(buf: &mut Vec<u8>, data: &[u8]) -> Result<(), EncodingError> {
    put_raw_len(buf, data.len())?;
    buf.extend_from_slice(data);
    Ok(())
}

/// Append the nil marker.
#[inline]
pub fn put_nil(buf: &mut Vec<u8>) {
    buf.push(NIL);
}

/// Append a value, or the nil marker when `value` is `None`.
pub fn put_raw_or_nil(buf: &mut Vec<u8>, value: Option<&[u8]>) -> Result<(), EncodingError> {
    match value {
        Some(data) => put_raw(buf, data),
        None => {
            put_nil(buf);
            Ok(())
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Readers
// ------------------------------------------------------------------------------------------------

/// Decode an unsigned integer in any of its forms.
///
/// Returns `(value, bytes_consumed)`.
pub fn get_uint(buf: &[u8]) -> Result<(u64, usize), EncodingError> {
    require(buf, 1)?;
    match buf[0] {
        flag @ 0x00..=0x7F => Ok((flag as u64, 1)),
        UINT8 => {
            require(buf, 2)?;
            Ok((buf[1] as u64, 2))
        }
        UINT16 => {
            require(buf, 3)?;
            Ok((be_u16(&buf[1..]) as u64, 3))
        }
        UINT32 => {
            require(buf, 5)?;
            Ok((be_u32(&buf[1..]) as u64, 5))
        }
        UINT64 => {
            require(buf, 9)?;
            Ok((be_u64(&buf[1..]), 9))
        }
        flag => Err(EncodingError::InvalidFlag {
            flag,
            expected: "uint",
        }),
    }
}

/// Decode a raw framing header.
///
/// Returns `(Some(len), header_len)` for a byte string, `(None, 1)` for nil.
pub fn get_raw_len(buf: &[u8]) -> Result<(Option<usize>, usize), EncodingError> {
    require(buf, 1)?;
    match buf[0] {
        NIL => Ok((None, 1)),
        flag if flag & FIXRAW_MASK == FIXRAW => Ok((Some((flag & !FIXRAW_MASK) as usize), 1)),
        RAW16 => {
            require(buf, 3)?;
            Ok((Some(be_u16(&buf[1..]) as usize), 3))
        }
        RAW32 => {
            require(buf, 5)?;
            Ok((Some(be_u32(&buf[1..]) as usize), 5))
        }
        flag => Err(EncodingError::InvalidFlag {
            flag,
            expected: "raw",
        }),
    }
}

/// Decode a raw byte string or nil, borrowing from `buf`.
///
/// Returns `(Some(bytes), consumed)` or `(None, 1)` for nil.
pub fn get_raw_or_nil(buf: &[u8]) -> Result<(Option<&[u8]>, usize), EncodingError> {
    match get_raw_len(buf)? {
        (None, header) => Ok((None, header)),
        (Some(len), header) => {
            require(&buf[header..], len)?;
            Ok((Some(&buf[header..header + len]), header + len))
        }
    }
}

/// Decode a raw byte string, borrowing from `buf`. Nil is rejected.
pub fn get_raw(buf: &[u8]) -> Result<(&[u8], usize), EncodingError> {
    match get_raw_or_nil(buf)? {
        (Some(data), consumed) => Ok((data, consumed)),
        (None, _) => Err(EncodingError::InvalidFlag {
            flag: NIL,
            expected: "raw",
        }),
    }
}

// ------------------------------------------------------------------------------------------------
// Zero-copy cursor
// ------------------------------------------------------------------------------------------------

/// Forward cursor over a shared buffer.
///
/// Raw byte strings are returned as sub-slices of the same [`Bytes`]
/// allocation, so decoded keys and values keep the source buffer alive
/// instead of copying out of it.
#[derive(Debug, Clone)]
pub struct Reader {
    data: Bytes,
    pos: usize,
}

impl Reader {
    /// Cursor positioned at the start of `data`.
    pub fn new(data: Bytes) -> Self {
        Self { data, pos: 0 }
    }

    /// Cursor positioned at `pos` inside `data`.
    pub fn at(data: Bytes, pos: usize) -> Self {
        Self { data, pos }
    }

    /// Current byte offset.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left after the cursor.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Returns `true` once every byte has been consumed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    #[inline]
    fn rest(&self) -> &[u8] {
        self.data.get(self.pos..).unwrap_or_default()
    }

    /// Read an unsigned integer.
    pub fn read_uint(&mut self) -> Result<u64, EncodingError> {
        let (value, n) = get_uint(self.rest())?;
        self.pos += n;
        Ok(value)
    }

    /// Read a big-endian `u32` (magics, restart offsets).
    pub fn read_u32_be(&mut self) -> Result<u32, EncodingError> {
        let rest = self.rest();
        require(rest, 4)?;
        let value = be_u32(rest);
        self.pos += 4;
        Ok(value)
    }

    /// Read a raw byte string or nil.
    pub fn read_raw_or_nil(&mut self) -> Result<Option<Bytes>, EncodingError> {
        match get_raw_len(self.rest())? {
            (None, header) => {
                self.pos += header;
                Ok(None)
            }
            (Some(len), header) => {
                let start = self.pos + header;
                require(self.data.get(start..).unwrap_or_default(), len)?;
                self.pos = start + len;
                Ok(Some(self.data.slice(start..start + len)))
            }
        }
    }

    /// Read a raw byte string. Nil is rejected.
    pub fn read_raw(&mut self) -> Result<Bytes, EncodingError> {
        let at = self.pos;
        match self.read_raw_or_nil()? {
            Some(data) => Ok(data),
            None => {
                self.pos = at;
                Err(EncodingError::InvalidFlag {
                    flag: NIL,
                    expected: "raw",
                })
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Trait implementations
// ------------------------------------------------------------------------------------------------

impl Encode for u64 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        put_uint(buf, *self);
        Ok(())
    }
}

impl Decode for u64 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        get_uint(buf)
    }
}

impl Encode for Vec<u8> {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        put_raw(buf, self)
    }
}

impl Decode for Vec<u8> {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (data, consumed) = get_raw(buf)?;
        Ok((data.to_vec(), consumed))
    }
}

/// Encode a byte slice as a raw byte string.
impl Encode for &[u8] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        put_raw(buf, self)
    }
}

/// `None` is written as the nil marker.
impl Encode for Option<Vec<u8>> {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        put_raw_or_nil(buf, self.as_deref())
    }
}

impl Decode for Option<Vec<u8>> {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (data, consumed) = get_raw_or_nil(buf)?;
        Ok((data.map(<[u8]>::to_vec), consumed))
    }
}
