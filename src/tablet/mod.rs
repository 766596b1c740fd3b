//! Tablet Module
//!
//! This module implements the **immutable**, **sorted**, on-disk table format ("tablet") that
//! memtables are flushed into. A tablet is a sequence of prefix-compressed [`Block`]s followed by
//! two index blocks and a fixed-size footer.
//!
//! ## Design Overview
//!
//! Entries are written in strictly ascending key order and cut into blocks of roughly
//! [`TabletWriterOptions::block_size`] bytes. Each block is stored inside an **envelope** that
//! records a CRC32 of the stored bytes, whether the bytes are Snappy-compressed, and their length.
//! Compression is decided per block (only kept when strictly smaller), so the per-block flag is
//! authoritative; the header flag only states that keys are prefix-compressed.
//!
//! The **data index** holds one record per data block: envelope offset, envelope length, and the
//! block's first key. Readers binary-search it to pick the block a lookup starts in. The **meta
//! index** is reserved and always empty.
//!
//! # On-disk layout
//!
//! ```text
//! [MAGIC u32 BE][FLAGS: 0x01 00 00 00]                             <- header, 8 bytes
//! [crc32 uint][flags uint][len uint][block bytes (len)]             <- data block 0
//! ...
//! [META_INDEX_MAGIC u32 BE]                                         <- meta index
//! [DATA_INDEX_MAGIC u32 BE]([offset uint][length uint][first key raw])*  <- data index
//! [0xCF meta off][0xCF meta len][0xCF data off][0xCF data len][MAGIC u32 BE]  <- footer, 40 bytes
//! ```
//!
//! # Sub-modules
//!
//! - [`builder`]: [`TabletWriter`] for serializing sorted entries.
//! - [`reader`]: [`TabletReader`] for decoding headers, envelopes, indexes, and footers.
//! - [`file`]: [`FileTablet`] for lazy, random-access reads through a storage channel.
//!
//! # Concurrency model
//!
//! - Tablets are **immutable**; a [`FileTablet`] is cheap to clone and safe to share.
//! - Iterators own a handle to the tablet, so they outlive any engine lock.
//!
//! # Guarantees
//!
//! - **Integrity:** every block envelope carries a CRC32 that readers verify on request.
//! - **Round-trip:** `FileTablet::find(None)` reproduces the written sequence exactly.
//! - **Corruption is loud:** bad magics, short footers, and malformed envelopes are errors.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod builder;
pub mod file;
pub mod reader;

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Re-exports: public API surface
// ------------------------------------------------------------------------------------------------

pub use builder::{TabletStats, TabletWriter, TabletWriterOptions};
pub use file::{FileTablet, TabletIter};
pub use reader::{TabletReader, TabletReaderOptions};

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::io;

use bytes::Bytes;
use thiserror::Error;

use crate::block::{Block, BlockError};
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::storage::StorageError;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Magic number at the start of the header and the end of the footer.
pub const TABLET_MAGIC: u32 = 0x0B50_1E7E;

/// Magic number opening the meta index block.
pub const META_INDEX_MAGIC: u32 = 0x0EA7_DA7A;

/// Magic number opening the data index block.
pub const DATA_INDEX_MAGIC: u32 = 0xDA7A_BA5E;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 8;

/// Footer size in bytes: four 9-byte uint64 fields and the magic.
pub const FOOTER_SIZE: usize = 40;

/// Header flag: keys inside blocks are prefix-compressed.
pub const HEADER_FLAG_PREFIX_COMPRESSED: u8 = 0x01;

/// Envelope flag: block bytes are Snappy-compressed.
pub const BLOCK_FLAG_COMPRESSED: u64 = 0x01;

/// Envelope flag: block belongs to the meta section.
pub const BLOCK_FLAG_META: u64 = 0x02;

const U32_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by tablet operations (write, open, read).
#[derive(Debug, Error)]
pub enum TabletError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error from the storage backend.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Framing could not be decoded.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A data block is malformed.
    #[error("Block error: {0}")]
    Block(#[from] BlockError),

    /// Snappy compression or decompression failed.
    #[error("Compression error: {0}")]
    Compression(#[from] snap::Error),

    /// A magic number did not match.
    #[error("Bad magic: expected {expected:#010X}, found {found:#010X}")]
    BadMagic {
        /// Magic required at this position.
        expected: u32,
        /// Magic actually read.
        found: u32,
    },

    /// The footer is missing or inconsistent with the file.
    #[error("Bad footer: {0}")]
    BadFooter(String),

    /// A block's stored checksum does not match its bytes.
    #[error("Checksum mismatch: stored {stored:#010X}, computed {computed:#010X}")]
    ChecksumMismatch {
        /// Checksum recorded in the envelope.
        stored: u32,
        /// Checksum of the bytes read.
        computed: u32,
    },

    /// Structural corruption outside a block.
    #[error("Corrupt tablet: {0}")]
    Corrupt(String),

    /// Input keys were not strictly ascending.
    #[error("Key order violation: {0}")]
    KeyOrder(String),
}

// ------------------------------------------------------------------------------------------------
// Header
// ------------------------------------------------------------------------------------------------

/// The 8-byte tablet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TabletHeader {
    /// Flag bits; see [`HEADER_FLAG_PREFIX_COMPRESSED`].
    pub flags: u8,
}

impl Encode for TabletHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&TABLET_MAGIC.to_be_bytes());
        buf.extend_from_slice(&[self.flags, 0, 0, 0]);
        Ok(())
    }
}

impl Decode for TabletHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        if buf.len() < HEADER_SIZE {
            return Err(EncodingError::UnexpectedEof {
                needed: HEADER_SIZE,
                available: buf.len(),
            });
        }
        Ok((Self { flags: buf[4] }, HEADER_SIZE))
    }
}

// ------------------------------------------------------------------------------------------------
// Index
// ------------------------------------------------------------------------------------------------

/// Location of one block plus the first key it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// File offset of the block envelope.
    pub offset: u64,
    /// Length of the whole envelope in bytes.
    pub length: u64,
    /// First key stored in the block.
    pub first_key: Bytes,
}

impl Encode for IndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::put_uint(buf, self.offset);
        encoding::put_uint(buf, self.length);
        encoding::put_raw(buf, &self.first_key)
    }
}

// ------------------------------------------------------------------------------------------------
// Footer
// ------------------------------------------------------------------------------------------------

/// The fixed 40-byte footer locating both index blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Footer {
    /// File offset of the meta index block.
    pub meta_index_offset: u64,
    /// Length of the meta index block, magic included.
    pub meta_index_length: u64,
    /// File offset of the data index block.
    pub data_index_offset: u64,
    /// Length of the data index block, magic included.
    pub data_index_length: u64,
}

impl Encode for Footer {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::put_uint64(buf, self.meta_index_offset);
        encoding::put_uint64(buf, self.meta_index_length);
        encoding::put_uint64(buf, self.data_index_offset);
        encoding::put_uint64(buf, self.data_index_length);
        buf.extend_from_slice(&TABLET_MAGIC.to_be_bytes());
        Ok(())
    }
}

impl Decode for Footer {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let mut fields = [0u64; 4];
        for field in fields.iter_mut() {
            let (value, n) = encoding::get_uint(&buf[offset..])?;
            *field = value;
            offset += n;
        }
        if buf.len() < offset + U32_SIZE {
            return Err(EncodingError::UnexpectedEof {
                needed: offset + U32_SIZE,
                available: buf.len(),
            });
        }
        let [meta_index_offset, meta_index_length, data_index_offset, data_index_length] = fields;
        Ok((
            Self {
                meta_index_offset,
                meta_index_length,
                data_index_offset,
                data_index_length,
            },
            offset + U32_SIZE,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Reads the big-endian magic at `buf[at..at + 4]`.
fn magic_at(buf: &[u8], at: usize) -> Result<u32, TabletError> {
    match buf.get(at..at + U32_SIZE) {
        Some(bytes) => Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        None => Err(TabletError::Encoding(EncodingError::UnexpectedEof {
            needed: at + U32_SIZE,
            available: buf.len(),
        })),
    }
}

/// Checks a magic number, naming both values on mismatch.
fn expect_magic(found: u32, expected: u32) -> Result<(), TabletError> {
    if found != expected {
        return Err(TabletError::BadMagic { expected, found });
    }
    Ok(())
}

/// Decoded block plus the envelope fields it was stored with.
#[derive(Debug, Clone)]
pub struct EnvelopedBlock {
    /// Envelope checksum (0 when none was recorded).
    pub checksum: u32,
    /// Envelope flag bits.
    pub flags: u64,
    /// The decoded, decompressed block.
    pub block: Block,
}
