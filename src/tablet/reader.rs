//! Decoding of tablet headers, block envelopes, index blocks, and footers.
//!
//! [`TabletReader`] is stateless apart from its options; it operates on
//! byte slices handed to it by [`FileTablet`](super::FileTablet) or tests.

use bytes::Bytes;

use super::{
    BLOCK_FLAG_COMPRESSED, EnvelopedBlock, FOOTER_SIZE, Footer, IndexEntry,
    TABLET_MAGIC, TabletError, TabletHeader, expect_magic, magic_at,
};
use crate::block::Block;
use crate::encoding::{Decode, Reader};

/// Options controlling how tablets are read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TabletReaderOptions {
    /// Verify each block's CRC32 against the envelope checksum when the
    /// stored checksum is non-zero.
    pub verify_checksums: bool,
}

/// Decoder for the pieces of a tablet file.
#[derive(Debug, Clone, Copy, Default)]
pub struct TabletReader {
    options: TabletReaderOptions,
}

impl TabletReader {
    /// A reader with the given options.
    pub fn new(options: TabletReaderOptions) -> Self {
        Self { options }
    }

    /// The options this reader was built with.
    pub fn options(&self) -> &TabletReaderOptions {
        &self.options
    }

    /// Decodes and validates the 8-byte header.
    pub fn read_header(&self, data: &[u8]) -> Result<TabletHeader, TabletError> {
        expect_magic(magic_at(data, 0)?, TABLET_MAGIC)?;
        let (header, _) = TabletHeader::decode_from(data)?;
        if header.flags < 1 {
            return Err(TabletError::Corrupt(format!(
                "bad header version byte {}",
                header.flags
            )));
        }
        Ok(header)
    }

    /// Decodes an index block of `data.len()` bytes that must open with `magic`.
    ///
    /// Records are read until the whole block is consumed.
    pub fn read_index(&self, data: Bytes, magic: u32) -> Result<Vec<IndexEntry>, TabletError> {
        let mut reader = Reader::new(data);
        expect_magic(reader.read_u32_be()?, magic)?;

        let mut entries = Vec::new();
        while !reader.is_empty() {
            let offset = reader.read_uint()?;
            let length = reader.read_uint()?;
            let first_key = reader.read_raw()?;
            entries.push(IndexEntry {
                offset,
                length,
                first_key,
            });
        }
        Ok(entries)
    }

    /// Decodes a block envelope: checksum, flags, length, then the stored bytes.
    ///
    /// The checksum covers the stored (possibly compressed) bytes and is
    /// only checked when enabled and non-zero.
    pub fn read_block(&self, data: Bytes) -> Result<EnvelopedBlock, TabletError> {
        let mut reader = Reader::new(data.clone());
        let checksum = u32::try_from(reader.read_uint()?)
            .map_err(|_| TabletError::Corrupt("block checksum wider than 32 bits".into()))?;
        let flags = reader.read_uint()?;
        let length = reader.read_uint()? as usize;

        let start = reader.position();
        if reader.remaining() < length {
            return Err(TabletError::Corrupt(format!(
                "block envelope declares {length} bytes, {} available",
                reader.remaining()
            )));
        }
        let stored = data.slice(start..start + length);

        if self.options.verify_checksums && checksum != 0 {
            let computed = crc32fast::hash(&stored);
            if computed != checksum {
                return Err(TabletError::ChecksumMismatch {
                    stored: checksum,
                    computed,
                });
            }
        }

        let bytes = if flags & BLOCK_FLAG_COMPRESSED != 0 {
            Bytes::from(snap::raw::Decoder::new().decompress_vec(&stored)?)
        } else {
            stored
        };

        Ok(EnvelopedBlock {
            checksum,
            flags,
            block: Block::new(bytes)?,
        })
    }

    /// Decodes the 40-byte footer, checking its trailing magic.
    pub fn read_footer(&self, data: &[u8]) -> Result<Footer, TabletError> {
        if data.len() != FOOTER_SIZE {
            return Err(TabletError::BadFooter(format!(
                "footer is {} bytes, expected {FOOTER_SIZE}",
                data.len()
            )));
        }
        expect_magic(magic_at(data, FOOTER_SIZE - 4)?, TABLET_MAGIC)?;
        let (footer, _) = Footer::decode_from(data)?;
        Ok(footer)
    }
}
