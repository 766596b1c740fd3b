//! Tablet writer: serializes a sorted stream of entries into the tablet format.
//!
//! [`TabletWriter`] accepts entries in **strictly ascending key order**
//! (tombstones included) and writes header, data blocks, meta index, data
//! index, and footer to any [`Write`] sink.
//!
//! # Block cutting
//!
//! Entries are appended to an in-progress [`BlockWriter`]; once its encoded
//! size exceeds [`TabletWriterOptions::block_size`] the block is sealed and
//! written. A trailing block is only written if it holds entries, so an
//! empty input produces a tablet with an empty data index.
//!
//! # Compression
//!
//! With [`TabletWriterOptions::compression`] enabled each block is
//! Snappy-compressed, and the compressed form is kept only when strictly
//! smaller than the raw block.

use std::io::{self, Write};

use tracing::trace;

use super::{
    BLOCK_FLAG_COMPRESSED, DATA_INDEX_MAGIC, Footer, HEADER_FLAG_PREFIX_COMPRESSED, IndexEntry,
    META_INDEX_MAGIC, TabletError, TabletHeader,
};
use crate::block::{BlockWriter, DEFAULT_RESTART_INTERVAL};
use crate::encoding::{self, Encode};
use crate::view::{ByteView, HexKey, KeyValue, compare};

/// Default target size of an uncompressed data block.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

// ------------------------------------------------------------------------------------------------
// Options
// ------------------------------------------------------------------------------------------------

/// Options controlling how tablets are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TabletWriterOptions {
    /// A block is sealed once its encoded size exceeds this many bytes.
    pub block_size: usize,
    /// Snappy-compress blocks when that makes them smaller.
    pub compression: bool,
    /// Entries between restart points inside a block.
    pub restart_interval: usize,
    /// Reject input whose keys are not strictly ascending.
    pub check_key_order: bool,
}

impl Default for TabletWriterOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            compression: true,
            restart_interval: DEFAULT_RESTART_INTERVAL,
            check_key_order: false,
        }
    }
}

/// Totals reported after a tablet has been written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TabletStats {
    /// Entries written, tombstones included.
    pub entries: u64,
    /// Tombstones written.
    pub tombstones: u64,
    /// Data blocks written.
    pub blocks: u64,
    /// Total bytes written.
    pub size: u64,
}

// ------------------------------------------------------------------------------------------------
// Position tracking
// ------------------------------------------------------------------------------------------------

/// Counts bytes passed through to the underlying sink.
struct PositionWriter<W: Write> {
    inner: W,
    position: u64,
}

impl<W: Write> PositionWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, position: 0 }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data)?;
        self.position += data.len() as u64;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Phase helpers
// ------------------------------------------------------------------------------------------------

/// Writes `[magic BE][flags, 0, 0, 0]`.
fn write_header<W: Write>(out: &mut PositionWriter<W>) -> Result<(), TabletError> {
    let header = TabletHeader {
        flags: HEADER_FLAG_PREFIX_COMPRESSED,
    };
    out.write_all(&encoding::encode_to_vec(&header)?)?;
    Ok(())
}

/// Writes one block envelope and returns `(offset, envelope_length)`.
///
/// `[crc32 uint][flags uint][length uint][stored bytes]`
fn write_envelope<W: Write>(
    out: &mut PositionWriter<W>,
    block: &[u8],
    compression: bool,
    mut flags: u64,
) -> Result<(u64, u64), TabletError> {
    let offset = out.position;

    let compressed = if compression {
        Some(snap::raw::Encoder::new().compress_vec(block)?)
    } else {
        None
    };
    let stored: &[u8] = match &compressed {
        Some(c) if c.len() < block.len() => {
            flags |= BLOCK_FLAG_COMPRESSED;
            c
        }
        _ => block,
    };

    let mut envelope = Vec::with_capacity(32);
    encoding::put_uint(&mut envelope, u64::from(crc32fast::hash(stored)));
    encoding::put_uint(&mut envelope, flags);
    encoding::put_uint(&mut envelope, stored.len() as u64);

    out.write_all(&envelope)?;
    out.write_all(stored)?;

    Ok((offset, out.position - offset))
}

/// Seals the current block, writes it, and records its index entry.
fn flush_data_block<W: Write>(
    out: &mut PositionWriter<W>,
    block: &mut BlockWriter,
    compression: bool,
    index: &mut Vec<IndexEntry>,
) -> Result<(), TabletError> {
    let first_key = match block.first_key() {
        Some(key) => bytes::Bytes::copy_from_slice(key),
        None => return Ok(()),
    };

    let (offset, length) = write_envelope(out, block.finish(), compression, 0)?;
    trace!(
        offset,
        length,
        first_key = %HexKey(&first_key),
        "tablet data block written"
    );

    index.push(IndexEntry {
        offset,
        length,
        first_key,
    });
    block.reset();
    Ok(())
}

/// Writes `[magic BE]` followed by `entries` and returns `(offset, length)`.
fn write_index<W: Write>(
    out: &mut PositionWriter<W>,
    magic: u32,
    entries: &[IndexEntry],
) -> Result<(u64, u64), TabletError> {
    let offset = out.position;
    let mut buf = Vec::with_capacity(4 + entries.len() * 24);
    buf.extend_from_slice(&magic.to_be_bytes());
    for entry in entries {
        entry.encode_to(&mut buf)?;
    }
    out.write_all(&buf)?;
    Ok((offset, out.position - offset))
}

// ------------------------------------------------------------------------------------------------
// TabletWriter
// ------------------------------------------------------------------------------------------------

/// Builds tablets from sorted entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct TabletWriter {
    options: TabletWriterOptions,
}

impl TabletWriter {
    /// A writer with the given options.
    pub fn new(options: TabletWriterOptions) -> Self {
        Self { options }
    }

    /// The options this writer was built with.
    pub fn options(&self) -> &TabletWriterOptions {
        &self.options
    }

    /// Writes a complete tablet containing `entries` to `out`.
    ///
    /// The sink is flushed but not synced; durability is the caller's concern.
    pub fn write<W, I>(&self, out: W, entries: I) -> Result<TabletStats, TabletError>
    where
        W: Write,
        I: IntoIterator<Item = KeyValue>,
    {
        let mut out = PositionWriter::new(out);
        let mut stats = TabletStats::default();

        // 1. Header
        write_header(&mut out)?;

        // 2. Data blocks
        let mut block = BlockWriter::new(self.options.restart_interval)?;
        let mut data_index = Vec::new();
        let mut last_key: Option<ByteView> = None;

        for kv in entries {
            if self.options.check_key_order {
                if let Some(prev) = &last_key {
                    if compare(prev, &kv.key).is_ge() {
                        return Err(TabletError::KeyOrder(format!(
                            "key {} follows {}",
                            HexKey(&kv.key),
                            HexKey(prev)
                        )));
                    }
                }
                last_key = Some(kv.key.clone());
            }

            block.append(&kv.key, kv.value.as_deref())?;
            stats.entries += 1;
            if kv.is_tombstone() {
                stats.tombstones += 1;
            }

            if block.size() > self.options.block_size {
                flush_data_block(&mut out, &mut block, self.options.compression, &mut data_index)?;
            }
        }
        flush_data_block(&mut out, &mut block, self.options.compression, &mut data_index)?;
        stats.blocks = data_index.len() as u64;

        // 3. Meta index (reserved, always empty)
        let (meta_index_offset, meta_index_length) =
            write_index(&mut out, META_INDEX_MAGIC, &[])?;

        // 4. Data index
        let (data_index_offset, data_index_length) =
            write_index(&mut out, DATA_INDEX_MAGIC, &data_index)?;

        // 5. Footer
        let footer = Footer {
            meta_index_offset,
            meta_index_length,
            data_index_offset,
            data_index_length,
        };
        out.write_all(&encoding::encode_to_vec(&footer)?)?;
        out.inner.flush()?;

        stats.size = out.position;
        trace!(
            entries = stats.entries,
            blocks = stats.blocks,
            size = stats.size,
            "tablet written"
        );
        Ok(stats)
    }
}
