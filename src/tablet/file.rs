//! Random-access tablet reads through a storage [`ReadChannel`].
//!
//! Opening a [`FileTablet`] reads only the footer and both index blocks.
//! Data blocks are loaded one at a time as a [`TabletIter`] advances.

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use super::{
    DATA_INDEX_MAGIC, FOOTER_SIZE, Footer, IndexEntry, META_INDEX_MAGIC, TabletError,
    TabletReader, TabletReaderOptions,
};
use crate::block::{Block, BlockIter};
use crate::storage::ReadChannel;
use crate::view::{KeyValue, compare};

struct TabletInner {
    channel: Box<dyn ReadChannel>,
    reader: TabletReader,
    footer: Footer,
    meta_index: Vec<IndexEntry>,
    data_index: Vec<IndexEntry>,
}

/// An immutable tablet backed by a read channel.
///
/// Clones share the channel and the decoded indexes.
#[derive(Clone)]
pub struct FileTablet {
    inner: Arc<TabletInner>,
}

impl fmt::Debug for FileTablet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileTablet")
            .field("size", &self.inner.channel.size())
            .field("blocks", &self.inner.data_index.len())
            .finish_non_exhaustive()
    }
}

/// Reads `length` bytes at `offset`, reporting short reads as corruption of `what`.
/// Any other I/O failure is passed through unchanged.
fn read_region(
    channel: &dyn ReadChannel,
    offset: u64,
    length: u64,
    what: &str,
) -> Result<Bytes, TabletError> {
    let length = usize::try_from(length)
        .map_err(|_| TabletError::Corrupt(format!("{what} length {length} out of range")))?;
    channel.read_at(offset, length).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => {
            TabletError::Corrupt(format!("{what} at {offset}+{length} out of range: {e}"))
        }
        _ => TabletError::Io(e),
    })
}

impl FileTablet {
    /// Opens a tablet by reading its footer and indexes.
    pub fn open(
        channel: Box<dyn ReadChannel>,
        options: TabletReaderOptions,
    ) -> Result<Self, TabletError> {
        let reader = TabletReader::new(options);
        let size = channel.size();
        if size < FOOTER_SIZE as u64 {
            return Err(TabletError::BadFooter(format!(
                "tablet of {size} bytes is shorter than its footer"
            )));
        }

        let footer_bytes = channel.read_at(size - FOOTER_SIZE as u64, FOOTER_SIZE)?;
        let footer = reader.read_footer(&footer_bytes)?;

        let meta_index = reader.read_index(
            read_region(
                channel.as_ref(),
                footer.meta_index_offset,
                footer.meta_index_length,
                "meta index",
            )?,
            META_INDEX_MAGIC,
        )?;
        let data_index = reader.read_index(
            read_region(
                channel.as_ref(),
                footer.data_index_offset,
                footer.data_index_length,
                "data index",
            )?,
            DATA_INDEX_MAGIC,
        )?;

        trace!(size, blocks = data_index.len(), "tablet opened");

        Ok(Self {
            inner: Arc::new(TabletInner {
                channel,
                reader,
                footer,
                meta_index,
                data_index,
            }),
        })
    }

    /// The decoded footer.
    pub fn footer(&self) -> &Footer {
        &self.inner.footer
    }

    /// One entry per data block, in key order.
    pub fn index(&self) -> &[IndexEntry] {
        &self.inner.data_index
    }

    /// The meta index entries (always empty for tablets written by this crate).
    pub fn meta_index(&self) -> &[IndexEntry] {
        &self.inner.meta_index
    }

    /// Size of the underlying file in bytes.
    pub fn size(&self) -> u64 {
        self.inner.channel.size()
    }

    /// Loads and decodes data block `index`.
    pub fn block(&self, index: usize) -> Result<Block, TabletError> {
        self.inner.load_block(index)
    }

    /// Loads every data block in order.
    pub fn blocks(&self) -> Result<Vec<Block>, TabletError> {
        (0..self.inner.data_index.len())
            .map(|i| self.inner.load_block(i))
            .collect()
    }

    /// Iterates entries with key `>= term`, or every entry when `term` is
    /// `None` or empty. Tombstones are yielded.
    pub fn find(&self, term: Option<&[u8]>) -> Result<TabletIter, TabletError> {
        let index = &self.inner.data_index;
        if index.is_empty() {
            return Ok(TabletIter::exhausted(Arc::clone(&self.inner)));
        }

        let (start, current) = match term {
            Some(term) if !term.is_empty() => {
                let start = match index.binary_search_by(|e| compare(&e.first_key, term)) {
                    Ok(i) => i,
                    Err(0) => 0,
                    Err(i) => i - 1,
                };
                (start, self.inner.load_block(start)?.find(Some(term))?)
            }
            _ => (0, self.inner.load_block(0)?.iter()),
        };

        Ok(TabletIter {
            tablet: Arc::clone(&self.inner),
            next_block: start + 1,
            current: Some(current),
            failed: false,
        })
    }
}

impl TabletInner {
    fn load_block(&self, index: usize) -> Result<Block, TabletError> {
        let entry = self.data_index.get(index).ok_or_else(|| {
            TabletError::Corrupt(format!(
                "block {index} out of range ({} blocks)",
                self.data_index.len()
            ))
        })?;
        let data = read_region(self.channel.as_ref(), entry.offset, entry.length, "data block")?;
        Ok(self.reader.read_block(data)?.block)
    }
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

/// Forward iterator over a tablet, loading blocks lazily.
///
/// Holds its own handle on the tablet, so it stays valid after the
/// [`FileTablet`] it came from is dropped. Yields at most one error.
pub struct TabletIter {
    tablet: Arc<TabletInner>,
    next_block: usize,
    current: Option<BlockIter>,
    failed: bool,
}

impl TabletIter {
    fn exhausted(tablet: Arc<TabletInner>) -> Self {
        Self {
            tablet,
            next_block: 0,
            current: None,
            failed: true,
        }
    }
}

impl fmt::Debug for TabletIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TabletIter")
            .field("next_block", &self.next_block)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl Iterator for TabletIter {
    type Item = Result<KeyValue, TabletError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(current) = self.current.as_mut() {
                match current.next() {
                    Some(Ok(kv)) => return Some(Ok(kv)),
                    Some(Err(e)) => {
                        self.failed = true;
                        return Some(Err(e.into()));
                    }
                    None => self.current = None,
                }
            }

            if self.next_block >= self.tablet.data_index.len() {
                return None;
            }
            match self.tablet.load_block(self.next_block) {
                Ok(block) => {
                    self.next_block += 1;
                    self.current = Some(block.iter());
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
