//! # Storage Module
//!
//! Named, byte-addressable resources the engine persists into: the write-ahead
//! logs, tablet files, the manifest, and the lock file.
//!
//! ## Design Overview
//!
//! The engine never touches the filesystem directly. It talks to a [`Storage`]
//! backend through names relative to the database root:
//!
//! - [`DiskStorage`]: a directory on disk. Tablets are opened through a
//!   read-only memory map; the lock is an `flock`-style advisory lock.
//! - [`MemStorage`]: an in-process map of names to byte vectors, shareable
//!   between handles so a "reopen" sees the same files.
//!
//! Reads go through [`ReadChannel`] (positional, shared, immutable snapshot);
//! writes go through [`WriteChannel`] (sequential `io::Write` with a position
//! and an explicit sync).
//!
//! # Concurrency model
//!
//! Backends are `Send + Sync`. A [`StorageLock`] excludes other handles (and,
//! for disk, other processes) from opening the same database until dropped.

mod disk;
mod memory;


pub use disk::DiskStorage;
pub use memory::MemStorage;

use std::fmt;
use std::io::{self, Write};

use bytes::Bytes;
use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The named resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Another handle already holds the named lock.
    #[error("Lock already held: {0}")]
    LockHeld(String),

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Channels
// ------------------------------------------------------------------------------------------------

/// Positional read access to an immutable resource.
pub trait ReadChannel: Send + Sync + fmt::Debug {
    /// Total size in bytes.
    fn size(&self) -> u64;

    /// Reads exactly `len` bytes starting at `offset`.
    fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes>;

    /// Reads the whole resource.
    fn read_all(&self) -> io::Result<Bytes> {
        self.read_at(0, self.size() as usize)
    }
}

/// Sequential write access to a resource.
pub trait WriteChannel: Write + Send + Sync + fmt::Debug {
    /// Byte offset the next write lands at.
    fn position(&self) -> u64;

    /// Flushes buffers and makes written bytes durable.
    fn sync(&mut self) -> io::Result<()>;
}

/// Bounds check shared by channel implementations.
pub(crate) fn check_range(size: u64, offset: u64, len: usize) -> io::Result<std::ops::Range<usize>> {
    let end = offset.checked_add(len as u64).filter(|end| *end <= size);
    match end {
        Some(end) => Ok(offset as usize..end as usize),
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("read of {len} bytes at {offset} past end of {size} byte resource"),
        )),
    }
}

// ------------------------------------------------------------------------------------------------
// Lock
// ------------------------------------------------------------------------------------------------

/// Exclusive advisory lock, released when dropped.
pub struct StorageLock {
    name: String,
    _guard: Box<dyn Send + Sync>,
}

impl StorageLock {
    pub(crate) fn new(name: &str, guard: Box<dyn Send + Sync>) -> Self {
        Self {
            name: name.to_string(),
            _guard: guard,
        }
    }

    /// Name of the locked resource.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for StorageLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageLock")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Backend trait
// ------------------------------------------------------------------------------------------------

/// A namespace of byte resources rooted at the database directory.
pub trait Storage: Send + Sync + fmt::Debug {
    /// Creates (or truncates) `name` for writing.
    fn create(&self, name: &str) -> Result<Box<dyn WriteChannel>, StorageError>;

    /// Opens `name` for appending, creating it if missing.
    fn append(&self, name: &str) -> Result<Box<dyn WriteChannel>, StorageError>;

    /// Opens `name` for positional reads.
    fn open(&self, name: &str) -> Result<Box<dyn ReadChannel>, StorageError>;

    /// Returns `true` if `name` exists.
    fn exists(&self, name: &str) -> bool;

    /// Removes `name`.
    fn remove(&self, name: &str) -> Result<(), StorageError>;

    /// Renames `from` to `to`, replacing `to` if present.
    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError>;

    /// Shortens `name` to `len` bytes and makes the new length durable.
    fn truncate(&self, name: &str, len: u64) -> Result<(), StorageError>;

    /// Creates directory `name` and any missing parents.
    fn mkdirs(&self, name: &str) -> Result<(), StorageError>;

    /// Lists the entries directly inside directory `name` ("" for the root).
    fn list(&self, name: &str) -> Result<Vec<String>, StorageError>;

    /// Size of `name` in bytes.
    fn size(&self, name: &str) -> Result<u64, StorageError>;

    /// Takes the exclusive lock `name`; fails immediately if already held.
    fn lock(&self, name: &str) -> Result<StorageLock, StorageError>;

    /// Removes every resource under the root.
    fn destroy(&self) -> Result<(), StorageError>;

    /// Atomically replaces `name` with a newline-delimited list.
    fn store_list(&self, name: &str, items: &[String]) -> Result<(), StorageError> {
        let tmp = format!("{name}.tmp");
        let mut out = self.create(&tmp)?;
        for item in items {
            out.write_all(item.as_bytes())?;
            out.write_all(b"\n")?;
        }
        out.sync()?;
        drop(out);
        self.rename(&tmp, name)
    }

    /// Reads a newline-delimited list; blank lines are skipped.
    fn load_list(&self, name: &str) -> Result<Vec<String>, StorageError> {
        let data = self.open(name)?.read_all()?;
        let text = String::from_utf8(data.to_vec()).map_err(|e| {
            StorageError::Io(io::Error::new(io::ErrorKind::InvalidData, e))
        })?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}
