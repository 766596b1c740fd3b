//! # Storage Engine
//!
//! This module ties the write-ahead log, the memtables, and the tablet stack
//! into one **crash-safe**, ordered key-value store with an **asynchronous**
//! flush.
//!
//! ## Design Overview
//!
//! The engine holds three kinds of sources, queried newest-first:
//!
//! 1. **Mutable memtable**: receives every applied batch, backed by
//!    [`LOG_FILE`].
//! 2. **Saving memtable**: the previous mutable table while it is being
//!    written to a tablet, backed by [`SAVING_LOG_FILE`]. At most one exists.
//! 3. **Tablets**: immutable files listed in the manifest, oldest first.
//!
//! A batch is appended to the log first, then applied to the mutable table.
//! When the mutable table reaches [`EngineConfig::max_mutable_tablet_size`]
//! and no flush is in flight, the engine *rotates*: the log is renamed to the
//! secondary name, a new empty log and table are installed, and the old table
//! becomes `saving`. [`Engine::run_flush`] then writes `saving` to a tablet
//! without holding the state lock, and *publishes* it: the tablet is pushed
//! onto the stack, the manifest is rewritten, `saving` is cleared, and the
//! secondary log is removed.
//!
//! ## Concurrency Model
//!
//! All engine state is protected by a single `Arc<RwLock<EngineInner>>`.
//! Writes, rotation, and publication take the **write lock**. Reads take a
//! **read lock** only long enough to clone handles on the current sources;
//! their iterators own those handles and run without any lock.
//!
//! [`Engine::run_flush`] must not run concurrently with itself; the database
//! handle runs it on a single background worker.
//!
//! ## Guarantees
//!
//! - **Durability:** every batch is in the log before it is visible.
//! - **Crash recovery:** [`Engine::open`] replays the primary log into the
//!   mutable table and, if present, the secondary log into `saving`, which
//!   is then flushed again.
//! - **Shadowing:** a key is reported from its newest source only; deleted
//!   keys never appear.
//! - **No lost writes on flush failure:** a failed flush keeps `saving` and
//!   its log; it is retried by the next write past the threshold or by an
//!   explicit flush.

pub mod merge;

#[cfg(test)]
mod tests;

use std::io::{self, Read};
use std::mem;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::batch::{Batch, BatchError};
use crate::manifest::{
    LOCK_FILE, LOG_FILE, Manifest, ManifestError, SAVING_LOG_FILE, tablet_number,
};
use crate::memtable::{MemTable, Value};
use crate::storage::{Storage, StorageError, StorageLock, WriteChannel};
use crate::tablet::{
    FileTablet, TabletError, TabletReaderOptions, TabletWriter, TabletWriterOptions,
};
use crate::view::{ByteView, HexKey, KeyValue, is_prefix};
use crate::wal::{LogReader, LogWriter, WalError};

pub use merge::{MergeIterator, Predicate, Source};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Error from the storage backend.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Error from the manifest.
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Error reading or writing a tablet.
    #[error("Tablet error: {0}")]
    Tablet(#[from] TabletError),

    /// Error writing or replaying a log.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Malformed batch.
    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No live value is stored under the key.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// The engine has been closed.
    #[error("Engine is closed")]
    Closed,

    /// Internal invariant violation (poisoned lock, missing log, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for an [`Engine`] instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Mutable table size (key + value bytes) that triggers a flush.
    pub max_mutable_tablet_size: usize,

    /// Options for tablets written by flushes.
    pub writer: TabletWriterOptions,

    /// Options for every tablet the engine opens.
    pub reader: TabletReaderOptions,

    /// Sync the log after every batch.
    pub sync_log: bool,

    /// Remove every file of the database on [`Engine::close`].
    pub delete_on_close: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_mutable_tablet_size: 4 * 1024 * 1024,
            writer: TabletWriterOptions {
                check_key_order: true,
                ..TabletWriterOptions::default()
            },
            reader: TabletReaderOptions::default(),
            sync_log: true,
            delete_on_close: false,
        }
    }
}

/// Snapshot of engine statistics returned by [`Engine::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    /// Tablet names, oldest first.
    pub tablets: Vec<String>,
    /// Sum of all tablet file sizes in bytes.
    pub tablet_bytes: u64,
    /// Byte size of the mutable table.
    pub mutable_size: usize,
    /// Distinct keys in the mutable table.
    pub mutable_entries: usize,
    /// Distinct keys in the saving table, if one exists.
    pub saving_entries: Option<usize>,
    /// Current flush state.
    pub flush_state: FlushState,
}

// ------------------------------------------------------------------------------------------------
// State
// ------------------------------------------------------------------------------------------------

/// Progress of the single flush slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    /// No saving table.
    Idle,
    /// A saving table exists and a tablet write is scheduled or running.
    InFlight,
    /// The last tablet write for the saving table failed; nothing is scheduled.
    Failed,
}

/// The table being written to a tablet, with the name it will be published under.
struct Saving {
    table: Arc<MemTable>,
    name: String,
}

struct EngineInner {
    storage: Arc<dyn Storage>,

    /// Held for the engine's lifetime; `None` once closed.
    lock: Option<StorageLock>,

    manifest: Manifest,

    /// Receives every applied batch.
    mutable: Arc<MemTable>,

    /// Previous mutable table while it is being flushed.
    saving: Option<Saving>,

    /// Open tablets, in manifest order (oldest first).
    tablets: Vec<FileTablet>,

    /// Writer for [`LOG_FILE`]; `None` once closed.
    log: Option<LogWriter<Box<dyn WriteChannel>>>,

    flush_state: FlushState,

    config: EngineConfig,

    closed: bool,
}

/// Handles on the sources visible at one instant.
struct Snapshot {
    mutable: Arc<MemTable>,
    saving: Option<Arc<MemTable>>,
    tablets: Vec<FileTablet>,
}

/// The storage engine handle.
///
/// Thread-safe: can be cloned and shared across threads via the
/// internal `Arc<RwLock<_>>`.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<RwLock<EngineInner>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Opens the primary log for writing, continuing it when it already exists.
fn open_log(
    storage: &dyn Storage,
    existed: bool,
) -> Result<LogWriter<Box<dyn WriteChannel>>, StorageError> {
    let channel = if existed {
        storage.append(LOG_FILE)?
    } else {
        storage.create(LOG_FILE)?
    };
    let position = channel.position();
    Ok(LogWriter::new(channel, position))
}

/// Writes one batch to the log and pushes it to the sink.
fn append_transaction(
    log: &mut LogWriter<Box<dyn WriteChannel>>,
    batch: &Batch,
    sync: bool,
) -> Result<(), EngineError> {
    log.write_transaction(batch.as_bytes())?;
    log.flush()?;
    if sync {
        log.get_mut().sync()?;
    }
    Ok(())
}

/// Rebuilds a memtable from every transaction in log `name`.
///
/// Also returns the offset just past the last complete transaction.
fn replay_log(storage: &dyn Storage, name: &str) -> Result<(MemTable, u64), EngineError> {
    // Copied out of the file mapping: the log keeps growing and is later unlinked.
    let data = storage.open(name)?.read_all()?;
    let data = bytes::Bytes::copy_from_slice(&data);

    let table = MemTable::new();
    let mut transactions = 0usize;
    let mut reader = LogReader::new(data).transactions();
    for transaction in reader.by_ref() {
        table.apply(&Batch::wrap(transaction?))?;
        transactions += 1;
    }
    let end = reader.position();
    info!(name, transactions, entries = table.len(), end, "log replayed");
    Ok((table, end))
}

/// Writes `table` to a new tablet `name` and opens it.
fn write_tablet(
    storage: &dyn Storage,
    name: &str,
    table: &MemTable,
    writer: TabletWriterOptions,
    reader: TabletReaderOptions,
) -> Result<FileTablet, EngineError> {
    let mut out = storage.create(name)?;
    let stats = TabletWriter::new(writer).write(&mut out, table.find(None))?;
    out.sync()?;
    drop(out);

    if !storage.exists(name) {
        return Err(EngineError::Internal(format!(
            "tablet {name} missing after write"
        )));
    }

    debug!(
        name,
        entries = stats.entries,
        tombstones = stats.tombstones,
        blocks = stats.blocks,
        size = stats.size,
        "tablet written"
    );
    Ok(FileTablet::open(storage.open(name)?, reader)?)
}

impl Engine {
    // --------------------------------------------------------------------------------------------
    // Lock helpers
    // --------------------------------------------------------------------------------------------

    /// Acquires a read lock on the engine state.
    fn read_lock(&self) -> Result<RwLockReadGuard<'_, EngineInner>, EngineError> {
        self.inner
            .read()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    /// Acquires a write lock on the engine state.
    fn write_lock(&self) -> Result<RwLockWriteGuard<'_, EngineInner>, EngineError> {
        self.inner
            .write()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Opens (or creates) an engine in `storage`.
    ///
    /// Fails with [`StorageError::LockHeld`] if another handle has the
    /// database open. A saving table recovered from the secondary log leaves
    /// the engine in [`FlushState::InFlight`]; the caller is expected to run
    /// [`Engine::run_flush`].
    pub fn open(storage: Arc<dyn Storage>, config: EngineConfig) -> Result<Self, EngineError> {
        // 1. Exclusive lock.
        let lock = storage.lock(LOCK_FILE)?;

        // 2. Primary log → mutable table.
        let log_existed = storage.exists(LOG_FILE);
        let mutable = if log_existed {
            let (table, end) = replay_log(storage.as_ref(), LOG_FILE)?;
            // A header-sized remnant of a failed write ends replay quietly,
            // but appending behind it would break the next replay.
            let size = storage.size(LOG_FILE)?;
            if size > end {
                warn!(size, end, "cutting partial record off the log tail");
                storage.truncate(LOG_FILE, end)?;
            }
            table
        } else {
            MemTable::new()
        };
        let log = open_log(storage.as_ref(), log_existed)?;

        // 3. Manifest and tablets.
        let mut manifest = Manifest::load(Arc::clone(&storage))?;
        let mut tablets = Vec::with_capacity(manifest.tablets().len());
        for name in manifest.tablets() {
            tablets.push(FileTablet::open(storage.open(name)?, config.reader)?);
        }

        // 4. Flushed tablets never published are leftovers of an interrupted flush.
        for name in storage.list("")? {
            if tablet_number(&name).is_some() && !manifest.contains(&name) {
                warn!(name, "removing unpublished tablet");
                storage.remove(&name)?;
            }
        }

        // 5. Secondary log → saving table, flushed again.
        let (saving, flush_state) = if storage.exists(SAVING_LOG_FILE) {
            let (table, _) = replay_log(storage.as_ref(), SAVING_LOG_FILE)?;
            let saving = Saving {
                table: Arc::new(table),
                name: manifest.allocate_name(),
            };
            (Some(saving), FlushState::InFlight)
        } else {
            (None, FlushState::Idle)
        };

        info!(
            tablets = tablets.len(),
            mutable_entries = mutable.len(),
            recovered_saving = saving.is_some(),
            "engine opened"
        );

        let inner = EngineInner {
            storage,
            lock: Some(lock),
            manifest,
            mutable: Arc::new(mutable),
            saving,
            tablets,
            log: Some(log),
            flush_state,
            config,
            closed: false,
        };

        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
        })
    }

    /// Closes the log, drops the memtables, and releases the lock.
    ///
    /// Pending memtable contents stay in the logs and are recovered by the
    /// next [`Engine::open`]. With `delete_on_close` every file is removed.
    /// Calling `close` more than once is harmless.
    pub fn close(&self) -> Result<(), EngineError> {
        let mut inner = self.write_lock()?;
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;

        if let Some(mut log) = inner.log.take() {
            log.flush()?;
            log.get_mut().sync()?;
        }

        inner.mutable.close();
        if let Some(saving) = inner.saving.take() {
            saving.table.close();
        }
        inner.tablets.clear();
        inner.lock = None;

        if inner.config.delete_on_close {
            inner.storage.destroy()?;
            info!("engine closed, database removed");
        } else {
            info!("engine closed");
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Write path
    // --------------------------------------------------------------------------------------------

    /// Logs and applies `batch` atomically.
    ///
    /// Returns `Ok(true)` when a flush has been started (or a failed one
    /// re-armed) and the caller should run [`Engine::run_flush`]. An empty
    /// batch is a no-op.
    ///
    /// If the log write fails, the partial record is cut off the log and the
    /// batch is not applied. Should that repair fail as well, every later
    /// write returns [`EngineError::Internal`] until the engine is reopened.
    pub fn apply(&self, batch: &Batch) -> Result<bool, EngineError> {
        // A malformed batch must never reach the log.
        for pair in batch.pairs() {
            pair?;
        }

        let mut guard = self.write_lock()?;
        let inner = &mut *guard;
        if inner.closed {
            return Err(EngineError::Closed);
        }
        if batch.is_empty() {
            return Ok(false);
        }

        let log = inner
            .log
            .as_mut()
            .ok_or_else(|| EngineError::Internal("write log unavailable".into()))?;
        let start = log.position();
        if let Err(e) = append_transaction(log, batch, inner.config.sync_log) {
            Self::repair_log(inner, start);
            return Err(e);
        }

        inner.mutable.apply(batch)?;
        trace!(
            len = batch.len(),
            mutable_size = inner.mutable.size(),
            "batch applied"
        );

        if inner.mutable.size() < inner.config.max_mutable_tablet_size {
            return Ok(false);
        }
        match inner.flush_state {
            FlushState::Idle => {
                Self::rotate(inner)?;
                Ok(true)
            }
            FlushState::InFlight => Ok(false),
            FlushState::Failed => {
                warn!("re-scheduling failed flush");
                inner.flush_state = FlushState::InFlight;
                Ok(true)
            }
        }
    }

    /// Stores `value` under `key`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<bool, EngineError> {
        trace!(key_len = key.len(), value_len = value.len(), "engine put");
        let mut batch = Batch::new();
        batch.put(key, value)?;
        self.apply(&batch)
    }

    /// Deletes `key`.
    pub fn delete(&self, key: &[u8]) -> Result<bool, EngineError> {
        trace!(key_len = key.len(), "engine delete");
        let mut batch = Batch::new();
        batch.delete(key)?;
        self.apply(&batch)
    }

    // --------------------------------------------------------------------------------------------
    // Read path
    // --------------------------------------------------------------------------------------------

    fn snapshot(&self) -> Result<Snapshot, EngineError> {
        let inner = self.read_lock()?;
        if inner.closed {
            return Err(EngineError::Closed);
        }
        Ok(Snapshot {
            mutable: Arc::clone(&inner.mutable),
            saving: inner.saving.as_ref().map(|s| Arc::clone(&s.table)),
            tablets: inner.tablets.clone(),
        })
    }

    /// Live value stored under `key`.
    ///
    /// Sources are consulted newest-first; the first one holding the key
    /// decides. Fails with [`EngineError::KeyNotFound`] for absent and
    /// deleted keys.
    pub fn get(&self, key: &[u8]) -> Result<ByteView, EngineError> {
        trace!(key_len = key.len(), "engine get");
        let snapshot = self.snapshot()?;
        let not_found = || EngineError::KeyNotFound(HexKey(key).to_string());

        let tables = std::iter::once(&snapshot.mutable).chain(snapshot.saving.as_ref());
        for table in tables {
            match table.get(key) {
                Some(Value::Present(value)) => return Ok(value),
                Some(Value::Tombstone) => return Err(not_found()),
                None => {}
            }
        }

        for tablet in snapshot.tablets.iter().rev() {
            if let Some(kv) = tablet.find(Some(key))?.next() {
                let kv = kv?;
                if kv.key.as_bytes() == key {
                    return kv.value.ok_or_else(not_found);
                }
            }
        }
        Err(not_found())
    }

    /// Like [`Engine::get`], but returns `default` for absent and deleted keys.
    pub fn get_or_else(&self, key: &[u8], default: ByteView) -> Result<ByteView, EngineError> {
        match self.get(key) {
            Err(EngineError::KeyNotFound(_)) => Ok(default),
            other => other,
        }
    }

    /// Live entries with key `>= term` (every entry when `term` is `None`),
    /// merged across all sources in ascending key order.
    pub fn find(&self, term: Option<&[u8]>) -> Result<MergeIterator, EngineError> {
        trace!(term_len = term.map(<[u8]>::len), "engine find");
        let snapshot = self.snapshot()?;

        let mut sources: Vec<Source> = Vec::with_capacity(snapshot.tablets.len() + 2);
        for tablet in &snapshot.tablets {
            sources.push(Box::new(tablet.find(term)?.map(|kv| kv.map_err(EngineError::from))));
        }
        if let Some(saving) = &snapshot.saving {
            sources.push(Box::new(saving.find(term).map(Ok)));
        }
        sources.push(Box::new(snapshot.mutable.find(term).map(Ok)));

        MergeIterator::new(sources)
    }

    /// Like [`Engine::find`], ending at the first entry `predicate` rejects.
    pub fn find_while(
        &self,
        term: Option<&[u8]>,
        predicate: impl FnMut(&KeyValue) -> bool + Send + 'static,
    ) -> Result<MergeIterator, EngineError> {
        Ok(self.find(term)?.with_predicate(Box::new(predicate)))
    }

    /// Live entries whose key starts with `prefix`.
    pub fn find_by_prefix(&self, prefix: &[u8]) -> Result<MergeIterator, EngineError> {
        let owned = prefix.to_vec();
        self.find_while(Some(prefix), move |kv| is_prefix(&kv.key, &owned))
    }

    // --------------------------------------------------------------------------------------------
    // Tablet stack
    // --------------------------------------------------------------------------------------------

    /// Opens tablet `name` from the database storage and pushes it as the
    /// newest tablet.
    pub fn push_tablet(&self, name: &str) -> Result<(), EngineError> {
        let (storage, reader) = {
            let inner = self.read_lock()?;
            if inner.closed {
                return Err(EngineError::Closed);
            }
            (Arc::clone(&inner.storage), inner.config.reader)
        };
        let tablet = FileTablet::open(storage.open(name)?, reader)?;

        let mut inner = self.write_lock()?;
        if inner.closed {
            return Err(EngineError::Closed);
        }
        inner.manifest.push(name)?;
        inner.tablets.push(tablet);
        info!(name, tablets = inner.tablets.len(), "tablet pushed");
        Ok(())
    }

    /// Copies a tablet from `source` into the database under a fresh name and
    /// pushes it. Returns the new name.
    pub fn import_tablet(&self, mut source: impl Read) -> Result<String, EngineError> {
        let (storage, name) = {
            let mut inner = self.write_lock()?;
            if inner.closed {
                return Err(EngineError::Closed);
            }
            (Arc::clone(&inner.storage), inner.manifest.allocate_name())
        };

        let mut out = storage.create(&name)?;
        let copied = io::copy(&mut source, &mut out)?;
        out.sync()?;
        drop(out);
        debug!(name, copied, "tablet imported");

        if let Err(e) = self.push_tablet(&name) {
            if let Err(cleanup) = storage.remove(&name) {
                warn!(name, error = %cleanup, "failed to remove rejected tablet");
            }
            return Err(e);
        }
        Ok(name)
    }

    // --------------------------------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------------------------------

    /// Turns the mutable table into the saving table and rotates the log.
    fn rotate(inner: &mut EngineInner) -> Result<(), EngineError> {
        // Without a writer the log may end in a torn record; keep it out of
        // the secondary slot.
        let log = inner
            .log
            .as_mut()
            .ok_or_else(|| EngineError::Internal("write log unavailable".into()))?;
        log.flush()?;
        log.get_mut().sync()?;
        // The writer addresses the file by name; drop it before the rename.
        inner.log = None;

        if let Err(e) = inner.storage.rename(LOG_FILE, SAVING_LOG_FILE) {
            inner.log = Some(open_log(inner.storage.as_ref(), true)?);
            return Err(e.into());
        }
        inner.log = Some(open_log(inner.storage.as_ref(), false)?);

        let table = mem::replace(&mut inner.mutable, Arc::new(MemTable::new()));
        let name = inner.manifest.allocate_name();
        info!(
            name,
            entries = table.len(),
            size = table.size(),
            "log rotated, flush started"
        );
        inner.saving = Some(Saving { table, name });
        inner.flush_state = FlushState::InFlight;
        Ok(())
    }

    /// Cuts a partially written transaction off the log and reopens it at
    /// `start`. If that fails the writer stays closed and writes are refused.
    fn repair_log(inner: &mut EngineInner, start: u64) {
        // Dropping the writer pushes out anything it still buffers, so the
        // truncation below removes every byte of the failed transaction.
        inner.log = None;
        let reopened = inner
            .storage
            .truncate(LOG_FILE, start)
            .and_then(|()| open_log(inner.storage.as_ref(), true));
        match reopened {
            Ok(log) => {
                warn!(position = start, "log write failed, torn tail removed");
                inner.log = Some(log);
            }
            Err(e) => error!(error = %e, "log repair failed, write path closed"),
        }
    }

    /// Hands the mutable table to the flush now, if it holds anything and no
    /// flush is in flight. A failed flush is re-armed instead.
    ///
    /// Returns `Ok(true)` when the caller should run [`Engine::run_flush`].
    pub fn begin_flush(&self) -> Result<bool, EngineError> {
        let mut guard = self.write_lock()?;
        let inner = &mut *guard;
        if inner.closed {
            return Err(EngineError::Closed);
        }
        match inner.flush_state {
            FlushState::Idle if inner.mutable.is_empty() => Ok(false),
            FlushState::Idle => {
                Self::rotate(inner)?;
                Ok(true)
            }
            FlushState::InFlight => Ok(false),
            FlushState::Failed => {
                inner.flush_state = FlushState::InFlight;
                Ok(true)
            }
        }
    }

    /// Writes the saving table to its tablet and publishes it.
    ///
    /// Runs without the state lock except for the final publication.
    /// Returns `Ok(false)` when there is nothing to flush. On failure the
    /// engine moves to [`FlushState::Failed`], keeping `saving` and its log.
    pub fn run_flush(&self) -> Result<bool, EngineError> {
        let (storage, table, name, writer, reader) = {
            let inner = self.read_lock()?;
            if inner.closed {
                return Err(EngineError::Closed);
            }
            match &inner.saving {
                None => return Ok(false),
                Some(saving) => (
                    Arc::clone(&inner.storage),
                    Arc::clone(&saving.table),
                    saving.name.clone(),
                    inner.config.writer,
                    inner.config.reader,
                ),
            }
        };

        debug!(name, entries = table.len(), "flush writing tablet");
        let result = write_tablet(storage.as_ref(), &name, &table, writer, reader)
            .and_then(|tablet| self.publish(&name, tablet));

        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                error!(name, error = %e, "flush failed");
                if let Ok(mut inner) = self.write_lock() {
                    if inner.saving.is_some() {
                        inner.flush_state = FlushState::Failed;
                    }
                }
                Err(e)
            }
        }
    }

    /// Installs a freshly written tablet and retires the saving table.
    fn publish(&self, name: &str, tablet: FileTablet) -> Result<(), EngineError> {
        let mut inner = self.write_lock()?;
        if inner.closed {
            return Err(EngineError::Closed);
        }

        inner.manifest.push(name)?;
        inner.tablets.push(tablet);
        inner.saving = None;
        inner.flush_state = FlushState::Idle;

        if inner.storage.exists(SAVING_LOG_FILE) {
            inner.storage.remove(SAVING_LOG_FILE)?;
        }

        info!(name, tablets = inner.tablets.len(), "flush published");
        Ok(())
    }

    /// Flushes until both memtables are empty. Returns the number of tablets
    /// written.
    pub fn flush_all(&self) -> Result<usize, EngineError> {
        let mut written = 0usize;
        loop {
            let begun = self.begin_flush()?;
            let ran = self.run_flush()?;
            if ran {
                written += 1;
            }
            if !begun && !ran {
                return Ok(written);
            }
        }
    }

    /// Current flush state.
    pub fn flush_state(&self) -> Result<FlushState, EngineError> {
        Ok(self.read_lock()?.flush_state)
    }

    /// Returns a snapshot of engine statistics.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let inner = self.read_lock()?;
        Ok(EngineStats {
            tablets: inner.manifest.tablets().to_vec(),
            tablet_bytes: inner.tablets.iter().map(FileTablet::size).sum(),
            mutable_size: inner.mutable.size(),
            mutable_entries: inner.mutable.len(),
            saving_entries: inner.saving.as_ref().map(|s| s.table.len()),
            flush_state: inner.flush_state,
        })
    }
}
