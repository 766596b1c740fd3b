//! # TabletDB
//!
//! An embeddable, persistent, ordered key-value store built from a
//! write-ahead log, an in-memory table, and a stack of immutable,
//! block-structured **tablet** files.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tabletdb::{Db, DbConfig};
//!
//! let db = Db::open("/tmp/my_db", DbConfig::default()).unwrap();
//!
//! // Write
//! db.put(b"hello", b"world").unwrap();
//!
//! // Read
//! assert_eq!(db.get(b"hello").unwrap().as_bytes(), b"world");
//!
//! // Delete
//! db.delete(b"hello").unwrap();
//! assert!(db.get(b"hello").is_err());
//!
//! // Scan everything starting with "user:"
//! db.put(b"user:1", b"ann").unwrap();
//! db.put(b"user:2", b"bob").unwrap();
//! let users: Vec<_> = db.find_by_prefix(b"user:").unwrap().collect();
//! assert_eq!(users.len(), 2);
//!
//! // Graceful shutdown
//! db.close().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Write-ahead logging**: every batch is logged before it becomes visible.
//! - **Atomic batches**: a [`Batch`] of puts and deletes is applied as one unit.
//! - **Background flush**: a full memtable is written to a tablet off the write path.
//! - **Prefix-compressed blocks** with restart points and optional Snappy compression.
//! - **CRC32 integrity** for log records and tablet blocks.
//! - **Crash recovery** from the primary and secondary logs on open.
//! - **Bulk load**: prebuilt tablets can be pushed onto the stack.

pub mod batch;
pub mod block;
pub mod encoding;
pub mod engine;
pub mod manifest;
pub mod memtable;
pub mod storage;
pub mod tablet;
pub mod view;
pub mod wal;

use std::env;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use batch::{Batch, BatchError};
pub use engine::{Engine, EngineConfig, EngineError, EngineStats, FlushState, MergeIterator};
pub use storage::{DiskStorage, MemStorage, Storage, StorageError};
pub use tablet::{FileTablet, TabletError, TabletReaderOptions, TabletWriter, TabletWriterOptions};
pub use view::{ByteView, KeyValue};

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Db`] instance.
///
/// All fields have sensible defaults via [`DbConfig::default()`].
/// The configuration is validated when passed to [`Db::open`].
///
/// # Example
///
/// ```rust
/// use tabletdb::DbConfig;
///
/// // Smaller memtable, uncompressed blocks
/// let config = DbConfig {
///     max_mutable_tablet_size: 256 * 1024,
///     block_compression: false,
///     ..DbConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Memtable size (key + value bytes written) at which it is handed to
    /// the background flush.
    ///
    /// Default: 4 MiB. Must be ≥ 1.
    pub max_mutable_tablet_size: usize,

    /// Target encoded size of a tablet data block.
    ///
    /// Default: 4096. Must be ≥ 64.
    pub block_size: usize,

    /// Snappy-compress data blocks when that makes them smaller.
    ///
    /// Default: `true`.
    pub block_compression: bool,

    /// Entries between restart points inside a block.
    ///
    /// Default: 16. Must be ≥ 1.
    pub restart_interval: usize,

    /// Verify block checksums on every read.
    ///
    /// Default: `false`.
    pub verify_checksums: bool,

    /// Create the database directory when it does not exist.
    ///
    /// Default: `true`.
    pub create_if_missing: bool,

    /// Remove the whole database when it is closed.
    ///
    /// Default: `false`.
    pub delete_on_close: bool,

    /// Sync the log after every write.
    ///
    /// Default: `true`.
    pub sync_log: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        let writer = TabletWriterOptions::default();
        Self {
            max_mutable_tablet_size: 4 * 1024 * 1024,
            block_size: writer.block_size,
            block_compression: writer.compression,
            restart_interval: writer.restart_interval,
            verify_checksums: false,
            create_if_missing: true,
            delete_on_close: false,
            sync_log: true,
        }
    }
}

impl DbConfig {
    /// Validates all configuration parameters.
    fn validate(&self) -> Result<(), DbError> {
        if self.max_mutable_tablet_size < 1 {
            return Err(DbError::InvalidConfig(
                "max_mutable_tablet_size must be >= 1".into(),
            ));
        }
        if self.block_size < 64 {
            return Err(DbError::InvalidConfig("block_size must be >= 64".into()));
        }
        if self.restart_interval < 1 {
            return Err(DbError::InvalidConfig(
                "restart_interval must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Converts to the internal engine configuration.
    fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_mutable_tablet_size: self.max_mutable_tablet_size,
            writer: TabletWriterOptions {
                block_size: self.block_size,
                compression: self.block_compression,
                restart_interval: self.restart_interval,
                check_key_order: true,
            },
            reader: TabletReaderOptions {
                verify_checksums: self.verify_checksums,
            },
            sync_log: self.sync_log,
            delete_on_close: self.delete_on_close,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Db`] operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// The database has been closed.
    #[error("database is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Key constraint violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No live value is stored under the key (rendered in hex).
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Filesystem error outside the engine (directory creation, import source).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An engine-internal error occurred.
    #[error("{0}")]
    Engine(#[source] EngineError),
}

impl From<EngineError> for DbError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::KeyNotFound(key) => DbError::KeyNotFound(key),
            EngineError::Closed => DbError::Closed,
            other => DbError::Engine(other),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Background worker state
// ------------------------------------------------------------------------------------------------

type Task = Box<dyn FnOnce() + Send>;

/// Holds the flush worker's sender and handle.
/// Taken (`Option::take`) on shutdown to ensure single cleanup.
///
/// A single worker runs tasks in submission order, so at most one
/// [`Engine::run_flush`] executes at a time.
struct BackgroundPool {
    sender: crossbeam::channel::Sender<Task>,
    worker: thread::JoinHandle<()>,
}

impl BackgroundPool {
    fn spawn() -> Result<Self, DbError> {
        let (sender, receiver) = crossbeam::channel::unbounded::<Task>();
        let worker = thread::Builder::new()
            .name("tabletdb-flush-0".into())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    task();
                }
            })?;
        Ok(Self { sender, worker })
    }
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

/// Ascending stream of live entries returned by [`Db::find`] and friends.
///
/// Reads a consistent set of sources captured when it was created; later
/// writes and flushes do not affect it.
#[derive(Debug)]
pub struct DbIter {
    inner: MergeIterator,
}

impl Iterator for DbIter {
    type Item = Result<KeyValue, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|kv| kv.map_err(DbError::from))
    }
}

// ------------------------------------------------------------------------------------------------
// Database handle
// ------------------------------------------------------------------------------------------------

/// The main database handle.
///
/// Provides a high-level, thread-safe API for reading and writing
/// key-value pairs with automatic background flushing.
///
/// # Thread safety
///
/// `Db` is `Send + Sync`: it can be shared across threads via
/// `Arc<Db>`.
///
/// # Background flush
///
/// When the memtable reaches `max_mutable_tablet_size`, the engine rotates
/// the log and hands the table to a background worker, which writes it to
/// a new tablet and publishes it. Writes continue against a fresh memtable
/// meanwhile. [`Db::flush`] forces the same and waits for it.
///
/// # Shutdown
///
/// Call [`Db::close`] for a graceful shutdown. If the handle is dropped
/// without calling `close`, the destructor will attempt cleanup, but
/// errors are only logged.
pub struct Db {
    engine: Engine,
    bg: Mutex<Option<BackgroundPool>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Opens (or creates) a database in the given directory.
    ///
    /// On an existing directory the logs are replayed and the tablet stack
    /// is reloaded from the manifest.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidConfig`] if any configuration parameter
    /// is out of range, and a storage `NotFound` error when the directory
    /// is missing and `create_if_missing` is off.
    pub fn open(path: impl AsRef<Path>, config: DbConfig) -> Result<Self, DbError> {
        config.validate()?;
        let path = path.as_ref();

        if !path.is_dir() {
            if !config.create_if_missing {
                return Err(EngineError::from(StorageError::NotFound(
                    path.display().to_string(),
                ))
                .into());
            }
            fs::create_dir_all(path)?;
            debug!(path = %path.display(), "database directory created");
        }

        let db = Self::open_with_storage(Arc::new(DiskStorage::new(path)), config)?;
        info!(path = %path.display(), "database opened");
        Ok(db)
    }

    /// Opens a scratch database in a fresh directory under the system temp
    /// directory. The directory is removed on close.
    pub fn open_tmp(config: DbConfig) -> Result<Self, DbError> {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let dir = env::temp_dir().join(format!(
            "tabletdb-{}-{nanos}-{}",
            process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let config = DbConfig {
            create_if_missing: true,
            delete_on_close: true,
            ..config
        };
        Self::open(dir, config)
    }

    /// Opens a scratch database (see [`Db::open_tmp`]) serving the given
    /// tablet files. Each file is copied in and pushed in order, so later
    /// tablets take priority over earlier ones.
    pub fn open_tablets<I>(tablets: I, config: DbConfig) -> Result<Self, DbError>
    where
        I: IntoIterator,
        I::Item: AsRef<Path>,
    {
        let db = Self::open_tmp(config)?;
        for path in tablets {
            db.import_tablet(path)?;
        }
        debug!(tablets = db.stats()?.tablets.len(), "opened database over tablets");
        Ok(db)
    }

    /// Opens a database on an arbitrary storage backend, such as
    /// [`MemStorage`].
    pub fn open_with_storage(storage: Arc<dyn Storage>, config: DbConfig) -> Result<Self, DbError> {
        config.validate()?;
        let engine = Engine::open(storage, config.to_engine_config())?;
        let pool = BackgroundPool::spawn()?;

        let db = Self {
            engine,
            bg: Mutex::new(Some(pool)),
            closed: AtomicBool::new(false),
        };

        // A table recovered from the secondary log is flushed right away.
        if db.engine.flush_state()? == FlushState::InFlight {
            info!("scheduling flush of recovered table");
            db.schedule_flush();
        }
        Ok(db)
    }

    /// Gracefully shuts down the database.
    ///
    /// Waits for queued background flushes to complete, then closes the
    /// log and releases the directory lock. Unflushed data stays in the
    /// log and is recovered on the next open.
    ///
    /// Subsequent operations on this handle return [`DbError::Closed`].
    /// Calling `close` more than once is harmless.
    pub fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(()); // Already closed.
        }

        self.shutdown_pool();
        self.engine.close()?;

        info!("database closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Write operations
    // --------------------------------------------------------------------------------------------

    /// Inserts or updates a key-value pair.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidArgument`] if `key` is empty.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.check_open()?;
        check_key(key)?;

        if self.engine.put(key, value)? {
            self.schedule_flush();
        }
        Ok(())
    }

    /// Deletes a key.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidArgument`] if `key` is empty.
    pub fn delete(&self, key: &[u8]) -> Result<(), DbError> {
        self.check_open()?;
        check_key(key)?;

        if self.engine.delete(key)? {
            self.schedule_flush();
        }
        Ok(())
    }

    /// Applies every operation of `batch` atomically.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidArgument`] if any key in the batch is
    /// empty; nothing is applied in that case.
    pub fn apply(&self, batch: &Batch) -> Result<(), DbError> {
        self.check_open()?;
        for pair in batch.pairs() {
            let kv = pair.map_err(EngineError::from)?;
            check_key(&kv.key)?;
        }

        if self.engine.apply(batch)? {
            self.schedule_flush();
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Read operations
    // --------------------------------------------------------------------------------------------

    /// Retrieves the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::KeyNotFound`] if the key does not exist or has
    /// been deleted.
    pub fn get(&self, key: &[u8]) -> Result<ByteView, DbError> {
        self.check_open()?;
        Ok(self.engine.get(key)?)
    }

    /// Like [`Db::get`], but returns `default` for absent and deleted keys.
    pub fn get_or_else(&self, key: &[u8], default: &[u8]) -> Result<ByteView, DbError> {
        self.check_open()?;
        Ok(self.engine.get_or_else(key, ByteView::copy_from(default))?)
    }

    /// Live entries with key `>= term`, or every entry when `term` is
    /// `None`, in ascending key order.
    pub fn find(&self, term: Option<&[u8]>) -> Result<DbIter, DbError> {
        self.check_open()?;
        Ok(DbIter {
            inner: self.engine.find(term)?,
        })
    }

    /// Like [`Db::find`], ending at the first entry `predicate` rejects.
    pub fn find_while(
        &self,
        term: Option<&[u8]>,
        predicate: impl FnMut(&KeyValue) -> bool + Send + 'static,
    ) -> Result<DbIter, DbError> {
        self.check_open()?;
        Ok(DbIter {
            inner: self.engine.find_while(term, predicate)?,
        })
    }

    /// Live entries whose key starts with `prefix`.
    pub fn find_by_prefix(&self, prefix: &[u8]) -> Result<DbIter, DbError> {
        self.check_open()?;
        Ok(DbIter {
            inner: self.engine.find_by_prefix(prefix)?,
        })
    }

    // --------------------------------------------------------------------------------------------
    // Tablets
    // --------------------------------------------------------------------------------------------

    /// Pushes tablet file `name`, already present in the database
    /// directory, on top of the stack. Its entries shadow every older source
    /// except the memtables.
    pub fn push_tablet(&self, name: &str) -> Result<(), DbError> {
        self.check_open()?;
        self.engine.push_tablet(name)?;
        Ok(())
    }

    /// Copies the tablet file at `path` into the database and pushes it.
    /// Returns the name it was stored under.
    pub fn import_tablet(&self, path: impl AsRef<Path>) -> Result<String, DbError> {
        self.check_open()?;
        let file = File::open(path.as_ref())?;
        let name = self.engine.import_tablet(file)?;
        info!(source = %path.as_ref().display(), name, "tablet imported");
        Ok(name)
    }

    /// Writes both memtables to tablets and waits until they are published.
    pub fn flush(&self) -> Result<(), DbError> {
        self.check_open()?;
        let (done_tx, done_rx) = crossbeam::channel::bounded(1);
        let engine = self.engine.clone();
        let task: Task = Box::new(move || {
            let _ = done_tx.send(engine.flush_all());
        });

        {
            let guard = self.pool();
            let bg = guard.as_ref().ok_or(DbError::Closed)?;
            bg.sender.send(task).map_err(|_| DbError::Closed)?;
        }

        // Runs behind every flush queued before it.
        let written = done_rx.recv().map_err(|_| DbError::Closed)??;
        debug!(written, "explicit flush finished");
        Ok(())
    }

    /// Returns a snapshot of engine statistics.
    pub fn stats(&self) -> Result<EngineStats, DbError> {
        self.check_open()?;
        Ok(self.engine.stats()?)
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Returns `Err(DbError::Closed)` if the database has been closed.
    fn check_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Closed);
        }
        Ok(())
    }

    fn pool(&self) -> MutexGuard<'_, Option<BackgroundPool>> {
        self.bg.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dispatches a background task that writes and publishes the saving table.
    fn schedule_flush(&self) {
        let guard = self.pool();
        if let Some(bg) = guard.as_ref() {
            let engine = self.engine.clone();
            let task: Task = Box::new(move || match engine.run_flush() {
                Ok(true) => debug!("background: saving table published"),
                Ok(false) => {}
                Err(EngineError::Closed) => debug!("background: engine closed, flush skipped"),
                // Logged by the engine, which keeps the table for a retry.
                Err(_) => {}
            });
            if bg.sender.send(task).is_err() {
                warn!("flush worker gone, flush not scheduled");
            }
        }
    }

    /// Drains the background task queue and joins the worker.
    fn shutdown_pool(&self) {
        if let Some(bg) = self.pool().take() {
            // Drop sender → the worker drains remaining tasks then exits.
            drop(bg.sender);
            if bg.worker.join().is_err() {
                error!("flush worker panicked");
            }
        }
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.shutdown_pool();
            if let Err(e) = self.engine.close() {
                warn!(error = %e, "close on drop failed");
            }
        }
    }
}

fn check_key(key: &[u8]) -> Result<(), DbError> {
    if key.is_empty() {
        return Err(DbError::InvalidArgument("key must not be empty".into()));
    }
    Ok(())
}
