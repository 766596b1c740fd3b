use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;

use crate::engine::{Engine, EngineConfig, MergeIterator};
use crate::manifest::{LOG_FILE, TABLET_SUFFIX};
use crate::storage::{MemStorage, ReadChannel, Storage, StorageError, StorageLock, WriteChannel};
use crate::tablet::TabletWriterOptions;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times: only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Large threshold: nothing flushes unless asked to.
pub fn memtable_only_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        max_mutable_tablet_size: 64 * 1024 * 1024,
        sync_log: false,
        ..EngineConfig::default()
    }
}

/// 256-byte threshold and small blocks, so a dozen puts start a flush.
pub fn small_buffer_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        max_mutable_tablet_size: 256,
        writer: TabletWriterOptions {
            block_size: 128,
            compression: true,
            restart_interval: 4,
            check_key_order: true,
        },
        sync_log: false,
        ..EngineConfig::default()
    }
}

pub fn open_mem(storage: &MemStorage, config: EngineConfig) -> Engine {
    Engine::open(Arc::new(storage.clone()), config).unwrap()
}

pub fn key(i: usize) -> Vec<u8> {
    format!("key-{i:05}").into_bytes()
}

pub fn value(i: usize) -> Vec<u8> {
    format!("value-{i:05}").into_bytes()
}

/// Drains a merged stream into owned pairs.
pub fn collect(iter: MergeIterator) -> Vec<(Vec<u8>, Vec<u8>)> {
    iter.map(|kv| {
        let kv = kv.unwrap();
        let value = kv.value.expect("merged stream yielded a tombstone");
        (kv.key.to_vec(), value.to_vec())
    })
    .collect()
}

/// Puts `key(i)` / `value(i)` until `apply` reports a started flush.
/// Returns the number of puts.
pub fn fill_until_flush(engine: &Engine) -> usize {
    for i in 0..10_000 {
        if engine.put(&key(i), &value(i)).unwrap() {
            return i + 1;
        }
    }
    panic!("no flush started within 10000 puts");
}

/// In-memory storage that can be told to fail tablet creation, tear the
/// next log write, or refuse to truncate.
#[derive(Debug, Clone, Default)]
pub struct FailingStorage {
    pub inner: MemStorage,
    pub fail_tablets: Arc<AtomicBool>,
    pub torn_log: Arc<AtomicBool>,
    pub fail_truncate: Arc<AtomicBool>,
}

impl FailingStorage {
    pub fn set_failing(&self, failing: bool) {
        self.fail_tablets.store(failing, Ordering::SeqCst);
    }

    /// The next write to `write.log` stores 3 bytes and then fails.
    pub fn tear_next_log_write(&self) {
        self.torn_log.store(true, Ordering::SeqCst);
    }

    pub fn set_truncate_failing(&self, failing: bool) {
        self.fail_truncate.store(failing, Ordering::SeqCst);
    }

    fn wrap_log(&self, name: &str, channel: Box<dyn WriteChannel>) -> Box<dyn WriteChannel> {
        if name == LOG_FILE {
            Box::new(TornWriter {
                inner: channel,
                armed: Arc::clone(&self.torn_log),
            })
        } else {
            channel
        }
    }
}

/// Write channel that, when armed, accepts a 3-byte prefix of one write and
/// then reports a device error.
#[derive(Debug)]
pub struct TornWriter {
    inner: Box<dyn WriteChannel>,
    armed: Arc<AtomicBool>,
}

impl Write for TornWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.armed.swap(false, Ordering::SeqCst) {
            let torn = buf.len().min(3);
            self.inner.write_all(&buf[..torn])?;
            return Err(io::Error::other("injected torn write"));
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl WriteChannel for TornWriter {
    fn position(&self) -> u64 {
        self.inner.position()
    }

    fn sync(&mut self) -> io::Result<()> {
        self.inner.sync()
    }
}

impl Storage for FailingStorage {
    fn create(&self, name: &str) -> Result<Box<dyn WriteChannel>, StorageError> {
        if name.ends_with(TABLET_SUFFIX) && self.fail_tablets.load(Ordering::SeqCst) {
            return Err(StorageError::Io(io::Error::other("injected failure")));
        }
        let channel = self.inner.create(name)?;
        Ok(self.wrap_log(name, channel))
    }

    fn append(&self, name: &str) -> Result<Box<dyn WriteChannel>, StorageError> {
        let channel = self.inner.append(name)?;
        Ok(self.wrap_log(name, channel))
    }

    fn open(&self, name: &str) -> Result<Box<dyn ReadChannel>, StorageError> {
        self.inner.open(name)
    }

    fn exists(&self, name: &str) -> bool {
        self.inner.exists(name)
    }

    fn remove(&self, name: &str) -> Result<(), StorageError> {
        self.inner.remove(name)
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.inner.rename(from, to)
    }

    fn truncate(&self, name: &str, len: u64) -> Result<(), StorageError> {
        if self.fail_truncate.load(Ordering::SeqCst) {
            return Err(StorageError::Io(io::Error::other("injected truncate failure")));
        }
        self.inner.truncate(name, len)
    }

    fn mkdirs(&self, name: &str) -> Result<(), StorageError> {
        self.inner.mkdirs(name)
    }

    fn list(&self, name: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list(name)
    }

    fn size(&self, name: &str) -> Result<u64, StorageError> {
        self.inner.size(name)
    }

    fn lock(&self, name: &str) -> Result<StorageLock, StorageError> {
        self.inner.lock(name)
    }

    fn destroy(&self) -> Result<(), StorageError> {
        self.inner.destroy()
    }
}
