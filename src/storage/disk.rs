//! Directory-backed storage.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use fs2::FileExt;
use memmap2::Mmap;
use tracing::{trace, warn};

use super::{ReadChannel, Storage, StorageError, StorageLock, WriteChannel, check_range};

/// Storage rooted at a directory on disk.
#[derive(Debug, Clone)]
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    /// Storage rooted at `root`. The directory is not created here.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Makes a create, rename, or removal of `name` durable by syncing the
    /// directory that holds it.
    fn sync_parent(&self, name: &str) -> Result<(), StorageError> {
        let path = self.path(name);
        let dir = path.parent().unwrap_or(&self.root);
        File::open(dir).map_err(|e| io_err(name, e))?.sync_all()?;
        Ok(())
    }
}

/// Maps "file not found" onto [`StorageError::NotFound`].
fn io_err(name: &str, e: io::Error) -> StorageError {
    if e.kind() == io::ErrorKind::NotFound {
        StorageError::NotFound(name.to_string())
    } else {
        StorageError::Io(e)
    }
}

impl Storage for DiskStorage {
    fn create(&self, name: &str) -> Result<Box<dyn WriteChannel>, StorageError> {
        let file = File::create(self.path(name)).map_err(|e| io_err(name, e))?;
        self.sync_parent(name)?;
        trace!(name, "created file");
        Ok(Box::new(DiskWriter {
            file: BufWriter::new(file),
            position: 0,
        }))
    }

    fn append(&self, name: &str) -> Result<Box<dyn WriteChannel>, StorageError> {
        let existed = self.exists(name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(name))
            .map_err(|e| io_err(name, e))?;
        if !existed {
            self.sync_parent(name)?;
        }
        let position = file.metadata()?.len();
        trace!(name, position, "opened file for append");
        Ok(Box::new(DiskWriter {
            file: BufWriter::new(file),
            position,
        }))
    }

    /// Tablets and logs are never written through a read channel, so the
    /// mapping stays valid for the channel's lifetime.
    fn open(&self, name: &str) -> Result<Box<dyn ReadChannel>, StorageError> {
        let file = File::open(self.path(name)).map_err(|e| io_err(name, e))?;
        let len = file.metadata()?.len();

        // Zero-length files cannot be mapped.
        let data = if len == 0 {
            Bytes::new()
        } else {
            // SAFETY: the mapping is read-only, and tablets and logs are never
            // modified in place while a reader holds them: tablets are immutable
            // once published, and a log is only read (and copied out) at open.
            // Every slice taken from it is bounds-checked by `check_range`.
            let mmap = unsafe { Mmap::map(&file)? };
            Bytes::from_owner(mmap)
        };
        Ok(Box::new(DiskReader { data }))
    }

    fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    fn remove(&self, name: &str) -> Result<(), StorageError> {
        fs::remove_file(self.path(name)).map_err(|e| io_err(name, e))?;
        self.sync_parent(name)
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        fs::rename(self.path(from), self.path(to)).map_err(|e| io_err(from, e))?;
        self.sync_parent(to)?;
        if self.path(from).parent() != self.path(to).parent() {
            self.sync_parent(from)?;
        }
        trace!(from, to, "renamed file");
        Ok(())
    }

    fn truncate(&self, name: &str, len: u64) -> Result<(), StorageError> {
        let file = OpenOptions::new()
            .write(true)
            .open(self.path(name))
            .map_err(|e| io_err(name, e))?;
        file.set_len(len)?;
        file.sync_all()?;
        trace!(name, len, "truncated file");
        Ok(())
    }

    fn mkdirs(&self, name: &str) -> Result<(), StorageError> {
        fs::create_dir_all(self.path(name))?;
        Ok(())
    }

    fn list(&self, name: &str) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.path(name)).map_err(|e| io_err(name, e))? {
            let entry = entry?;
            if let Some(file_name) = entry.file_name().to_str() {
                names.push(file_name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn size(&self, name: &str) -> Result<u64, StorageError> {
        Ok(fs::metadata(self.path(name))
            .map_err(|e| io_err(name, e))?
            .len())
    }

    fn lock(&self, name: &str) -> Result<StorageLock, StorageError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.path(name))
            .map_err(|e| io_err(name, e))?;

        if let Err(e) = FileExt::try_lock_exclusive(&file) {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(StorageError::LockHeld(name.to_string()));
            }
            return Err(StorageError::Io(e));
        }

        Ok(StorageLock::new(name, Box::new(FileLockGuard { file })))
    }

    fn destroy(&self) -> Result<(), StorageError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Channels
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct DiskReader {
    data: Bytes,
}

impl ReadChannel for DiskReader {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes> {
        let range = check_range(self.size(), offset, len)?;
        Ok(self.data.slice(range))
    }
}

#[derive(Debug)]
struct DiskWriter {
    file: BufWriter<File>,
    position: u64,
}

impl Write for DiskWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl WriteChannel for DiskWriter {
    fn position(&self) -> u64 {
        self.position
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()
    }
}

impl Drop for DiskWriter {
    fn drop(&mut self) {
        if let Err(e) = self.file.flush() {
            warn!("Failed to flush file on drop: {}", e);
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Lock guard
// ------------------------------------------------------------------------------------------------

struct FileLockGuard {
    file: File,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release file lock: {}", e);
        }
    }
}
