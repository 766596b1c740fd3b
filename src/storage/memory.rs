//! In-process storage, used for tests and throwaway databases.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use super::{ReadChannel, Storage, StorageError, StorageLock, WriteChannel, check_range};

#[derive(Debug, Default)]
struct MemState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    locks: BTreeSet<String>,
}

/// Storage held entirely in memory.
///
/// Clones share the same files, so a database reopened on a clone sees
/// everything written through the original.
#[derive(Debug, Clone, Default)]
pub struct MemStorage {
    state: Arc<Mutex<MemState>>,
}

fn poisoned() -> io::Error {
    io::Error::other("MemStorage mutex poisoned")
}

impl MemStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemState>, StorageError> {
        self.state
            .lock()
            .map_err(|_| StorageError::Internal("Mutex poisoned".into()))
    }

    /// Overwrites the bytes of `name`; lets tests corrupt files in place.
    pub fn put_bytes(&self, name: &str, data: Vec<u8>) -> Result<(), StorageError> {
        self.state()?.files.insert(name.to_string(), data);
        Ok(())
    }

    /// Copy of the bytes of `name`.
    pub fn get_bytes(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        self.state()?
            .files
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }
}

impl Storage for MemStorage {
    fn create(&self, name: &str) -> Result<Box<dyn WriteChannel>, StorageError> {
        self.state()?.files.insert(name.to_string(), Vec::new());
        Ok(Box::new(MemWriter {
            state: Arc::clone(&self.state),
            name: name.to_string(),
            position: 0,
        }))
    }

    fn append(&self, name: &str) -> Result<Box<dyn WriteChannel>, StorageError> {
        let position = self
            .state()?
            .files
            .entry(name.to_string())
            .or_default()
            .len() as u64;
        Ok(Box::new(MemWriter {
            state: Arc::clone(&self.state),
            name: name.to_string(),
            position,
        }))
    }

    fn open(&self, name: &str) -> Result<Box<dyn ReadChannel>, StorageError> {
        let data = self.get_bytes(name)?;
        Ok(Box::new(MemReader {
            data: Bytes::from(data),
        }))
    }

    fn exists(&self, name: &str) -> bool {
        match self.state() {
            Ok(state) => state.files.contains_key(name) || state.dirs.contains(name),
            Err(_) => false,
        }
    }

    fn remove(&self, name: &str) -> Result<(), StorageError> {
        match self.state()?.files.remove(name) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(name.to_string())),
        }
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let mut state = self.state()?;
        let data = state
            .files
            .remove(from)
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        state.files.insert(to.to_string(), data);
        Ok(())
    }

    fn truncate(&self, name: &str, len: u64) -> Result<(), StorageError> {
        let mut state = self.state()?;
        let data = state
            .files
            .get_mut(name)
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;
        data.truncate(len as usize);
        Ok(())
    }

    fn mkdirs(&self, name: &str) -> Result<(), StorageError> {
        let mut state = self.state()?;
        let mut path = String::new();
        for part in name.split('/').filter(|p| !p.is_empty()) {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(part);
            state.dirs.insert(path.clone());
        }
        Ok(())
    }

    fn list(&self, name: &str) -> Result<Vec<String>, StorageError> {
        let state = self.state()?;
        let prefix = if name.is_empty() {
            String::new()
        } else {
            format!("{}/", name.trim_end_matches('/'))
        };

        let names: BTreeSet<String> = state
            .files
            .keys()
            .chain(state.dirs.iter())
            .filter_map(|path| path.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect();
        Ok(names.into_iter().collect())
    }

    fn size(&self, name: &str) -> Result<u64, StorageError> {
        self.state()?
            .files
            .get(name)
            .map(|data| data.len() as u64)
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    fn lock(&self, name: &str) -> Result<StorageLock, StorageError> {
        if !self.state()?.locks.insert(name.to_string()) {
            return Err(StorageError::LockHeld(name.to_string()));
        }
        Ok(StorageLock::new(
            name,
            Box::new(MemLockGuard {
                state: Arc::clone(&self.state),
                name: name.to_string(),
            }),
        ))
    }

    fn destroy(&self) -> Result<(), StorageError> {
        let mut state = self.state()?;
        state.files.clear();
        state.dirs.clear();
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Channels
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct MemReader {
    data: Bytes,
}

impl ReadChannel for MemReader {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes> {
        let range = check_range(self.size(), offset, len)?;
        Ok(self.data.slice(range))
    }
}

#[derive(Debug)]
struct MemWriter {
    state: Arc<Mutex<MemState>>,
    name: String,
    position: u64,
}

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let file = state.files.get_mut(&self.name).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{} was removed", self.name))
        })?;
        file.extend_from_slice(buf);
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl WriteChannel for MemWriter {
    fn position(&self) -> u64 {
        self.position
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Lock guard
// ------------------------------------------------------------------------------------------------

struct MemLockGuard {
    state: Arc<Mutex<MemState>>,
    name: String,
}

impl Drop for MemLockGuard {
    fn drop(&mut self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.locks.remove(&self.name);
    }
}
