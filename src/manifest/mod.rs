//! # Manifest Component
//!
//! The **manifest** is the durable description of the tablet stack: an
//! ordered list of tablet file names, oldest first. Position in the list is
//! merge priority; a tablet later in the list shadows every tablet before it.
//!
//! This module also owns the names of every other file the engine keeps in
//! the database root:
//!
//! | Name | Contents |
//! |---|---|
//! | [`LOCK_FILE`] | advisory lock held while a database is open |
//! | [`LOG_FILE`] | primary write-ahead log (feeds the mutable table) |
//! | [`SAVING_LOG_FILE`] | secondary log of the table currently being flushed |
//! | [`MANIFEST_FILE`] | newline-delimited tablet stack |
//! | `NNNNNN.tab` | tablets written by flushes |
//!
//! ## Data durability strategy
//!
//! Every mutation rewrites the whole list through
//! [`Storage::store_list`](crate::storage::Storage::store_list), which writes
//! a temporary file and renames it over the old one. A crash leaves either
//! the old or the new list, never a mix.
//!
//! ## Thread safety
//!
//! `Manifest` is not internally synchronized; the engine keeps it under its
//! own state lock.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::storage::{Storage, StorageError};

// ------------------------------------------------------------------------------------------------
// File names
// ------------------------------------------------------------------------------------------------

/// Advisory lock resource.
pub const LOCK_FILE: &str = "access.lock";

/// Primary write-ahead log.
pub const LOG_FILE: &str = "write.log";

/// Write-ahead log of the table being flushed.
pub const SAVING_LOG_FILE: &str = "write_imm.log";

/// Tablet stack.
pub const MANIFEST_FILE: &str = "stack.txt";

/// Suffix of flushed tablet files.
pub const TABLET_SUFFIX: &str = ".tab";

/// File name of tablet number `number`.
pub fn tablet_name(number: u64) -> String {
    format!("{number:06}{TABLET_SUFFIX}")
}

/// Number encoded in a flushed tablet's file name, if it has that shape.
pub fn tablet_number(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(TABLET_SUFFIX)?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Error from the storage backend.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A tablet name that cannot live in the database root.
    #[error("Invalid tablet name: {0:?}")]
    InvalidName(String),

    /// The tablet is already on the stack.
    #[error("Duplicate tablet: {0}")]
    Duplicate(String),
}

// ------------------------------------------------------------------------------------------------
// Manifest
// ------------------------------------------------------------------------------------------------

/// In-memory copy of the tablet stack, written through to storage.
#[derive(Debug)]
pub struct Manifest {
    storage: Arc<dyn Storage>,

    /// Tablet file names, oldest first.
    tablets: Vec<String>,

    /// Next number handed out by [`Manifest::allocate_name`].
    next_number: u64,
}

impl Manifest {
    /// Loads the stack from storage. A missing manifest is an empty stack.
    pub fn load(storage: Arc<dyn Storage>) -> Result<Self, ManifestError> {
        let tablets = if storage.exists(MANIFEST_FILE) {
            storage.load_list(MANIFEST_FILE)?
        } else {
            Vec::new()
        };

        for name in &tablets {
            validate_name(name)?;
        }

        let next_number = tablets
            .iter()
            .filter_map(|name| tablet_number(name))
            .max()
            .map_or(1, |n| n + 1);

        info!(tablets = tablets.len(), next_number, "manifest loaded");

        Ok(Self {
            storage,
            tablets,
            next_number,
        })
    }

    /// Tablet names, oldest first.
    pub fn tablets(&self) -> &[String] {
        &self.tablets
    }

    /// Returns `true` if `name` is on the stack.
    pub fn contains(&self, name: &str) -> bool {
        self.tablets.iter().any(|t| t == name)
    }

    /// Reserves a fresh `NNNNNN.tab` name. The name is not on the stack until
    /// [`Manifest::push`] is called with it.
    pub fn allocate_name(&mut self) -> String {
        let name = tablet_name(self.next_number);
        self.next_number += 1;
        name
    }

    /// Appends `name` as the newest tablet and persists the stack.
    ///
    /// On a storage failure the in-memory stack is left unchanged.
    pub fn push(&mut self, name: &str) -> Result<(), ManifestError> {
        validate_name(name)?;
        if self.contains(name) {
            return Err(ManifestError::Duplicate(name.to_string()));
        }

        self.tablets.push(name.to_string());
        if let Err(e) = self.storage.store_list(MANIFEST_FILE, &self.tablets) {
            self.tablets.pop();
            return Err(e.into());
        }

        if let Some(number) = tablet_number(name) {
            self.next_number = self.next_number.max(number + 1);
        }

        debug!(name, tablets = self.tablets.len(), "manifest updated");
        Ok(())
    }
}

/// Rejects names that are empty, contain a path separator, or collide with
/// the engine's own files.
fn validate_name(name: &str) -> Result<(), ManifestError> {
    let reserved = [LOCK_FILE, LOG_FILE, SAVING_LOG_FILE, MANIFEST_FILE];
    if name.is_empty()
        || name.contains(['/', '\\', '\n'])
        || name == "."
        || name == ".."
        || reserved.contains(&name)
    {
        return Err(ManifestError::InvalidName(name.to_string()));
    }
    Ok(())
}
