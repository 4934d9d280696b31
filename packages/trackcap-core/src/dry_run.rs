//! The dry-run store.
//!
//! In dry-run mode the engine persists proposed limits here instead of
//! sending them to qBittorrent, so that consecutive cycles converge the
//! same way they would against the real client. The store is a single
//! JSON file mapping hex hashes to byte-per-second limits, replaced
//! atomically on every write.
use std::collections::HashMap;
use std::panic::Location;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::torrent::TorrentHash;

/// Errors raised by the dry-run store.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Unable to access the dry-run store file: {source}, {location}")]
    Io {
        source: std::io::Error,
        location: &'static Location<'static>,
    },

    #[error("The dry-run store file is not valid JSON: {source}")]
    InvalidJson {
        #[from]
        source: serde_json::Error,
    },
}

impl From<std::io::Error> for Error {
    #[track_caller]
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            source,
            location: Location::caller(),
        }
    }
}

/// Key-value persistence of simulated per-torrent limits.
pub struct DryRunStore {
    path: PathBuf,
    limits: Mutex<HashMap<TorrentHash, i64>>,
}

impl DryRunStore {
    /// Opens the store, loading any previously simulated limits.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] when the parent directory cannot be created
    /// or an existing file cannot be read or parsed.
    pub fn open(path: &Path) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let limits = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw)?
        } else {
            HashMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            limits: Mutex::new(limits),
        })
    }

    #[must_use]
    pub fn get(&self, hash: &TorrentHash) -> Option<i64> {
        self.limits.lock().expect("store lock is not poisoned").get(hash).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.limits.lock().expect("store lock is not poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merges the given limits and persists the store.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] when the file cannot be replaced.
    pub fn set_many(&self, limits: &HashMap<TorrentHash, i64>) -> Result<usize, Error> {
        if limits.is_empty() {
            return Ok(0);
        }

        let snapshot = {
            let mut held = self.limits.lock().expect("store lock is not poisoned");
            held.extend(limits.iter().map(|(hash, limit)| (*hash, *limit)));
            held.clone()
        };

        self.persist(&snapshot)?;
        Ok(limits.len())
    }

    /// Empties the store and persists the empty state.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] when the file cannot be replaced.
    pub fn clear(&self) -> Result<(), Error> {
        self.limits.lock().expect("store lock is not poisoned").clear();
        self.persist(&HashMap::new())
    }

    /// Write-then-rename so readers never observe a torn file.
    fn persist(&self, limits: &HashMap<TorrentHash, i64>) -> Result<(), Error> {
        let serialized = serde_json::to_string_pretty(limits)?;

        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, serialized)?;
        std::fs::rename(&temp_path, &self.path)?;

        Ok(())
    }
}
