//! Content fingerprints and the persisted path → fingerprint store.
//!
//! The store is a single JSON file loaded at run start and written back at
//! run end. Writes go through a temp file in the same directory followed by
//! a rename, so a reader only ever sees the old store or the new one.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;

/// File name of the store when no explicit path is configured.
pub const DEFAULT_STORE_FILE: &str = ".pdf_to_text_hashes.json";

const STORE_VERSION: u32 = 1;
const BUFFER_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum HashStoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write hash store {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize hash store: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// SHA-256 of the file's bytes, hex encoded.
pub fn fingerprint(path: &Path) -> Result<String, HashStoreError> {
    let read_err = |source| HashStoreError::Read {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(read_err)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buffer).map_err(read_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Whether `path` differs from `stored`.
///
/// A missing stored value or a file that cannot be hashed counts as changed,
/// so hashing problems cause extra work rather than skipped work.
pub fn has_changed(path: &Path, stored: Option<&str>) -> bool {
    let Some(stored) = stored else {
        return true;
    };
    match fingerprint(path) {
        Ok(current) => current != stored,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "hashing failed, treating as changed");
            true
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    entries: BTreeMap<String, String>,
}

/// In-memory view of the persisted fingerprint store.
#[derive(Debug)]
pub struct HashStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
    dirty: bool,
}

impl HashStore {
    /// An empty store that will be written to `path`.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
            dirty: false,
        }
    }

    /// Load the store at `path`.
    ///
    /// A missing file yields an empty store. An unreadable or corrupt file is
    /// logged and also yields an empty store: losing it only costs the
    /// skip-on-rerun optimization.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::empty(path),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read hash store, starting empty");
                return Self::empty(path);
            }
        };

        match serde_json::from_str::<StoreFile>(&content) {
            Ok(file) if file.version == STORE_VERSION => {
                tracing::debug!(path = %path.display(), entries = file.entries.len(), "loaded hash store");
                Self {
                    path,
                    entries: file.entries,
                    dirty: false,
                }
            }
            Ok(file) => {
                tracing::warn!(path = %path.display(), version = file.version, "unsupported hash store version, starting empty");
                Self::empty(path)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt hash store, starting empty");
                Self::empty(path)
            }
        }
    }

    /// Key under which `input` is stored: the canonical path when it resolves,
    /// otherwise the absolute path.
    pub fn normalize_key(input: &Path) -> String {
        let resolved = std::fs::canonicalize(input)
            .or_else(|_| std::path::absolute(input))
            .unwrap_or_else(|_| input.to_path_buf());
        resolved.to_string_lossy().into_owned()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, input: &Path) -> Option<&str> {
        self.entries
            .get(&Self::normalize_key(input))
            .map(String::as_str)
    }

    /// Record the fingerprint of a successfully converted input.
    pub fn record(&mut self, input: &Path, fingerprint: String) {
        let key = Self::normalize_key(input);
        if self.entries.get(&key) != Some(&fingerprint) {
            self.entries.insert(key, fingerprint);
            self.dirty = true;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when entries changed since load or the last save.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// First half of an atomic save: serialize into a synced temp file next
    /// to the store. Nothing visible changes until [`StagedStore::commit`].
    pub fn stage(&self) -> Result<StagedStore, HashStoreError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let write_err = |source| HashStoreError::Write {
            path: self.path.clone(),
            source,
        };
        std::fs::create_dir_all(dir).map_err(write_err)?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
        let file = StoreFile {
            version: STORE_VERSION,
            entries: self.entries.clone(),
        };
        serde_json::to_writer_pretty(&mut tmp, &file)?;
        tmp.write_all(b"\n").map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;

        Ok(StagedStore {
            tmp,
            target: self.path.clone(),
        })
    }

    /// Atomically write the store back to disk.
    pub fn save(&mut self) -> Result<(), HashStoreError> {
        self.stage()?.commit()?;
        self.dirty = false;
        tracing::debug!(path = %self.path.display(), entries = self.entries.len(), "saved hash store");
        Ok(())
    }
}

/// A fully written store waiting to be renamed into place.
///
/// Dropping it without committing deletes the temp file and leaves the
/// previous store untouched.
pub struct StagedStore {
    tmp: NamedTempFile,
    target: PathBuf,
}

impl StagedStore {
    pub fn temp_path(&self) -> &Path {
        self.tmp.path()
    }

    pub fn commit(self) -> Result<(), HashStoreError> {
        let target = self.target;
        self.tmp
            .persist(&target)
            .map_err(|e| HashStoreError::Write {
                path: target.clone(),
                source: e.error,
            })?;
        Ok(())
    }
}
