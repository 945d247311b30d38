//! File-based storage for persistent namespaces.
//!
//! Directory layout:
//!
//! ```text
//! <root>/
//! ├─ LOCK              # Advisory lock for single-process ownership
//! ├─ 7531.kv           # Namespace "u1" (hex-encoded name), CBOR map
//! └─ 7532.kv.tmp       # In-flight commit, removed on next open
//! ```

use crate::backend::{validate_namespace, StorageBackend, StorageProvider};
use crate::encoding::{from_hex, to_hex};
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const LOCK_FILE: &str = "LOCK";
const NAMESPACE_EXTENSION: &str = "kv";
const TEMP_EXTENSION: &str = "kv.tmp";

/// A file-backed namespace.
///
/// The whole namespace is one CBOR-encoded map. Every mutation rewrites it
/// to a temporary file, syncs it, and atomically renames it over the old
/// file, so a crash leaves either the old or the new map on disk.
///
/// # Durability
///
/// - `put`/`remove`/`clear` call `File::sync_all()` before returning
/// - the parent directory is synced after the rename on Unix
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl FileBackend {
    /// Opens the namespace file at `path`, loading existing entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or decoded.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let entries = match fs::read(path) {
            Ok(bytes) => decode_entries(&bytes)?,
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries: RwLock::new(entries),
        })
    }

    /// Returns the path of the namespace file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn commit<F>(&self, mutate: F) -> StorageResult<()>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let mut entries = self.entries.write();
        let mut next = entries.clone();
        mutate(&mut next);
        if next == *entries {
            return Ok(());
        }
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> StorageResult<()> {
        if entries.is_empty() {
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            sync_parent(&self.path);
            return Ok(());
        }

        let mut bytes = Vec::new();
        ciborium::into_writer(entries, &mut bytes)
            .map_err(|e| StorageError::corrupted(format!("failed to encode namespace: {e}")))?;

        let temp = self.path.with_extension(TEMP_EXTENSION);
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        sync_parent(&self.path);

        debug!(path = %self.path.display(), keys = entries.len(), "namespace committed");
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> StorageResult<()> {
        self.commit(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.commit(|entries| {
            entries.remove(key);
        })
    }

    fn clear(&self) -> StorageResult<()> {
        let mut entries = self.entries.write();
        self.persist(&BTreeMap::new())?;
        entries.clear();
        Ok(())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

fn decode_entries(bytes: &[u8]) -> StorageResult<BTreeMap<String, String>> {
    ciborium::from_reader(bytes)
        .map_err(|e| StorageError::corrupted(format!("failed to decode namespace: {e}")))
}

fn sync_parent(path: &Path) {
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            if let Err(e) = dir.sync_all() {
                warn!(dir = %parent.display(), error = %e, "failed to sync storage directory");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

/// Provider of [`FileBackend`] namespaces under one directory.
///
/// Holds an exclusive advisory lock on `<root>/LOCK` for its whole lifetime,
/// so only one process writes cursors at a time.
///
/// # Example
///
/// ```no_run
/// use mailsync_storage::{FileProvider, StorageProvider};
/// use std::path::Path;
///
/// let provider = FileProvider::open(Path::new("cursors")).unwrap();
/// provider.open("user-1").unwrap().put("latest_event_id", "ev-7").unwrap();
/// ```
#[derive(Debug)]
pub struct FileProvider {
    root: PathBuf,
    backends: Mutex<HashMap<String, Arc<FileBackend>>>,
    _lock_file: File,
}

impl FileProvider {
    /// Opens or creates the storage directory and takes its lock.
    ///
    /// Leftover temporary files from interrupted commits are removed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another process owns the directory,
    /// or an I/O error if the directory cannot be prepared.
    pub fn open(root: &Path) -> StorageResult<Self> {
        fs::create_dir_all(root)?;
        if !root.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("not a directory: {}", root.display()),
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(root.to_path_buf()));
        }

        for entry in fs::read_dir(root)? {
            let path = entry?.path();
            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(TEMP_EXTENSION));
            if is_temp {
                warn!(path = %path.display(), "removing interrupted commit");
                fs::remove_file(&path)?;
            }
        }

        Ok(Self {
            root: root.to_path_buf(),
            backends: Mutex::new(HashMap::new()),
            _lock_file: lock_file,
        })
    }

    /// Returns the storage directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_path(&self, namespace: &str) -> PathBuf {
        self.root
            .join(to_hex(namespace.as_bytes()))
            .with_extension(NAMESPACE_EXTENSION)
    }
}

impl StorageProvider for FileProvider {
    fn open(&self, namespace: &str) -> StorageResult<Arc<dyn StorageBackend>> {
        validate_namespace(namespace)?;
        let mut backends = self.backends.lock();
        if let Some(existing) = backends.get(namespace) {
            return Ok(Arc::clone(existing) as Arc<dyn StorageBackend>);
        }
        let backend = Arc::new(FileBackend::open(&self.namespace_path(namespace))?);
        backends.insert(namespace.to_string(), Arc::clone(&backend));
        Ok(backend)
    }

    fn namespaces(&self) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(NAMESPACE_EXTENSION) {
                continue;
            }
            let decoded = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(from_hex)
                .and_then(|bytes| String::from_utf8(bytes).ok());
            match decoded {
                Some(name) => names.push(name),
                None => warn!(path = %path.display(), "ignoring unrecognized namespace file"),
            }
        }
        names.sort();
        Ok(names)
    }

    fn destroy(&self, namespace: &str) -> StorageResult<()> {
        // Empty outstanding handles first so they stop serving old entries.
        if let Some(backend) = self.backends.lock().remove(namespace) {
            backend.clear()?;
        }
        match fs::remove_file(self.namespace_path(namespace)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
