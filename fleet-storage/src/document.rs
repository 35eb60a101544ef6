//! Versioned JSON documents with compare-and-swap writes.
//!
//! A document's revision is the SHA-256 fingerprint of its serialized bytes,
//! so any writer (including external tools that know nothing about us) bumps
//! it. A missing document has the empty revision and loads as `T::default()`.

use fleet_core::{fingerprint, FleetError, FleetResult, StoreError};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

// ============================================================================
// REVISIONS
// ============================================================================

/// Opaque revision marker of a stored document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Revision(String);

impl Revision {
    /// Revision of a document that does not exist yet.
    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(fingerprint(bytes))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            f.write_str("<none>")
        } else {
            f.write_str(&self.0[..self.0.len().min(12)])
        }
    }
}

/// A loaded document together with the revision it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub revision: Revision,
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// A single shared document.
///
/// Writers read, modify, then `compare_and_swap` against the revision they
/// read. A concurrent writer in between makes the swap fail with
/// `StoreError::RevisionMismatch` and nothing is written.
pub trait DocumentStore<T>: Send + Sync {
    /// Load and decode the document.
    fn load(&self) -> FleetResult<Versioned<T>>;

    /// Load the document as untyped JSON, `None` if it does not exist.
    /// Works even when the content no longer decodes as `T`.
    fn load_raw(&self) -> FleetResult<Option<serde_json::Value>>;

    /// Replace the document if it is still at `expected`. Returns the new
    /// revision.
    fn compare_and_swap(&self, expected: &Revision, next: &T) -> FleetResult<Revision>;
}

fn encode<T: Serialize>(path: &Path, value: &T) -> FleetResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::parse(path, e))?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn decode<T: DeserializeOwned + Default>(
    path: &Path,
    bytes: Option<&[u8]>,
) -> FleetResult<Versioned<T>> {
    match bytes {
        None => Ok(Versioned {
            value: T::default(),
            revision: Revision::empty(),
        }),
        Some(bytes) => {
            let value = serde_json::from_slice(bytes).map_err(|e| StoreError::parse(path, e))?;
            Ok(Versioned {
                value,
                revision: Revision::of_bytes(bytes),
            })
        }
    }
}

/// Read-modify-write with bounded retries on revision mismatch.
///
/// `f` runs against a fresh copy on every attempt and may abort the whole
/// operation by returning an error. After `max_attempts` lost races the last
/// `RevisionMismatch` is returned.
pub fn modify<T, R>(
    store: &dyn DocumentStore<T>,
    max_attempts: u32,
    mut f: impl FnMut(&mut T) -> FleetResult<R>,
) -> FleetResult<R> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let Versioned {
            mut value,
            revision,
        } = store.load()?;
        let out = f(&mut value)?;
        match store.compare_and_swap(&revision, &value) {
            Ok(_) => return Ok(out),
            Err(FleetError::Store(StoreError::RevisionMismatch { .. })) if attempt < max_attempts => {
                tracing::debug!(attempt, "document write raced, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// FILE STORE
// ============================================================================

const LOCK_POLL: Duration = Duration::from_millis(10);

/// JSON file on local disk.
///
/// Writes take an exclusive advisory lock on a `<file>.lock` sidecar, re-read
/// the file to check the revision, then write a temp file in the same
/// directory and rename it over the original. Readers never see a partial
/// document.
#[derive(Debug)]
pub struct JsonFileStore<T> {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonFileStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            path.with_file_name(format!("{name}.lock"))
        };
        Self {
            path,
            lock_path,
            lock_timeout: Duration::from_secs(5),
            _marker: PhantomData,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_bytes(&self) -> FleetResult<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&self.path, e).into()),
        }
    }

    fn acquire_lock(&self) -> FleetResult<fs::File> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| StoreError::io(&self.lock_path, e))?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(file),
                Err(_) if start.elapsed() < self.lock_timeout => std::thread::sleep(LOCK_POLL),
                Err(_) => {
                    return Err(StoreError::LockTimeout {
                        path: self.lock_path.display().to_string(),
                    }
                    .into())
                }
            }
        }
    }

    /// Revision check and write. Caller holds the sidecar lock.
    fn swap_locked(&self, expected: &Revision, bytes: &[u8]) -> FleetResult<Revision> {
        let current = self
            .read_bytes()?
            .map(|b| Revision::of_bytes(&b))
            .unwrap_or_else(Revision::empty);
        if &current != expected {
            return Err(StoreError::RevisionMismatch {
                expected: expected.to_string(),
                found: current.to_string(),
            }
            .into());
        }
        self.write_atomic(bytes)?;
        Ok(Revision::of_bytes(bytes))
    }

    fn write_atomic(&self, bytes: &[u8]) -> FleetResult<()> {
        let dir = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(dir) => dir.to_path_buf(),
            None => PathBuf::from("."),
        };
        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| StoreError::io(&dir, e))?;
        tmp.write_all(bytes)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| StoreError::io(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| StoreError::io(&self.path, e.error))?;
        Ok(())
    }
}

impl<T> DocumentStore<T> for JsonFileStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    fn load(&self) -> FleetResult<Versioned<T>> {
        let bytes = self.read_bytes()?;
        decode(&self.path, bytes.as_deref())
    }

    fn load_raw(&self) -> FleetResult<Option<serde_json::Value>> {
        match self.read_bytes()? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::parse(&self.path, e).into()),
        }
    }

    fn compare_and_swap(&self, expected: &Revision, next: &T) -> FleetResult<Revision> {
        let bytes = encode(&self.path, next)?;
        let lock = self.acquire_lock()?;

        let result = self.swap_locked(expected, &bytes);
        if let Err(e) = FileExt::unlock(&lock) {
            tracing::warn!(path = %self.lock_path.display(), error = %e, "failed to release document lock");
        }
        result
    }
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// In-memory document for tests. Holds the serialized bytes so revisions
/// behave exactly like the file store.
#[derive(Debug, Clone)]
pub struct InMemoryDocumentStore<T> {
    bytes: Arc<RwLock<Option<Vec<u8>>>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for InMemoryDocumentStore<T> {
    fn default() -> Self {
        Self {
            bytes: Arc::new(RwLock::new(None)),
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize> InMemoryDocumentStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with a typed value.
    pub fn with_value(value: &T) -> FleetResult<Self> {
        let store = Self::default();
        store.put_raw(&serde_json::to_value(value).map_err(|e| StoreError::parse("<memory>", e))?)?;
        Ok(store)
    }

    /// Overwrite the content unconditionally, as an external writer would.
    pub fn put_raw(&self, value: &serde_json::Value) -> FleetResult<()> {
        let bytes = encode(Path::new("<memory>"), value)?;
        *self.bytes.write().map_err(|_| StoreError::LockPoisoned)? = Some(bytes);
        Ok(())
    }
}

impl<T> DocumentStore<T> for InMemoryDocumentStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    fn load(&self) -> FleetResult<Versioned<T>> {
        let guard = self.bytes.read().map_err(|_| StoreError::LockPoisoned)?;
        decode(Path::new("<memory>"), guard.as_deref())
    }

    fn load_raw(&self) -> FleetResult<Option<serde_json::Value>> {
        let guard = self.bytes.read().map_err(|_| StoreError::LockPoisoned)?;
        match guard.as_deref() {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(bytes)
                .map(Some)
                .map_err(|e| StoreError::parse("<memory>", e).into()),
        }
    }

    fn compare_and_swap(&self, expected: &Revision, next: &T) -> FleetResult<Revision> {
        let bytes = encode(Path::new("<memory>"), next)?;
        let mut guard = self.bytes.write().map_err(|_| StoreError::LockPoisoned)?;
        let current = guard
            .as_deref()
            .map(Revision::of_bytes)
            .unwrap_or_else(Revision::empty);
        if &current != expected {
            return Err(StoreError::RevisionMismatch {
                expected: expected.to_string(),
                found: current.to_string(),
            }
            .into());
        }
        let revision = Revision::of_bytes(&bytes);
        *guard = Some(bytes);
        Ok(revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    struct Counter {
        value: u32,
    }

    fn exercise_cas(store: &dyn DocumentStore<Counter>) {
        let first = store.load().unwrap();
        assert!(first.revision.is_empty());
        assert_eq!(first.value, Counter::default());

        let rev1 = store
            .compare_and_swap(&first.revision, &Counter { value: 1 })
            .unwrap();
        assert!(!rev1.is_empty());

        // Stale writer loses
        let err = store
            .compare_and_swap(&first.revision, &Counter { value: 99 })
            .unwrap_err();
        assert!(matches!(
            err,
            FleetError::Store(StoreError::RevisionMismatch { .. })
        ));

        let loaded = store.load().unwrap();
        assert_eq!(loaded.value.value, 1);
        assert_eq!(loaded.revision, rev1);
    }

    #[test]
    fn test_in_memory_cas() {
        exercise_cas(&InMemoryDocumentStore::<Counter>::new());
    }

    #[test]
    fn test_file_cas() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::<Counter>::new(dir.path().join("nested").join("counter.json"));
        exercise_cas(&store);
        assert!(store.path().exists());
    }

    #[test]
    fn test_external_write_bumps_revision() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let store = JsonFileStore::<Counter>::new(&path);
        let rev = store.compare_and_swap(&Revision::empty(), &Counter { value: 1 }).unwrap();

        fs::write(&path, r#"{"value": 7}"#).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.value.value, 7);
        assert_ne!(loaded.revision, rev);
        assert!(store.compare_and_swap(&rev, &Counter { value: 2 }).is_err());
    }

    #[test]
    fn test_modify_aborts_without_writing() {
        let store = InMemoryDocumentStore::<Counter>::new();
        modify(&store, 3, |c: &mut Counter| {
            c.value = 5;
            Ok(())
        })
        .unwrap();
        let err = modify(&store, 3, |c: &mut Counter| -> FleetResult<()> {
            c.value = 6;
            Err(StoreError::NotFound { id: "x".into() }.into())
        })
        .unwrap_err();
        assert!(matches!(err, FleetError::Store(StoreError::NotFound { .. })));
        assert_eq!(store.load().unwrap().value.value, 5);
    }

    #[test]
    fn test_load_raw_survives_bad_shape() {
        let store = InMemoryDocumentStore::<Counter>::new();
        store.put_raw(&serde_json::json!({"value": "not a number"})).unwrap();
        assert!(store.load().is_err());
        let raw = store.load_raw().unwrap().unwrap();
        assert_eq!(raw["value"], "not a number");
    }

    #[test]
    fn test_concurrent_increments_never_lose_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counter.json");
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = JsonFileStore::<Counter>::new(path);
                    for _ in 0..10 {
                        loop {
                            let current = store.load().unwrap();
                            let next = Counter {
                                value: current.value.value + 1,
                            };
                            if store.compare_and_swap(&current.revision, &next).is_ok() {
                                break;
                            }
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let store = JsonFileStore::<Counter>::new(path);
        assert_eq!(store.load().unwrap().value.value, 40);
    }
}
