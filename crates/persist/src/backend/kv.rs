//! Key-value backend (NVS-style store with native durability).
//!
//! Each slot is one blob keyed by the decimal slot offset. The blob holds the
//! payload words and the trailing checksum word, little-endian. Every write
//! is committed immediately.

use super::Backend;
use crate::error::BackendError;
use nvpref_common::{SlotRange, Tier, WORD_BYTES};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// External key-value store driven by [`KvBackend`].
pub trait KeyValueStore: Send {
    fn open(&mut self, namespace: &str) -> Result<(), BackendError>;

    /// Wipe the whole store. Used once to recover from a failed `open`.
    fn erase_all(&mut self) -> Result<(), BackendError>;

    fn set_blob(&mut self, key: &str, bytes: &[u8]) -> Result<(), BackendError>;

    /// Read a blob. A missing key is `BackendError::NotFound`.
    fn get_blob(&self, key: &str) -> Result<Vec<u8>, BackendError>;

    fn commit(&mut self) -> Result<(), BackendError>;
}

/// [`Backend`] over a [`KeyValueStore`].
pub struct KvBackend<S> {
    store: S,
    namespace: String,
}

impl<S: KeyValueStore> KvBackend<S> {
    pub fn new(store: S, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

fn slot_key(range: &SlotRange) -> String {
    range.offset.to_string()
}

impl<S: KeyValueStore> Backend for KvBackend<S> {
    fn open(&mut self) -> Result<(), BackendError> {
        match self.store.open(&self.namespace) {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(namespace = %self.namespace, %err, "opening store failed, erasing");
                self.store.erase_all()?;
                self.store
                    .open(&self.namespace)
                    .map_err(|err| BackendError::OpenFailed(err.to_string()))
            }
        }
    }

    fn read(&self, range: &SlotRange, out: &mut [u32]) -> Result<(), BackendError> {
        let key = slot_key(range);
        let bytes = self.store.get_blob(&key)?;
        if bytes.len() != out.len() * WORD_BYTES {
            // The slot layout changed since the blob was written.
            tracing::debug!(
                key = %key,
                stored = bytes.len(),
                expected = out.len() * WORD_BYTES,
                "blob length mismatch"
            );
            return Err(BackendError::NotFound(key));
        }
        for (word, chunk) in out.iter_mut().zip(bytes.chunks_exact(WORD_BYTES)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(())
    }

    fn write(&mut self, range: &SlotRange, words: &[u32]) -> Result<(), BackendError> {
        let key = slot_key(range);
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.store.set_blob(&key, &bytes)?;
        self.store.commit()
    }

    fn capacity_words(&self, _tier: Tier) -> Option<usize> {
        None
    }

    // Keys carry no tier.
    fn shared_address_space(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "key-value"
    }
}

#[derive(Debug, Default)]
struct KvState {
    namespace: Option<String>,
    entries: BTreeMap<String, Vec<u8>>,
    failing_opens: usize,
    fail_writes: bool,
    commits: usize,
}

/// In-memory [`KeyValueStore`] for tests and host simulation.
///
/// Clones share state, so a test can keep a clone to inspect or corrupt
/// blobs after handing the store to a backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryKvStore {
    state: Arc<Mutex<KvState>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, KvState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` calls to `open` fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.state().failing_opens = count;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    /// Namespace of the last successful `open`.
    pub fn namespace(&self) -> Option<String> {
        self.state().namespace.clone()
    }

    pub fn blob(&self, key: &str) -> Option<Vec<u8>> {
        self.state().entries.get(key).cloned()
    }

    /// Overwrite a blob without going through a backend.
    pub fn put_blob(&self, key: &str, bytes: Vec<u8>) {
        self.state().entries.insert(key.to_string(), bytes);
    }

    pub fn keys(&self) -> Vec<String> {
        self.state().entries.keys().cloned().collect()
    }

    pub fn commit_count(&self) -> usize {
        self.state().commits
    }
}

impl KeyValueStore for MemoryKvStore {
    fn open(&mut self, namespace: &str) -> Result<(), BackendError> {
        let mut state = self.state();
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(BackendError::OpenFailed(format!(
                "namespace {namespace} unavailable"
            )));
        }
        state.namespace = Some(namespace.to_string());
        Ok(())
    }

    fn erase_all(&mut self) -> Result<(), BackendError> {
        self.state().entries.clear();
        Ok(())
    }

    fn set_blob(&mut self, key: &str, bytes: &[u8]) -> Result<(), BackendError> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(BackendError::Device(format!("write to {key} failed")));
        }
        state.entries.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get_blob(&self, key: &str) -> Result<Vec<u8>, BackendError> {
        self.state()
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    fn commit(&mut self) -> Result<(), BackendError> {
        self.state().commits += 1;
        Ok(())
    }
}
