//! File-backed stand-ins for device storage.
//!
//! `FileKvStore` keeps blobs in a JSON map and writes it on every commit.
//! `FileRegion` keeps a flash sector as a JSON word array and writes it on
//! every sector write.

use nvpref_persist::{BackendError, KeyValueStore, RawMemory};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

fn device_err(path: &Path, err: impl std::fmt::Display) -> BackendError {
    BackendError::Device(format!("{}: {err}", path.display()))
}

/// Key-value store persisted as `{ "<key>": [bytes...] }`.
#[derive(Debug)]
pub struct FileKvStore {
    path: PathBuf,
    entries: BTreeMap<String, Vec<u8>>,
}

impl FileKvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Read the stored entries without opening a backend.
    pub fn read_entries(path: &Path) -> Result<BTreeMap<String, Vec<u8>>, BackendError> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let file = std::fs::File::open(path).map_err(|e| device_err(path, e))?;
        serde_json::from_reader(file).map_err(|e| BackendError::OpenFailed(e.to_string()))
    }
}

impl KeyValueStore for FileKvStore {
    fn open(&mut self, namespace: &str) -> Result<(), BackendError> {
        self.entries = Self::read_entries(&self.path)?;
        tracing::debug!(namespace, path = %self.path.display(), keys = self.entries.len(), "store opened");
        Ok(())
    }

    fn erase_all(&mut self) -> Result<(), BackendError> {
        self.entries.clear();
        self.commit()
    }

    fn set_blob(&mut self, key: &str, bytes: &[u8]) -> Result<(), BackendError> {
        self.entries.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get_blob(&self, key: &str) -> Result<Vec<u8>, BackendError> {
        self.entries
            .get(key)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    fn commit(&mut self) -> Result<(), BackendError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| device_err(parent, e))?;
        }
        let file = std::fs::File::create(&self.path).map_err(|e| device_err(&self.path, e))?;
        serde_json::to_writer_pretty(file, &self.entries).map_err(|e| device_err(&self.path, e))
    }
}

/// Word-addressed region persisted as a JSON array.
#[derive(Debug)]
pub struct FileRegion {
    path: PathBuf,
    words: Vec<u32>,
}

impl FileRegion {
    /// Load the region from `path`, or start erased (all ones) if absent.
    pub fn open(path: impl Into<PathBuf>, len_words: usize) -> Result<Self, BackendError> {
        let path = path.into();
        let mut words = if path.exists() {
            let file = std::fs::File::open(&path).map_err(|e| device_err(&path, e))?;
            serde_json::from_reader::<_, Vec<u32>>(file).map_err(|e| device_err(&path, e))?
        } else {
            Vec::new()
        };
        words.resize(len_words, u32::MAX);
        Ok(Self { path, words })
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }
}

impl RawMemory for FileRegion {
    fn len_words(&self) -> usize {
        self.words.len()
    }

    fn read_words(&self, offset: usize, out: &mut [u32]) -> Result<(), BackendError> {
        let end = offset + out.len();
        let source = self.words.get(offset..end).ok_or(BackendError::OutOfRange {
            offset,
            end,
            capacity: self.words.len(),
        })?;
        out.copy_from_slice(source);
        Ok(())
    }

    fn write_words(&mut self, offset: usize, words: &[u32]) -> Result<(), BackendError> {
        let end = offset + words.len();
        let capacity = self.words.len();
        self.words
            .get_mut(offset..end)
            .ok_or(BackendError::OutOfRange {
                offset,
                end,
                capacity,
            })?
            .copy_from_slice(words);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), BackendError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| device_err(parent, e))?;
        }
        let file = std::fs::File::create(&self.path).map_err(|e| device_err(&self.path, e))?;
        serde_json::to_writer(file, &self.words).map_err(|e| device_err(&self.path, e))
    }
}
