//! Global values for automations and components, optionally restored across
//! resets.
//!
//! A [`RestoringGlobal`] owns one preference slot whose type tag is derived
//! from the global's id. It loads on `setup` and persists on `loop_once`
//! whenever the value changed since the last successful save.

use bytemuck::Pod;
use nvpref_common::{RestoreMode, TypeTag};
use nvpref_persist::{Preference, Preferences};
use sha2::{Digest, Sha256};

/// Derive a stable type tag from a global's id.
///
/// Uses the first four bytes of the SHA-256 digest, little-endian, so
/// renaming a global starts it from its initial value.
pub fn type_tag_for_id(id: &str) -> TypeTag {
    let digest = Sha256::digest(id.as_bytes());
    TypeTag(u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]))
}

/// A named value held in memory only.
#[derive(Debug, Clone)]
pub struct Global<T> {
    id: String,
    value: T,
}

impl<T> Global<T> {
    pub fn new(id: impl Into<String>, initial: T) -> Self {
        Self {
            id: id.into(),
            value: initial,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut T {
        &mut self.value
    }

    pub fn set(&mut self, value: T) {
        self.value = value;
    }
}

/// A named value restored from and persisted to preference storage.
#[derive(Debug)]
pub struct RestoringGlobal<T> {
    id: String,
    value: T,
    persisted: T,
    restore_mode: RestoreMode,
    pref: Preference,
}

impl<T: Pod + PartialEq> RestoringGlobal<T> {
    pub fn new(id: impl Into<String>, initial: T) -> Self {
        Self {
            id: id.into(),
            value: initial,
            persisted: initial,
            restore_mode: RestoreMode::DefaultBackend,
            pref: Preference::default(),
        }
    }

    pub fn with_restore_mode(mut self, restore_mode: RestoreMode) -> Self {
        self.restore_mode = restore_mode;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn type_tag(&self) -> TypeTag {
        type_tag_for_id(&self.id)
    }

    pub fn restore_mode(&self) -> RestoreMode {
        self.restore_mode
    }

    /// Allocate the backing slot and restore the stored value.
    ///
    /// The current value doubles as the fallback, so a missing or corrupt
    /// slot leaves it unchanged. Returns false if no slot could be allocated.
    /// Once a slot is held, further calls do nothing and return true.
    pub fn setup(&mut self, prefs: &Preferences) -> bool {
        if self.pref.is_initialized() {
            return true;
        }
        self.pref = prefs.allocate_for(self.type_tag(), self.restore_mode, &self.value);
        if !self.pref.is_initialized() {
            tracing::warn!(id = %self.id, "no storage for global");
            return false;
        }

        let mut restored = self.value;
        if self.pref.load(&mut restored) {
            self.value = restored;
        }
        self.persisted = self.value;
        tracing::debug!(id = %self.id, mode = %self.restore_mode, "global restored");
        true
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut T {
        &mut self.value
    }

    pub fn set(&mut self, value: T) {
        self.value = value;
    }

    /// Whether the value differs from the last persisted one.
    pub fn is_dirty(&self) -> bool {
        self.value != self.persisted
    }

    /// Persist the value if it changed. Returns true if a save happened.
    ///
    /// A rejected save (e.g. write guard active) keeps the value dirty so the
    /// next call retries.
    pub fn loop_once(&mut self) -> bool {
        if !self.is_dirty() {
            return false;
        }
        if !self.pref.save(&self.value) {
            tracing::trace!(id = %self.id, "global save deferred");
            return false;
        }
        self.persisted = self.value;
        true
    }
}
