use crate::codec;
use crate::error::{BackendError, PreferenceError};
use crate::manager::{SharedCore, lock_core};
use bytemuck::{Pod, Zeroable};
use nvpref_common::{RestoreMode, SlotRange, Tier, TypeTag, WORD_BYTES};

/// Handle to one allocated preference slot.
///
/// The handle owns the slot's mirror buffer and shares the backend with the
/// manager that created it. A default-constructed handle is uninitialized:
/// `save` fails and `load` zero-fills its destination.
#[derive(Default)]
pub struct Preference {
    range: Option<SlotRange>,
    type_tag: TypeTag,
    restore_mode: RestoreMode,
    mirror: Vec<u32>,
    fallback: Option<Vec<u32>>,
    core: Option<SharedCore>,
}

impl std::fmt::Debug for Preference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preference")
            .field("range", &self.range)
            .field("type_tag", &self.type_tag)
            .field("restore_mode", &self.restore_mode)
            .field("has_fallback_value", &self.fallback.is_some())
            .finish_non_exhaustive()
    }
}

/// Raw slot access used by the manager.
///
/// `read_raw`/`write_raw` move payload plus checksum without any checksum
/// logic; `load_verified`/`save_sealed` wrap them with the codec.
pub(crate) trait SlotIo {
    fn read_raw(&self, stored: &mut [u32]) -> Result<(), PreferenceError>;
    fn write_raw(&self, stored: &[u32]) -> Result<(), PreferenceError>;
    fn load_verified(&mut self) -> Result<(), PreferenceError>;
    fn save_sealed(&mut self) -> Result<(), PreferenceError>;
    fn configure(&mut self, restore_mode: RestoreMode, initial: Option<&[u8]>);
}

impl Preference {
    pub(crate) fn new(range: SlotRange, type_tag: TypeTag, core: SharedCore) -> Self {
        Self {
            range: Some(range),
            type_tag,
            restore_mode: RestoreMode::DefaultBackend,
            mirror: vec![0; range.length_words],
            fallback: None,
            core: Some(core),
        }
    }

    /// True iff the handle came from a successful allocation.
    pub fn is_initialized(&self) -> bool {
        self.core.is_some() && self.range.is_some() && !self.mirror.is_empty()
    }

    pub fn range(&self) -> Option<SlotRange> {
        self.range
    }

    pub fn offset(&self) -> Option<usize> {
        self.range.map(|r| r.offset)
    }

    pub fn tier(&self) -> Option<Tier> {
        self.range.map(|r| r.tier)
    }

    pub fn length_words(&self) -> usize {
        self.mirror.len()
    }

    pub fn capacity_bytes(&self) -> usize {
        self.mirror.len() * WORD_BYTES
    }

    pub fn type_tag(&self) -> TypeTag {
        self.type_tag
    }

    pub fn restore_mode(&self) -> RestoreMode {
        self.restore_mode
    }

    pub fn has_fallback_value(&self) -> bool {
        self.fallback.is_some()
    }

    /// Persist `value`. Returns false if the handle is uninitialized, the
    /// value does not fit, the write guard is active or the backend fails.
    pub fn save<T: Pod>(&mut self, value: &T) -> bool {
        match self.try_save(value) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(tag = %self.type_tag, %err, "save failed");
                false
            }
        }
    }

    /// Restore into `value` according to the slot's restore mode.
    ///
    /// A failed checksum is rescued by the initial value if one was given at
    /// allocation. On failure `value` is left untouched, except for an
    /// uninitialized handle which zero-fills it.
    pub fn load<T: Pod>(&mut self, value: &mut T) -> bool {
        match self.try_load(value) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(tag = %self.type_tag, %err, "load failed");
                false
            }
        }
    }

    pub fn try_save<T: Pod>(&mut self, value: &T) -> Result<(), PreferenceError> {
        if !self.is_initialized() {
            return Err(PreferenceError::Uninitialized);
        }
        let bytes = bytemuck::bytes_of(value);
        if bytes.len() > self.capacity_bytes() {
            return Err(PreferenceError::ValueTooLarge {
                size: bytes.len(),
                capacity: self.capacity_bytes(),
            });
        }
        self.mirror.fill(0);
        let target = bytemuck::cast_slice_mut::<u32, u8>(&mut self.mirror);
        target[..bytes.len()].copy_from_slice(bytes);
        self.save_sealed()
    }

    pub fn try_load<T: Pod>(&mut self, value: &mut T) -> Result<(), PreferenceError> {
        self.mirror.fill(0);
        if !self.is_initialized() {
            *value = T::zeroed();
            return Err(PreferenceError::Uninitialized);
        }
        let size = std::mem::size_of::<T>();
        if size > self.capacity_bytes() {
            return Err(PreferenceError::ValueTooLarge {
                size,
                capacity: self.capacity_bytes(),
            });
        }

        if self.restore_mode.reads_backend() {
            if let Err(err) = self.load_verified() {
                if !self.restore_fallback() {
                    self.mirror.fill(0);
                    return Err(err);
                }
                tracing::debug!(tag = %self.type_tag, %err, "using initial value");
            }
        } else if !self.restore_fallback() {
            return Err(PreferenceError::MissingFallback);
        }

        let stored = bytemuck::cast_slice::<u32, u8>(&self.mirror);
        bytemuck::bytes_of_mut(value).copy_from_slice(&stored[..size]);
        Ok(())
    }

    fn restore_fallback(&mut self) -> bool {
        match &self.fallback {
            Some(fallback) => {
                self.mirror.copy_from_slice(fallback);
                true
            }
            None => false,
        }
    }

    fn shared_core(&self) -> Result<(&SharedCore, &SlotRange), PreferenceError> {
        match (&self.core, &self.range) {
            (Some(core), Some(range)) => Ok((core, range)),
            _ => Err(PreferenceError::Uninitialized),
        }
    }
}

impl SlotIo for Preference {
    fn read_raw(&self, stored: &mut [u32]) -> Result<(), PreferenceError> {
        let (core, range) = self.shared_core()?;
        lock_core(core)?.read_slot(range, stored)
    }

    fn write_raw(&self, stored: &[u32]) -> Result<(), PreferenceError> {
        let (core, range) = self.shared_core()?;
        lock_core(core)?.write_slot(range, stored)
    }

    fn load_verified(&mut self) -> Result<(), PreferenceError> {
        let len = self.mirror.len();
        let mut stored = vec![0u32; len + 1];
        if let Err(err) = self.read_raw(&mut stored) {
            if matches!(err, PreferenceError::Backend(BackendError::NotFound(_))) {
                tracing::debug!(tag = %self.type_tag, "slot never written");
            }
            return Err(err);
        }

        let (payload, tail) = stored.split_at(len);
        let expected = codec::checksum(payload, self.type_tag);
        let actual = tail[0];
        if actual != expected {
            if stored.iter().all(|w| *w == 0) || stored.iter().all(|w| *w == u32::MAX) {
                tracing::debug!(tag = %self.type_tag, "slot never written");
            } else {
                tracing::warn!(tag = %self.type_tag, expected, actual, "slot checksum mismatch");
            }
            return Err(PreferenceError::ChecksumMismatch { expected, actual });
        }

        self.mirror.copy_from_slice(payload);
        tracing::trace!(tag = %self.type_tag, words = len, "slot loaded");
        Ok(())
    }

    fn save_sealed(&mut self) -> Result<(), PreferenceError> {
        let mut stored = Vec::with_capacity(self.mirror.len() + 1);
        stored.extend_from_slice(&self.mirror);
        stored.push(codec::checksum(&self.mirror, self.type_tag));
        self.write_raw(&stored)?;
        tracing::trace!(tag = %self.type_tag, words = self.mirror.len(), "slot saved");
        Ok(())
    }

    fn configure(&mut self, restore_mode: RestoreMode, initial: Option<&[u8]>) {
        self.restore_mode = restore_mode;
        self.mirror.fill(0);
        if let Some(bytes) = initial {
            let target = bytemuck::cast_slice_mut::<u32, u8>(&mut self.mirror);
            let len = bytes.len().min(target.len());
            target[..len].copy_from_slice(&bytes[..len]);
            self.fallback = Some(self.mirror.clone());
        }
    }
}
