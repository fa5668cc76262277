use crate::backend::{Backend, KeyValueStore, KvBackend, RawBackend, RawMemory};
use crate::error::PreferenceError;
use crate::preference::{Preference, SlotIo};
use bytemuck::Pod;
use nvpref_common::{
    PreferencesConfig, RestoreMode, SlotRange, Tier, TypeTag, words_for_bytes,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// State shared between the manager and every handle it created.
pub(crate) struct Core {
    backend: Box<dyn Backend>,
    attached: bool,
    write_guard: bool,
    fast_cursor: usize,
    durable_cursor: usize,
    slots: usize,
}

pub(crate) type SharedCore = Arc<Mutex<Core>>;

pub(crate) fn lock_core(core: &SharedCore) -> Result<MutexGuard<'_, Core>, PreferenceError> {
    core.lock().map_err(|_| PreferenceError::LockPoisoned)
}

impl Core {
    fn cursor_mut(&mut self, tier: Tier) -> &mut usize {
        let tier = if self.backend.shared_address_space() {
            Tier::Durable
        } else {
            tier
        };
        match tier {
            Tier::Fast => &mut self.fast_cursor,
            Tier::Durable => &mut self.durable_cursor,
        }
    }

    /// Reserve a slot of `length_words` payload words plus checksum.
    fn reserve(&mut self, tier: Tier, length_words: usize) -> Option<SlotRange> {
        let cursor = *self.cursor_mut(tier);
        let start = self.backend.place(tier, cursor, length_words + 1)?;
        let range = SlotRange::new(tier, start, length_words);
        *self.cursor_mut(tier) = range.end();
        self.slots += 1;
        Some(range)
    }

    pub(crate) fn read_slot(
        &self,
        range: &SlotRange,
        stored: &mut [u32],
    ) -> Result<(), PreferenceError> {
        if !self.attached {
            return Err(PreferenceError::NotAttached);
        }
        self.backend.read(range, stored)?;
        Ok(())
    }

    pub(crate) fn write_slot(
        &mut self,
        range: &SlotRange,
        stored: &[u32],
    ) -> Result<(), PreferenceError> {
        if !self.attached {
            return Err(PreferenceError::NotAttached);
        }
        if self.write_guard && self.backend.honors_write_guard() {
            tracing::debug!(offset = range.offset, tier = %range.tier, "write suppressed by guard");
            return Err(PreferenceError::WriteGuarded);
        }
        self.backend.write(range, stored)?;
        Ok(())
    }
}

/// Words used and available in each tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationStats {
    pub fast_used: usize,
    pub fast_capacity: Option<usize>,
    pub durable_used: usize,
    pub durable_capacity: Option<usize>,
    pub slots: usize,
}

/// Preference manager: owns the backend and allocates slots.
///
/// Cloning yields another reference to the same manager. Handles hold a
/// reference to the shared core, so they stay usable after the manager value
/// that created them is dropped.
#[derive(Clone)]
pub struct Preferences {
    core: SharedCore,
    default_durable: bool,
}

impl Preferences {
    /// Create an unattached manager over `backend`.
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self {
            core: Arc::new(Mutex::new(Core {
                backend: Box::new(backend),
                attached: false,
                write_guard: false,
                fast_cursor: 0,
                durable_cursor: 0,
                slots: 0,
            })),
            default_durable: true,
        }
    }

    /// Tier used for `RestoreMode::DefaultBackend` and untyped defaults.
    pub fn with_default_durable(mut self, default_durable: bool) -> Self {
        self.default_durable = default_durable;
        self
    }

    /// Manager over a key-value store, configured from `config`.
    pub fn key_value<S: KeyValueStore + 'static>(store: S, config: &PreferencesConfig) -> Self {
        Self::new(KvBackend::new(store, config.namespace.clone()))
            .with_default_durable(config.default_durable)
    }

    /// Manager over RTC memory and a flash sector, configured from `config`.
    pub fn raw_memory<R, F>(rtc: R, flash: F, config: &PreferencesConfig) -> Self
    where
        R: RawMemory + 'static,
        F: RawMemory + 'static,
    {
        let backend = RawBackend::new(rtc, flash, config.rtc_reserved_words)
            .with_flush_on_write(config.flush_on_write);
        Self::new(backend).with_default_durable(config.default_durable)
    }

    pub fn default_durable(&self) -> bool {
        self.default_durable
    }

    /// Attach the backend. Must succeed before any allocation.
    ///
    /// Failure is reported once and not retried. Calling `begin` on an
    /// attached manager does nothing.
    pub fn begin(&self) -> Result<(), PreferenceError> {
        let mut core = lock_core(&self.core)?;
        if core.attached {
            return Ok(());
        }
        if let Err(err) = core.backend.open() {
            tracing::warn!(backend = core.backend.name(), %err, "attaching backend failed");
            return Err(err.into());
        }
        core.attached = true;
        tracing::debug!(backend = core.backend.name(), "preferences attached");
        Ok(())
    }

    pub fn is_attached(&self) -> bool {
        self.core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .attached
    }

    /// Reserve `length_words` words for values tagged `type_tag`.
    ///
    /// Returns an uninitialized handle if the manager is not attached, the
    /// length is zero or the tier is exhausted.
    pub fn allocate(
        &self,
        length_words: usize,
        type_tag: impl Into<TypeTag>,
        duplicate_to_durable: bool,
    ) -> Preference {
        let type_tag = type_tag.into();
        let tier = Tier::from_durable(duplicate_to_durable);
        if length_words == 0 {
            tracing::warn!(tag = %type_tag, "refusing zero-length preference");
            return Preference::default();
        }

        let mut core = match lock_core(&self.core) {
            Ok(core) => core,
            Err(err) => {
                tracing::warn!(tag = %type_tag, %err, "allocation failed");
                return Preference::default();
            }
        };
        if !core.attached {
            tracing::warn!(tag = %type_tag, "allocation before begin");
            return Preference::default();
        }
        let Some(range) = core.reserve(tier, length_words) else {
            tracing::warn!(tag = %type_tag, %tier, length_words, "preference storage exhausted");
            return Preference::default();
        };
        drop(core);

        tracing::debug!(
            tag = %type_tag,
            %tier,
            offset = range.offset,
            length_words,
            "preference allocated"
        );
        Preference::new(range, type_tag, Arc::clone(&self.core))
    }

    /// Allocate a slot sized for `T` in the platform's default tier.
    pub fn allocate_typed<T: Pod>(&self, type_tag: impl Into<TypeTag>) -> Preference {
        self.allocate_with_policy::<T>(type_tag, RestoreMode::DefaultBackend, None)
    }

    /// Allocate a slot sized for `T` whose `load` falls back to `initial`.
    pub fn allocate_for<T: Pod>(
        &self,
        type_tag: impl Into<TypeTag>,
        restore_mode: RestoreMode,
        initial: &T,
    ) -> Preference {
        self.allocate_with_policy(type_tag, restore_mode, Some(initial))
    }

    /// Allocate a slot sized for `T` with an explicit restore mode and an
    /// optional initial value.
    ///
    /// `AlwaysInitial` without an initial value is accepted here; every
    /// `load` on such a slot then fails.
    pub fn allocate_with_policy<T: Pod>(
        &self,
        type_tag: impl Into<TypeTag>,
        restore_mode: RestoreMode,
        initial: Option<&T>,
    ) -> Preference {
        let durable = restore_mode.wants_durable(self.default_durable);
        let length_words = words_for_bytes(std::mem::size_of::<T>());
        let mut pref = self.allocate(length_words, type_tag, durable);
        if pref.is_initialized() {
            pref.configure(restore_mode, initial.map(bytemuck::bytes_of));
        }
        pref
    }

    /// Suppress raw-memory writes, e.g. while a firmware update owns the
    /// reserved RTC words. Reads are unaffected.
    pub fn set_write_guard(&self, guard: bool) {
        // Applied even if another holder of the lock panicked.
        let mut core = self.core.lock().unwrap_or_else(PoisonError::into_inner);
        core.write_guard = guard;
        tracing::debug!(guard, "write guard changed");
    }

    pub fn is_write_guard_set(&self) -> bool {
        self.core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_guard
    }

    /// Push buffered durable-tier writes to the device.
    pub fn flush(&self) -> Result<(), PreferenceError> {
        let mut core = lock_core(&self.core)?;
        if !core.attached {
            return Err(PreferenceError::NotAttached);
        }
        if core.write_guard && core.backend.honors_write_guard() {
            return Err(PreferenceError::WriteGuarded);
        }
        core.backend.flush()?;
        Ok(())
    }

    /// Allocation summary. Backends with a shared address space count every
    /// slot as durable.
    pub fn stats(&self) -> Result<AllocationStats, PreferenceError> {
        let core = lock_core(&self.core)?;
        Ok(AllocationStats {
            fast_used: core.fast_cursor,
            fast_capacity: core.backend.capacity_words(Tier::Fast),
            durable_used: core.durable_cursor,
            durable_capacity: core.backend.capacity_words(Tier::Durable),
            slots: core.slots,
        })
    }
}

impl std::fmt::Debug for Preferences {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preferences")
            .field("default_durable", &self.default_durable)
            .field("attached", &self.is_attached())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryKvStore, MemoryRegion};
    use crate::error::BackendError;
    use bytemuck::Zeroable;
    use proptest::prelude::*;

    #[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Calibration {
        offset: f32,
        gain: f32,
        samples: u32,
    }

    fn kv_prefs() -> (Preferences, MemoryKvStore) {
        let store = MemoryKvStore::new();
        let prefs = Preferences::key_value(store.clone(), &PreferencesConfig::default());
        prefs.begin().unwrap();
        (prefs, store)
    }

    fn raw_prefs(default_durable: bool) -> (Preferences, MemoryRegion, MemoryRegion) {
        let rtc = MemoryRegion::new(128);
        let flash = MemoryRegion::new(128);
        let config = PreferencesConfig {
            default_durable,
            ..PreferencesConfig::default()
        };
        let prefs = Preferences::raw_memory(rtc.clone(), flash.clone(), &config);
        prefs.begin().unwrap();
        (prefs, rtc, flash)
    }

    #[test]
    fn tag_one_scenario() {
        let (prefs, store) = kv_prefs();
        let mut pref = prefs.allocate_typed::<u32>(1u32);
        assert!(pref.is_initialized());

        let mut value = 0u32;
        assert!(!pref.load(&mut value));

        assert!(pref.save(&42u32));
        assert!(pref.load(&mut value));
        assert_eq!(value, 42);

        let key = pref.offset().unwrap().to_string();
        let mut blob = store.blob(&key).unwrap();
        blob[0] ^= 0x01;
        store.put_blob(&key, blob);
        assert!(!pref.load(&mut value));
    }

    #[test]
    fn struct_round_trip_on_both_tiers() {
        let (prefs, _rtc, _flash) = raw_prefs(true);
        let cal = Calibration {
            offset: -0.25,
            gain: 1.5,
            samples: 64,
        };
        for durable in [false, true] {
            let mut pref = prefs.allocate(3, 9u32, durable);
            assert!(pref.save(&cal));
            let mut out = Calibration::zeroed();
            assert!(pref.load(&mut out));
            assert_eq!(out, cal);
        }
    }

    #[test]
    fn fallback_rescues_corruption() {
        let (prefs, rtc, _flash) = raw_prefs(false);
        let mut pref = prefs.allocate_for(3u32, RestoreMode::DefaultBackend, &0x55u32);
        assert_eq!(pref.tier(), Some(Tier::Fast));

        let mut value = 0u32;
        // Nothing stored yet: the initial value is used.
        assert!(pref.load(&mut value));
        assert_eq!(value, 0x55);

        assert!(pref.save(&7u32));
        assert!(pref.load(&mut value));
        assert_eq!(value, 7);

        // Fast tier logical offset 0 lives after the 32 reserved words.
        rtc.poke(32, 8);
        assert!(pref.load(&mut value));
        assert_eq!(value, 0x55);
    }

    #[test]
    fn always_initial_ignores_stored_data() {
        let (prefs, rtc, _flash) = raw_prefs(true);
        let mut pref = prefs.allocate_for(4u32, RestoreMode::AlwaysInitial, &123u32);
        assert_eq!(pref.tier(), Some(Tier::Fast));

        assert!(pref.save(&999u32));
        rtc.poke(32, 0xdead_beef);

        let mut value = 0u32;
        assert!(pref.load(&mut value));
        assert_eq!(value, 123);
    }

    #[test]
    fn always_initial_without_fallback_fails() {
        let (prefs, _rtc, _flash) = raw_prefs(true);
        let mut pref = prefs.allocate_with_policy::<u32>(5u32, RestoreMode::AlwaysInitial, None);
        assert!(pref.is_initialized());
        assert!(!pref.has_fallback_value());

        let mut value = 17u32;
        assert!(matches!(
            pref.try_load(&mut value),
            Err(PreferenceError::MissingFallback)
        ));
        assert_eq!(value, 17);
    }

    #[test]
    fn restore_mode_selects_tier() {
        let (prefs, _rtc, _flash) = raw_prefs(false);
        assert_eq!(
            prefs
                .allocate_for(1u32, RestoreMode::AlwaysFromDurable, &0u8)
                .tier(),
            Some(Tier::Durable)
        );
        assert_eq!(
            prefs.allocate_for(1u32, RestoreMode::DefaultBackend, &0u8).tier(),
            Some(Tier::Fast)
        );
        assert_eq!(
            prefs.allocate_for(1u32, RestoreMode::AlwaysInitial, &0u8).tier(),
            Some(Tier::Fast)
        );
    }

    #[test]
    fn small_values_are_zero_padded() {
        let (prefs, rtc, _flash) = raw_prefs(false);
        let mut pref = prefs.allocate(2, 6u32, false);
        assert!(pref.save(&[0xffu8; 8]));
        assert!(pref.save(&0xabcdu16));

        let words = rtc.words();
        assert_eq!(words[32], u32::from_ne_bytes([0xcd, 0xab, 0, 0]));
        assert_eq!(words[33], 0);

        let mut wide = [0u8; 8];
        assert!(pref.load(&mut wide));
        assert_eq!(wide, [0xcd, 0xab, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn oversized_value_rejected() {
        let (prefs, _store) = kv_prefs();
        let mut pref = prefs.allocate_typed::<u16>(2u32);
        assert!(matches!(
            pref.try_save(&0u64),
            Err(PreferenceError::ValueTooLarge { size: 8, capacity: 4 })
        ));
    }

    #[test]
    fn write_guard_blocks_raw_writes() {
        let (prefs, rtc, _flash) = raw_prefs(false);
        let mut pref = prefs.allocate_typed::<u32>(8u32);
        assert!(pref.save(&1u32));
        let before = rtc.words();

        prefs.set_write_guard(true);
        assert!(prefs.is_write_guard_set());
        assert!(!pref.save(&2u32));
        assert_eq!(rtc.words(), before);

        let mut value = 0u32;
        assert!(pref.load(&mut value));
        assert_eq!(value, 1);

        prefs.set_write_guard(false);
        assert!(pref.save(&2u32));
        assert!(pref.load(&mut value));
        assert_eq!(value, 2);
    }

    #[test]
    fn write_guard_ignored_by_key_value_store() {
        let (prefs, _store) = kv_prefs();
        let mut pref = prefs.allocate_typed::<u32>(8u32);
        prefs.set_write_guard(true);
        assert!(pref.save(&3u32));
    }

    #[test]
    fn backend_write_failure_reported() {
        let (prefs, store) = kv_prefs();
        let mut pref = prefs.allocate_typed::<u32>(8u32);
        store.set_fail_writes(true);
        assert!(matches!(
            pref.try_save(&3u32),
            Err(PreferenceError::Backend(BackendError::Device(_)))
        ));
        assert!(!pref.save(&3u32));
    }

    #[test]
    fn uninitialized_handle_behaviour() {
        let mut pref = Preference::default();
        assert!(!pref.is_initialized());
        assert!(!pref.save(&1u32));

        let mut value = 77u32;
        assert!(!pref.load(&mut value));
        assert_eq!(value, 0);
    }

    #[test]
    fn allocation_before_begin_is_uninitialized() {
        let prefs = Preferences::key_value(MemoryKvStore::new(), &PreferencesConfig::default());
        assert!(!prefs.is_attached());
        assert!(!prefs.allocate_typed::<u32>(1u32).is_initialized());
    }

    #[test]
    fn begin_failure_is_surfaced() {
        let store = MemoryKvStore::new();
        store.fail_next_opens(2);
        let prefs = Preferences::key_value(store, &PreferencesConfig::default());
        assert!(prefs.begin().is_err());
        assert!(!prefs.is_attached());
    }

    #[test]
    fn exhaustion_returns_uninitialized_handle() {
        let (prefs, _rtc, _flash) = raw_prefs(true);
        // 128 flash words hold two slots of 63 payload words.
        assert!(prefs.allocate(63, 1u32, true).is_initialized());
        assert!(prefs.allocate(63, 2u32, true).is_initialized());
        assert!(!prefs.allocate(1, 3u32, true).is_initialized());

        let stats = prefs.stats().unwrap();
        assert_eq!(stats.durable_used, 128);
        assert_eq!(stats.durable_capacity, Some(128));
        assert_eq!(stats.slots, 2);
    }

    #[test]
    fn fast_tier_spills_into_reserved_words() {
        let (prefs, rtc, _flash) = raw_prefs(false);
        let first = prefs.allocate(92, 1u32, false);
        assert_eq!(first.offset(), Some(0));
        let mut second = prefs.allocate(4, 2u32, false);
        assert_eq!(second.offset(), Some(96));

        assert!(second.save(&[1u32, 2, 3, 4]));
        assert_eq!(&rtc.words()[0..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn key_value_slots_of_both_tiers_keep_separate_keys() {
        let (prefs, store) = kv_prefs();
        let mut durable = prefs.allocate_typed::<u32>(1u32);
        let mut fast = prefs.allocate_for(2u32, RestoreMode::AlwaysInitial, &5u32);
        assert_eq!(durable.tier(), Some(Tier::Durable));
        assert_eq!(fast.tier(), Some(Tier::Fast));
        assert_ne!(durable.offset(), fast.offset());

        assert!(durable.save(&42u32));
        assert!(fast.save(&7u32));
        assert_eq!(store.keys().len(), 2);

        let mut value = 0u32;
        assert!(durable.load(&mut value));
        assert_eq!(value, 42);
    }

    #[test]
    fn failed_flash_save_leaves_previous_value() {
        let (prefs, _rtc, flash) = raw_prefs(true);
        let mut pref = prefs.allocate_typed::<u32>(1u32);
        assert!(pref.save(&1u32));

        flash.set_fail_writes(true);
        assert!(!pref.save(&2u32));

        let mut value = 0u32;
        assert!(pref.load(&mut value));
        assert_eq!(value, 1);
        assert_eq!(flash.words()[0], 1);
    }

    #[test]
    fn poisoned_lock_keeps_state_readable() {
        let (prefs, _store) = kv_prefs();
        prefs.set_write_guard(true);
        let core = Arc::clone(&prefs.core);
        let _ = std::thread::spawn(move || {
            let _held = core.lock().unwrap();
            panic!("poison the core lock");
        })
        .join();

        assert!(prefs.is_attached());
        assert!(prefs.is_write_guard_set());
    }

    #[test]
    fn deferred_flash_flush() {
        let rtc = MemoryRegion::new(16);
        let flash = MemoryRegion::new(16);
        let config = PreferencesConfig {
            flush_on_write: false,
            ..PreferencesConfig::default()
        };
        let prefs = Preferences::raw_memory(rtc, flash.clone(), &config);
        prefs.begin().unwrap();

        let mut pref = prefs.allocate_typed::<u32>(1u32);
        assert!(pref.save(&5u32));
        assert_eq!(flash.write_count(), 0);

        prefs.flush().unwrap();
        assert_eq!(flash.write_count(), 1);
        assert_eq!(flash.words()[0], 5);
    }

    #[test]
    fn data_survives_reattach() {
        let rtc = MemoryRegion::new(128);
        let flash = MemoryRegion::new(128);
        let config = PreferencesConfig::default();
        {
            let prefs = Preferences::raw_memory(rtc.clone(), flash.clone(), &config);
            prefs.begin().unwrap();
            let mut pref = prefs.allocate_typed::<u64>(11u32);
            assert!(pref.save(&0x0123_4567_89ab_cdefu64));
        }

        let prefs = Preferences::raw_memory(rtc, flash, &config);
        prefs.begin().unwrap();
        let mut pref = prefs.allocate_typed::<u64>(11u32);
        let mut value = 0u64;
        assert!(pref.load(&mut value));
        assert_eq!(value, 0x0123_4567_89ab_cdef);
    }

    #[test]
    fn different_tag_at_same_offset_fails_verification() {
        let store = MemoryKvStore::new();
        let config = PreferencesConfig::default();
        {
            let prefs = Preferences::key_value(store.clone(), &config);
            prefs.begin().unwrap();
            assert!(prefs.allocate_typed::<u32>(1u32).save(&10u32));
        }
        let prefs = Preferences::key_value(store, &config);
        prefs.begin().unwrap();
        let mut other = prefs.allocate_typed::<u32>(2u32);
        let mut value = 0u32;
        assert!(matches!(
            other.try_load(&mut value),
            Err(PreferenceError::ChecksumMismatch { .. })
        ));
    }

    proptest! {
        #[test]
        fn allocations_never_overlap(
            requests in proptest::collection::vec((1usize..12, any::<bool>()), 1..40),
        ) {
            let (prefs, _rtc, _flash) = raw_prefs(true);
            let mut ranges: Vec<SlotRange> = Vec::new();
            for (i, (len, durable)) in requests.into_iter().enumerate() {
                let pref = prefs.allocate(len, i as u32, durable);
                let Some(range) = pref.range() else { continue };
                for prev in &ranges {
                    prop_assert!(!range.overlaps(prev));
                    if prev.tier == range.tier {
                        prop_assert!(range.offset > prev.offset);
                    }
                }
                ranges.push(range);
            }
        }

        #[test]
        fn key_value_slots_never_share_storage(
            requests in proptest::collection::vec((1usize..6, any::<bool>()), 1..24),
        ) {
            let (prefs, store) = kv_prefs();
            let mut handles = Vec::new();
            let mut spans: Vec<(usize, usize)> = Vec::new();
            for (i, (len, durable)) in requests.into_iter().enumerate() {
                let mut pref = prefs.allocate(len, i as u32, durable);
                let range = pref.range().unwrap();
                for &(start, end) in &spans {
                    prop_assert!(range.end() <= start || end <= range.offset);
                }
                spans.push((range.offset, range.end()));
                prop_assert!(pref.save(&(i as u32)));
                handles.push(pref);
            }

            prop_assert_eq!(store.keys().len(), handles.len());
            for (i, pref) in handles.iter_mut().enumerate() {
                let mut value = u32::MAX;
                prop_assert!(pref.load(&mut value));
                prop_assert_eq!(value, i as u32);
            }
        }

        #[test]
        fn flipped_payload_bit_detected(bit in 0usize..96, fallback in any::<bool>()) {
            let (prefs, rtc, _flash) = raw_prefs(false);
            let initial = [0x11u32, 0x22, 0x33];
            let mut pref = if fallback {
                prefs.allocate_for(7u32, RestoreMode::DefaultBackend, &initial)
            } else {
                prefs.allocate_typed::<[u32; 3]>(7u32)
            };
            prop_assert!(pref.save(&[1u32, 2, 3]));

            let index = 32 + bit / 32;
            rtc.poke(index, rtc.words()[index] ^ (1 << (bit % 32)));

            let mut out = [0u32; 3];
            prop_assert_eq!(pref.load(&mut out), fallback);
            if fallback {
                prop_assert_eq!(out, initial);
            }
        }
    }
}
