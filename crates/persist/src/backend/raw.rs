//! Raw memory backend: RTC user memory as the fast tier, one flash sector as
//! the durable tier.
//!
//! # Fast tier layout
//! The first `reserved_words` physical words belong to the bootloader while a
//! firmware update is in progress. Logical offsets are laid out so that the
//! unreserved area is used first:
//!
//! ```text
//! logical 0 .. len-reserved     -> physical reserved .. len
//! logical len-reserved .. len   -> physical 0 .. reserved
//! ```
//!
//! A slot never straddles the boundary; it is moved to the start of the
//! reserved area instead.
//!
//! # Durable tier
//! The flash sector is mirrored in RAM at `open`. Writes update the mirror
//! and mark it dirty only when a word changes. A flush erases and rewrites
//! the sector only when dirty.

use super::{Backend, check_bounds};
use crate::error::BackendError;
use nvpref_common::{SlotRange, Tier};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// External word-addressed memory (RTC memory or a flash sector driver).
pub trait RawMemory: Send {
    fn len_words(&self) -> usize;

    fn read_words(&self, offset: usize, out: &mut [u32]) -> Result<(), BackendError>;

    /// Write words at `offset`. For flash this implies erasing the sector.
    fn write_words(&mut self, offset: usize, words: &[u32]) -> Result<(), BackendError>;

    fn flush(&mut self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// [`Backend`] over an RTC memory region and a flash sector.
pub struct RawBackend<R, F> {
    rtc: R,
    flash: F,
    reserved_words: usize,
    flash_mirror: Vec<u32>,
    dirty: bool,
    flush_on_write: bool,
}

impl<R: RawMemory, F: RawMemory> RawBackend<R, F> {
    pub fn new(rtc: R, flash: F, reserved_words: usize) -> Self {
        let reserved_words = reserved_words.min(rtc.len_words());
        Self {
            rtc,
            flash,
            reserved_words,
            flash_mirror: Vec::new(),
            dirty: false,
            flush_on_write: true,
        }
    }

    /// Whether durable writes reach flash immediately or wait for `flush`.
    pub fn with_flush_on_write(mut self, flush_on_write: bool) -> Self {
        self.flush_on_write = flush_on_write;
        self
    }

    /// Whether the flash mirror has changes not yet written to flash.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn unreserved_words(&self) -> usize {
        self.rtc.len_words() - self.reserved_words
    }

    fn rtc_physical(&self, logical: usize) -> usize {
        let unreserved = self.unreserved_words();
        if logical < unreserved {
            logical + self.reserved_words
        } else {
            logical - unreserved
        }
    }

    fn flush_flash(&mut self) -> Result<(), BackendError> {
        if !self.dirty {
            return Ok(());
        }
        tracing::trace!(words = self.flash_mirror.len(), "writing flash sector");
        self.flash.write_words(0, &self.flash_mirror)?;
        self.flash.flush()?;
        self.dirty = false;
        Ok(())
    }
}

impl<R: RawMemory, F: RawMemory> Backend for RawBackend<R, F> {
    fn open(&mut self) -> Result<(), BackendError> {
        let mut mirror = vec![0u32; self.flash.len_words()];
        self.flash.read_words(0, &mut mirror)?;
        self.flash_mirror = mirror;
        self.dirty = false;
        tracing::debug!(
            rtc_words = self.rtc.len_words(),
            flash_words = self.flash_mirror.len(),
            "raw memory attached"
        );
        Ok(())
    }

    fn read(&self, range: &SlotRange, out: &mut [u32]) -> Result<(), BackendError> {
        match range.tier {
            Tier::Fast => {
                check_bounds(range, self.rtc.len_words())?;
                self.rtc.read_words(self.rtc_physical(range.offset), out)
            }
            Tier::Durable => {
                check_bounds(range, self.flash_mirror.len())?;
                out.copy_from_slice(&self.flash_mirror[range.offset..range.end()]);
                Ok(())
            }
        }
    }

    fn write(&mut self, range: &SlotRange, words: &[u32]) -> Result<(), BackendError> {
        match range.tier {
            Tier::Fast => {
                check_bounds(range, self.rtc.len_words())?;
                let physical = self.rtc_physical(range.offset);
                self.rtc.write_words(physical, words)
            }
            Tier::Durable => {
                check_bounds(range, self.flash_mirror.len())?;
                let target = &mut self.flash_mirror[range.offset..range.end()];
                if *target == *words {
                    return if self.flush_on_write {
                        self.flush_flash()
                    } else {
                        Ok(())
                    };
                }
                let previous = target.to_vec();
                let was_dirty = self.dirty;
                target.copy_from_slice(words);
                self.dirty = true;
                if self.flush_on_write {
                    if let Err(err) = self.flush_flash() {
                        // A failed write must not be visible to later reads.
                        self.flash_mirror[range.offset..range.end()].copy_from_slice(&previous);
                        self.dirty = was_dirty;
                        return Err(err);
                    }
                }
                Ok(())
            }
        }
    }

    fn flush(&mut self) -> Result<(), BackendError> {
        self.rtc.flush()?;
        self.flush_flash()
    }

    fn capacity_words(&self, tier: Tier) -> Option<usize> {
        match tier {
            Tier::Fast => Some(self.rtc.len_words()),
            Tier::Durable => Some(self.flash.len_words()),
        }
    }

    fn place(&self, tier: Tier, cursor: usize, stored_words: usize) -> Option<usize> {
        let capacity = self.capacity_words(tier)?;
        let mut start = cursor;
        if tier == Tier::Fast {
            let unreserved = self.unreserved_words();
            if start < unreserved && start + stored_words > unreserved {
                start = unreserved;
            }
        }
        let end = start.checked_add(stored_words)?;
        (end <= capacity).then_some(start)
    }

    fn honors_write_guard(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "raw-memory"
    }
}

#[derive(Debug, Default)]
struct RegionState {
    words: Vec<u32>,
    fail_writes: bool,
    writes: usize,
    flushes: usize,
}

/// In-memory [`RawMemory`] for tests and host simulation.
///
/// Clones share state, so a test can keep a clone to inspect or corrupt the
/// region after handing it to a backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegion {
    state: Arc<Mutex<RegionState>>,
}

impl MemoryRegion {
    pub fn new(len_words: usize) -> Self {
        Self::from_words(vec![0; len_words])
    }

    pub fn from_words(words: Vec<u32>) -> Self {
        Self {
            state: Arc::new(Mutex::new(RegionState {
                words,
                ..RegionState::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn words(&self) -> Vec<u32> {
        self.state().words.clone()
    }

    /// Overwrite one word without going through a backend.
    pub fn poke(&self, index: usize, value: u32) {
        if let Some(word) = self.state().words.get_mut(index) {
            *word = value;
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    pub fn write_count(&self) -> usize {
        self.state().writes
    }

    pub fn flush_count(&self) -> usize {
        self.state().flushes
    }
}

impl RawMemory for MemoryRegion {
    fn len_words(&self) -> usize {
        self.state().words.len()
    }

    fn read_words(&self, offset: usize, out: &mut [u32]) -> Result<(), BackendError> {
        let state = self.state();
        let end = offset + out.len();
        let source = state
            .words
            .get(offset..end)
            .ok_or(BackendError::OutOfRange {
                offset,
                end,
                capacity: state.words.len(),
            })?;
        out.copy_from_slice(source);
        Ok(())
    }

    fn write_words(&mut self, offset: usize, words: &[u32]) -> Result<(), BackendError> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(BackendError::Device(format!("write at word {offset} failed")));
        }
        let end = offset + words.len();
        let capacity = state.words.len();
        let target = state
            .words
            .get_mut(offset..end)
            .ok_or(BackendError::OutOfRange {
                offset,
                end,
                capacity,
            })?;
        target.copy_from_slice(words);
        state.writes += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), BackendError> {
        self.state().flushes += 1;
        Ok(())
    }
}
