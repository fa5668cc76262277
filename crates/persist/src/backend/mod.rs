//! Storage backends.
//!
//! The manager talks to a single [`Backend`] capability. Two variants exist:
//! a key-value store with native durability ([`kv::KvBackend`]) and raw
//! RTC memory plus a flash sector ([`raw::RawBackend`]). Their layouts are
//! independent; only the slot contract (payload words followed by one
//! checksum word) is shared.

pub mod kv;
pub mod raw;

use crate::error::BackendError;
use nvpref_common::{SlotRange, Tier};

pub use kv::{KeyValueStore, KvBackend, MemoryKvStore};
pub use raw::{MemoryRegion, RawBackend, RawMemory};

/// Raw persistence capability used by the preference manager.
///
/// `read` and `write` move `range.stored_words()` words: the payload followed
/// by the checksum. No checksum logic lives here.
pub trait Backend: Send {
    /// Attach to the underlying device or store. Called once by `begin`.
    fn open(&mut self) -> Result<(), BackendError>;

    fn read(&self, range: &SlotRange, out: &mut [u32]) -> Result<(), BackendError>;

    fn write(&mut self, range: &SlotRange, words: &[u32]) -> Result<(), BackendError>;

    /// Push buffered writes to the durable tier.
    fn flush(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Size of a tier in words, or `None` if unbounded.
    fn capacity_words(&self, tier: Tier) -> Option<usize>;

    /// Pick the start offset for a new slot of `stored_words` words at `cursor`.
    ///
    /// Returns `None` if the slot does not fit. The default places the slot at
    /// the cursor.
    fn place(&self, tier: Tier, cursor: usize, stored_words: usize) -> Option<usize> {
        let end = cursor.checked_add(stored_words)?;
        match self.capacity_words(tier) {
            Some(capacity) if end > capacity => None,
            _ => Some(cursor),
        }
    }

    /// Whether both tiers live in one address space.
    ///
    /// Slots of such a backend are allocated from a single cursor, so a fast
    /// and a durable slot never share an offset.
    fn shared_address_space(&self) -> bool {
        false
    }

    /// Whether writes must be suppressed while the manager's write guard is set.
    fn honors_write_guard(&self) -> bool {
        false
    }

    /// Backend name for logging.
    fn name(&self) -> &str;
}

/// Check that `range` fits inside a tier of `capacity` words.
pub(crate) fn check_bounds(range: &SlotRange, capacity: usize) -> Result<(), BackendError> {
    if range.end() > capacity {
        return Err(BackendError::OutOfRange {
            offset: range.offset,
            end: range.end(),
            capacity,
        });
    }
    Ok(())
}
