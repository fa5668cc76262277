//! Preference persistence: fixed-size typed values in key-value or raw
//! RTC/flash storage, recovered after reset with checksum verification.
//!
//! # Invariants
//! - Slots never overlap; offsets only grow.
//! - Every stored slot is its payload words followed by one checksum word.
//! - A slot's mirror buffer is exactly its length; short values are zero-padded.
//! - `save`/`load` never panic; failures surface as `false` or a typed error.

pub mod backend;
pub mod codec;
pub mod error;
pub mod global;
pub mod manager;
pub mod preference;

pub use backend::{
    Backend, KeyValueStore, KvBackend, MemoryKvStore, MemoryRegion, RawBackend, RawMemory,
};
pub use error::{BackendError, PreferenceError};
pub use manager::{AllocationStats, Preferences};
pub use preference::Preference;

pub use nvpref_common::{PreferencesConfig, RestoreMode, Tier, TypeTag};
