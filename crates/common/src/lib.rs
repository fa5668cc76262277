//! Shared types for the nvpref preference store: tags, restore policies,
//! tiers, slot ranges and configuration.

pub mod config;
pub mod types;

pub use config::{BackendKind, ConfigError, PreferencesConfig};
pub use types::{RestoreMode, SlotRange, Tier, TypeTag, WORD_BYTES, words_for_bytes};
