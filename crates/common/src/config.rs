use serde::{Deserialize, Serialize};

/// Which backend variant the preference manager drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Key-value store with native durability (NVS-style).
    #[default]
    KeyValue,
    /// Raw RTC memory plus a flash sector.
    RawMemory,
}

/// Errors from validating a [`PreferencesConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reserved words ({reserved}) exceed fast tier size ({total})")]
    ReservedTooLarge { reserved: usize, total: usize },
    #[error("key-value namespace must not be empty")]
    EmptyNamespace,
    #[error("tier size must be non-zero")]
    ZeroCapacity,
}

/// Preference store configuration.
///
/// The defaults match a typical microcontroller: 128 words of RTC user memory
/// whose first 32 words belong to the bootloader during updates, and a
/// 128-word flash sector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferencesConfig {
    pub backend: BackendKind,
    /// Namespace opened on the key-value store.
    pub namespace: String,
    /// Size of the fast tier in words.
    pub rtc_words: usize,
    /// Leading fast-tier words reserved by the bootloader during updates.
    pub rtc_reserved_words: usize,
    /// Size of the durable tier in words.
    pub flash_words: usize,
    /// Tier chosen for `RestoreMode::DefaultBackend`.
    pub default_durable: bool,
    /// Flush the durable tier after every durable write.
    pub flush_on_write: bool,
}

impl Default for PreferencesConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::KeyValue,
            namespace: "nvpref".into(),
            rtc_words: 128,
            rtc_reserved_words: 32,
            flash_words: 128,
            default_durable: true,
            flush_on_write: true,
        }
    }
}

impl PreferencesConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.backend {
            BackendKind::KeyValue => {
                if self.namespace.is_empty() {
                    return Err(ConfigError::EmptyNamespace);
                }
            }
            BackendKind::RawMemory => {
                if self.rtc_words == 0 || self.flash_words == 0 {
                    return Err(ConfigError::ZeroCapacity);
                }
                if self.rtc_reserved_words > self.rtc_words {
                    return Err(ConfigError::ReservedTooLarge {
                        reserved: self.rtc_reserved_words,
                        total: self.rtc_words,
                    });
                }
            }
        }
        Ok(())
    }
}
