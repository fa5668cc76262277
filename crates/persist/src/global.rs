//! Process-wide preference manager.
//!
//! Installed once at startup and valid until the process exits. Components
//! receive the manager explicitly; this module only holds the instance.

use crate::error::PreferenceError;
use crate::manager::Preferences;
use std::sync::OnceLock;

static GLOBAL_PREFERENCES: OnceLock<Preferences> = OnceLock::new();

/// Install `prefs` as the process-wide manager.
pub fn install(prefs: Preferences) -> Result<&'static Preferences, PreferenceError> {
    let mut installed = false;
    let global = GLOBAL_PREFERENCES.get_or_init(|| {
        installed = true;
        prefs
    });
    if installed {
        tracing::debug!("global preferences installed");
        Ok(global)
    } else {
        Err(PreferenceError::AlreadyInstalled)
    }
}

/// The installed manager, if any.
pub fn get() -> Option<&'static Preferences> {
    GLOBAL_PREFERENCES.get()
}
