/// Errors reported by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("words {offset}..{end} outside tier of {capacity} words")]
    OutOfRange {
        offset: usize,
        end: usize,
        capacity: usize,
    },
    #[error("device error: {0}")]
    Device(String),
    #[error("open failed: {0}")]
    OpenFailed(String),
}

/// Errors from preference allocation, save and load.
///
/// The boolean `save`/`load` surface collapses these to `false`; the
/// `try_*` variants return them as-is.
#[derive(Debug, thiserror::Error)]
pub enum PreferenceError {
    #[error("preference handle is not initialized")]
    Uninitialized,
    #[error("preference manager is not attached to a backend")]
    NotAttached,
    #[error("preference manager is already attached")]
    AlreadyAttached,
    #[error("value of {size} bytes does not fit slot of {capacity} bytes")]
    ValueTooLarge { size: usize, capacity: usize },
    #[error("write suppressed by active write guard")]
    WriteGuarded,
    #[error("checksum mismatch: expected {expected:#010x}, stored {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("restore mode requires an initial value but none was given")]
    MissingFallback,
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("preference manager lock poisoned")]
    LockPoisoned,
    #[error("global preference manager already installed")]
    AlreadyInstalled,
}
