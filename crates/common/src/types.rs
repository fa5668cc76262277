use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of one storage word in bytes. All slots are word-aligned.
pub const WORD_BYTES: usize = 4;

/// Number of words needed to hold `bytes` bytes.
pub fn words_for_bytes(bytes: usize) -> usize {
    bytes.div_ceil(WORD_BYTES)
}

/// Opaque tag distinguishing the logical kind of a stored value.
///
/// The tag salts the slot checksum, so two slots with identical content but
/// different tags never verify against each other.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TypeTag(pub u32);

impl From<u32> for TypeTag {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Rule governing whether `load` consults stored data and how it recovers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    /// Never read stored data; always start from the initial value.
    AlwaysInitial,
    /// Use the platform's default tier.
    #[default]
    DefaultBackend,
    /// Always keep a copy in the durable tier and restore from it.
    AlwaysFromDurable,
}

impl RestoreMode {
    /// Whether a slot with this policy should be mirrored into the durable tier.
    pub fn wants_durable(self, platform_default: bool) -> bool {
        match self {
            RestoreMode::AlwaysInitial => false,
            RestoreMode::DefaultBackend => platform_default,
            RestoreMode::AlwaysFromDurable => true,
        }
    }

    /// Whether `load` reads the backend at all.
    pub fn reads_backend(self) -> bool {
        !matches!(self, RestoreMode::AlwaysInitial)
    }
}

impl fmt::Display for RestoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RestoreMode::AlwaysInitial => "Always restore initial value",
            RestoreMode::DefaultBackend => "Restore using default state storage",
            RestoreMode::AlwaysFromDurable => "Always restore from durable storage",
        };
        f.write_str(text)
    }
}

/// Storage tier of a two-tier backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Fast, possibly volatile memory (e.g. RTC user memory).
    Fast,
    /// Slower persistent memory (e.g. a flash sector).
    Durable,
}

impl Tier {
    pub fn from_durable(durable: bool) -> Self {
        if durable { Tier::Durable } else { Tier::Fast }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Fast => f.write_str("fast"),
            Tier::Durable => f.write_str("durable"),
        }
    }
}

/// Location of one allocated slot in a backend tier.
///
/// A slot occupies `length_words` payload words followed by one checksum word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotRange {
    pub tier: Tier,
    pub offset: usize,
    pub length_words: usize,
}

impl SlotRange {
    pub fn new(tier: Tier, offset: usize, length_words: usize) -> Self {
        Self {
            tier,
            offset,
            length_words,
        }
    }

    /// Words occupied including the trailing checksum.
    pub fn stored_words(&self) -> usize {
        self.length_words + 1
    }

    /// One past the last occupied word.
    pub fn end(&self) -> usize {
        self.offset + self.stored_words()
    }

    /// Whether two slots share any word in the same tier.
    pub fn overlaps(&self, other: &SlotRange) -> bool {
        self.tier == other.tier && self.offset < other.end() && other.offset < self.end()
    }
}
