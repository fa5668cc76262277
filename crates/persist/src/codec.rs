//! Slot checksum.
//!
//! CRC-32C over an 8-byte salt (type tag, payload length in words) followed
//! by the payload words in little-endian order. The salt makes a slot read
//! back under a different tag or length fail verification.

use nvpref_common::TypeTag;

/// Compute the checksum of a slot payload.
pub fn checksum(words: &[u32], type_tag: TypeTag) -> u32 {
    let mut salt = [0u8; 8];
    salt[..4].copy_from_slice(&type_tag.0.to_le_bytes());
    salt[4..].copy_from_slice(&(words.len() as u32).to_le_bytes());

    words.iter().fold(crc32c::crc32c(&salt), |crc, word| {
        crc32c::crc32c_append(crc, &word.to_le_bytes())
    })
}

/// Check a payload against a stored checksum.
pub fn verify(words: &[u32], type_tag: TypeTag, stored: u32) -> bool {
    checksum(words, type_tag) == stored
}
