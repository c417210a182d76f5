// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Hashing primitives used for segment selection, slot fingerprints and
//! entry checksums. All three reductions are deliberately distinct: a key
//! that collides on segment selection must not also collide on fingerprint,
//! or collision resolution would degrade to always reading key bytes.

/// Full-width hash of a key, used to derive both the segment selector and
/// the intra-segment slot hint.
pub fn hash64(bytes: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(bytes)
}

/// Short hash reduction stored in a slot to reject non-matching keys
/// without touching the entry's key bytes.
///
/// Salted against `hash64` so that two keys landing on the same slot index
/// rarely also share a fingerprint.
pub fn fingerprint(bytes: &[u8]) -> u32 {
    xxhash_rust::xxh3::xxh3_64_with_seed(bytes, 0x9E37_79B9_7F4A_7C15) as u32
}

/// 32-bit avalanche-quality checksum over `key_bytes || value_bytes`, stored
/// at the tail of an entry when `checksum_entries` is enabled.
pub fn checksum32(key: &[u8], value: &[u8]) -> u32 {
    let mut hasher = xxhash_rust::xxh32::Xxh32::new(0);
    hasher.update(key);
    hasher.update(value);
    hasher.digest()
}

/// Selects a key's segment from the high bits of its hash, per §4.3:
/// `segment = hash(key) >> segment_shift`. `segments` must be a power of
/// two, as enforced by [`crate::config::Config::sanity_check`].
#[must_use]
pub fn segment_index(key_hash: u64, segments: u32) -> u32 {
    debug_assert!(segments.is_power_of_two());
    let segment_bits = segments.trailing_zeros();
    if segment_bits == 0 {
        return 0;
    }
    (key_hash >> (64 - segment_bits)) as u32
}

/// Derives the intra-segment slot array probe start from the low bits of a
/// key's hash. `capacity` must be a power of two.
#[must_use]
pub fn slot_hint(key_hash: u64, capacity: u32) -> u32 {
    debug_assert!(capacity.is_power_of_two());
    (key_hash as u32) & (capacity - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_index_uses_high_bits() {
        assert_eq!(segment_index(0, 16), 0);
        assert_eq!(segment_index(u64::MAX, 16), 15);
        assert_eq!(segment_index(1, 1), 0);
    }

    #[test]
    fn slot_hint_uses_low_bits() {
        assert_eq!(slot_hint(0b1010_1010, 8), 0b010);
        assert_eq!(slot_hint(u64::MAX, 256), 255);
    }
}
