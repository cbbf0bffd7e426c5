//! Content hashing for cache keys and backing-store comparisons.
//!
//! All caches use the same 64-bit hash as a fast pre-filter; full key
//! equality is always checked afterwards, so a collision is a performance
//! event, not a correctness one.

use xxhash_rust::xxh3::xxh3_64;

/// Hash a byte slice. Used for texture data, palette data, and inline
/// index-list contents.
pub fn content_hash(data: &[u8]) -> u64 {
    xxh3_64(data)
}

/// Hash a `u32` word slice without copying.
pub fn word_hash(words: &[u32]) -> u64 {
    xxh3_64(bytemuck::cast_slice(words))
}
