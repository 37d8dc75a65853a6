//! Construction of content-addressed block identifiers.
//!
//! A block id is the deduplication key stored in the coordinator:
//! `"{partition_id}_{hash_hi}_{hash_lo}"`, where the two halves are the
//! decimal-encoded words of a 128-bit keyed SipHash over either the block's
//! cell bytes or the caller-supplied deduplication token.

use siphasher::sip128::{Hash128, Hasher128, SipHasher24};
use std::hash::Hasher;

/// Keys of the block-id hash. Fixed so that every replica derives identical
/// ids for identical content.
const BLOCK_HASH_KEY0: u64 = 0;
const BLOCK_HASH_KEY1: u64 = 0;

/// The hasher all block ids are derived with.
pub fn block_hasher() -> SipHasher24 {
    SipHasher24::new_with_keys(BLOCK_HASH_KEY0, BLOCK_HASH_KEY1)
}

/// Render the wire form of a block id from a finished hash.
pub fn format_block_id(partition_id: &str, hash: Hash128) -> String {
    format!("{}_{}_{}", partition_id, hash.h1, hash.h2)
}

/// Block id for hashed block content: finish `hasher` and render the id.
pub fn content_block_id(partition_id: &str, hasher: SipHasher24) -> String {
    format_block_id(partition_id, hasher.finish128())
}

/// Block id derived from a caller-supplied deduplication token instead of the
/// block content.
pub fn token_block_id(partition_id: &str, token: &str) -> String {
    let mut hasher = block_hasher();
    hasher.write(token.as_bytes());
    format_block_id(partition_id, hasher.finish128())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_is_deterministic() {
        let mut a = block_hasher();
        let mut b = block_hasher();
        a.write(b"some rows");
        b.write(b"some rows");

        assert_eq!(content_block_id("all", a), content_block_id("all", b));
    }

    #[test]
    fn test_block_id_shape() {
        let id = token_block_id("202401", "tok");
        let tokens: Vec<_> = id.split('_').collect();
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0], "202401");
        tokens[1].parse::<u64>().unwrap();
        tokens[2].parse::<u64>().unwrap();
    }

    #[test]
    fn test_token_id_hashes_token_bytes() {
        let mut content = block_hasher();
        content.write(b"tok");
        assert_eq!(token_block_id("p", "tok"), content_block_id("p", content));
    }
}
