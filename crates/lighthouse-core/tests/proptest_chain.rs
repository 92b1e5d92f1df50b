//! Property-based tests for the integrity chain.
//!
//! Verifies:
//! - tag_k = HMAC(secret, tag_{k-1} ‖ bytes_k) holds across arbitrary chains
//! - tampering with any record invalidates its tag and every later link
//! - chains under different secrets never verify each other

use proptest::prelude::*;

use lighthouse_core::secret::AuthSecret;
use lighthouse_core::store::chain::{GENESIS_TAG, chain_tag, verify_tag};

fn build_chain(secret: &AuthSecret, records: &[Vec<u8>]) -> Vec<[u8; 32]> {
    let mut tags = Vec::with_capacity(records.len());
    let mut prev = GENESIS_TAG;
    for record in records {
        let tag = chain_tag(secret, &prev, record);
        tags.push(tag);
        prev = tag;
    }
    tags
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Every link in a freshly built chain verifies.
    #[test]
    fn prop_chain_verifies(records in prop::collection::vec(
        prop::collection::vec(any::<u8>(), 1..64), 1..20)
    ) {
        let secret = AuthSecret::new(b"chain-secret".to_vec());
        let tags = build_chain(&secret, &records);

        let mut prev = GENESIS_TAG;
        for (record, tag) in records.iter().zip(&tags) {
            prop_assert!(verify_tag(&secret, &prev, record, tag));
            prev = *tag;
        }
    }

    /// Flipping one byte of one record breaks its link.
    #[test]
    fn prop_tamper_breaks_link(
        records in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..20),
        victim in any::<prop::sample::Index>(),
        byte in any::<prop::sample::Index>(),
    ) {
        let secret = AuthSecret::new(b"chain-secret".to_vec());
        let tags = build_chain(&secret, &records);

        let victim_idx = victim.index(records.len());
        let mut tampered = records[victim_idx].clone();
        let byte_idx = byte.index(tampered.len());
        tampered[byte_idx] ^= 0xFF;

        let prev = if victim_idx == 0 {
            GENESIS_TAG
        } else {
            tags[victim_idx - 1]
        };
        prop_assert!(!verify_tag(&secret, &prev, &tampered, &tags[victim_idx]));
    }

    /// Replacing a predecessor tag breaks every later link.
    #[test]
    fn prop_chain_is_positionally_bound(
        records in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 2..20),
    ) {
        let secret = AuthSecret::new(b"chain-secret".to_vec());
        let tags = build_chain(&secret, &records);

        // Pretend record[1] followed genesis instead of record[0].
        prop_assert!(!verify_tag(&secret, &GENESIS_TAG, &records[1], &tags[1]));
    }

    /// A chain built under one secret never verifies under another.
    #[test]
    fn prop_secret_binds_chain(
        records in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..10),
    ) {
        let secret = AuthSecret::new(b"chain-secret".to_vec());
        let other = AuthSecret::new(b"other-secret".to_vec());
        let tags = build_chain(&secret, &records);

        let mut prev = GENESIS_TAG;
        for (record, tag) in records.iter().zip(&tags) {
            prop_assert!(!verify_tag(&other, &prev, record, tag));
            prev = *tag;
        }
    }

    /// Tags are unique across a chain (no fixed points, no repeats).
    #[test]
    fn prop_tags_are_distinct(
        records in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 2..20),
    ) {
        let secret = AuthSecret::new(b"chain-secret".to_vec());
        let tags = build_chain(&secret, &records);
        let mut seen = std::collections::HashSet::new();
        for tag in &tags {
            prop_assert!(seen.insert(*tag), "duplicate tag in chain");
            prop_assert_ne!(*tag, GENESIS_TAG);
        }
    }
}
