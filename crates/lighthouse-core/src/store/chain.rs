//! The integrity chain.
//!
//! Every record's tag MACs the previous tag concatenated with the record's
//! canonical bytes: `tag_i = HMAC(secret, tag_{i-1} ‖ canonical(event_i))`.
//! The chain starts from an all-zero genesis tag, so tampering with any
//! record invalidates every tag after it.

use crate::encoding::TAG_LEN;
use crate::secret::AuthSecret;

/// Tag preceding the first record.
pub const GENESIS_TAG: [u8; TAG_LEN] = [0u8; TAG_LEN];

/// Compute the tag for a record given its predecessor's tag.
#[must_use]
pub fn chain_tag(secret: &AuthSecret, prev_tag: &[u8; TAG_LEN], canonical: &[u8]) -> [u8; TAG_LEN] {
    secret.mac(&[prev_tag, canonical])
}

/// Verify a stored tag against its predecessor and canonical bytes.
#[must_use]
pub fn verify_tag(
    secret: &AuthSecret,
    prev_tag: &[u8; TAG_LEN],
    canonical: &[u8],
    stored: &[u8],
) -> bool {
    secret.verify(&[prev_tag, canonical], stored)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_depends_on_predecessor() {
        let secret = AuthSecret::new(b"k".to_vec());
        let t1 = chain_tag(&secret, &GENESIS_TAG, b"one");
        let t2 = chain_tag(&secret, &t1, b"two");
        let t2_detached = chain_tag(&secret, &GENESIS_TAG, b"two");
        assert_ne!(t2, t2_detached);
    }

    #[test]
    fn verify_matches_chain() {
        let secret = AuthSecret::new(b"k".to_vec());
        let t1 = chain_tag(&secret, &GENESIS_TAG, b"one");
        assert!(verify_tag(&secret, &GENESIS_TAG, b"one", &t1));
        assert!(!verify_tag(&secret, &GENESIS_TAG, b"two", &t1));
        assert!(!verify_tag(&secret, &t1, b"one", &t1));
    }

    #[test]
    fn genesis_is_zero() {
        assert_eq!(GENESIS_TAG, [0u8; TAG_LEN]);
        let secret = AuthSecret::new(b"k".to_vec());
        let t1 = chain_tag(&secret, &GENESIS_TAG, b"one");
        assert_ne!(t1, GENESIS_TAG, "first tag is never zero");
    }
}
