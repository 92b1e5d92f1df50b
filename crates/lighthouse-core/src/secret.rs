//! Process-wide HMAC secret.
//!
//! Exactly one [`AuthSecret`] exists per process; the same `Arc` feeds the
//! integrity chain, session tokens, and expert challenge proofs. Key material
//! never appears in logs or error messages.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Shared HMAC-SHA-256 secret provider.
pub struct AuthSecret {
    key: Vec<u8>,
}

impl std::fmt::Debug for AuthSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSecret").finish_non_exhaustive()
    }
}

impl AuthSecret {
    #[must_use]
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    /// MAC the concatenation of `parts`.
    #[must_use]
    pub fn mac(&self, parts: &[&[u8]]) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        for part in parts {
            mac.update(part);
        }
        mac.finalize().into_bytes().into()
    }

    /// Constant-time verification of a MAC over `parts`.
    #[must_use]
    pub fn verify(&self, parts: &[&[u8]], expected: &[u8]) -> bool {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        for part in parts {
            mac.update(part);
        }
        mac.verify_slice(expected).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_is_deterministic() {
        let secret = AuthSecret::new(b"k".to_vec());
        assert_eq!(secret.mac(&[b"a", b"b"]), secret.mac(&[b"a", b"b"]));
    }

    #[test]
    fn mac_depends_on_key_and_input() {
        let a = AuthSecret::new(b"k1".to_vec());
        let b = AuthSecret::new(b"k2".to_vec());
        assert_ne!(a.mac(&[b"x"]), b.mac(&[b"x"]));
        assert_ne!(a.mac(&[b"x"]), a.mac(&[b"y"]));
    }

    #[test]
    fn verify_accepts_only_matching_tag() {
        let secret = AuthSecret::new(b"k".to_vec());
        let tag = secret.mac(&[b"data"]);
        assert!(secret.verify(&[b"data"], &tag));
        assert!(!secret.verify(&[b"other"], &tag));
        assert!(!secret.verify(&[b"data"], &tag[..31]));
    }

    #[test]
    fn debug_does_not_leak_key() {
        let secret = AuthSecret::new(b"super-secret".to_vec());
        let rendered = format!("{secret:?}");
        assert!(!rendered.contains("super-secret"));
    }
}
