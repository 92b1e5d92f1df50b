//! Memory tier: fingerprint → decision map with LRU eviction.
//!
//! Reads take the shared lock and peek without promoting; inserts and
//! promotions take the exclusive lock for a short critical section.

use std::num::NonZeroUsize;
use std::sync::RwLock;

use lru::LruCache;

use crate::event::DelegationVerdict;
use crate::speed::fingerprint::Fingerprint;

/// A cached verdict for one fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedDecision {
    pub verdict: DelegationVerdict,
    pub reason: String,
}

/// LRU decision cache.
#[derive(Debug)]
pub struct MemoryCache {
    inner: RwLock<LruCache<Fingerprint, CachedDecision>>,
}

impl MemoryCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("clamped to >= 1");
        Self {
            inner: RwLock::new(LruCache::new(capacity)),
        }
    }

    /// Fast-path lookup. Does not promote the entry.
    #[must_use]
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CachedDecision> {
        let cache = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cache.peek(fingerprint).cloned()
    }

    /// Insert (or refresh) a decision. Only settled verdicts are cacheable;
    /// timeouts and revision requests must re-run the pipeline.
    pub fn put(&self, fingerprint: Fingerprint, decision: CachedDecision) {
        if !matches!(
            decision.verdict,
            DelegationVerdict::Approve | DelegationVerdict::Deny
        ) {
            return;
        }
        let mut cache = self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cache.put(fingerprint, decision);
    }

    /// Entries currently cached.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;
    use crate::speed::fingerprint::{CommandRequest, fingerprint};

    fn fp(kind: &str) -> Fingerprint {
        fingerprint(&CommandRequest::new(kind), Role::Agent)
    }

    fn deny() -> CachedDecision {
        CachedDecision {
            verdict: DelegationVerdict::Deny,
            reason: "blocked".to_string(),
        }
    }

    #[test]
    fn put_get_roundtrip() {
        let cache = MemoryCache::new(4);
        cache.put(fp("rm -rf /"), deny());
        let hit = cache.get(&fp("rm -rf /")).unwrap();
        assert_eq!(hit.verdict, DelegationVerdict::Deny);
        assert!(cache.get(&fp("ls")).is_none());
    }

    #[test]
    fn lru_evicts_oldest() {
        let cache = MemoryCache::new(2);
        cache.put(fp("a"), deny());
        cache.put(fp("b"), deny());
        cache.put(fp("c"), deny());
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&fp("a")).is_none());
        assert!(cache.get(&fp("c")).is_some());
    }

    #[test]
    fn unsettled_verdicts_are_not_cached() {
        let cache = MemoryCache::new(4);
        cache.put(
            fp("x"),
            CachedDecision {
                verdict: DelegationVerdict::Timeout,
                reason: "slow".to_string(),
            },
        );
        cache.put(
            fp("y"),
            CachedDecision {
                verdict: DelegationVerdict::NeedsRevision,
                reason: "rework".to_string(),
            },
        );
        assert!(cache.is_empty());
    }
}
