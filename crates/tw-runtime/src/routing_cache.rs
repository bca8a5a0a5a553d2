//! Memoisation of orchestration decisions by normalised prompt.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use sha2::{Digest, Sha256};
use tracing::debug;

use tw_core::Decision;

struct CachedDecision {
    decision: Decision,
    inserted: Instant,
}

/// Bounded LRU with TTL, keyed by a sha256 of the normalised prompt. A hit
/// replays the prior decision verbatim without consulting the oracle.
pub struct RoutingCache {
    cache: Mutex<LruCache<String, CachedDecision>>,
    ttl: Duration,
}

impl RoutingCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero");
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Lowercase and collapse whitespace so cosmetic differences share a key.
    fn normalize(prompt: &str) -> String {
        prompt
            .split_whitespace()
            .map(|word| word.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn key(prompt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(Self::normalize(prompt).as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, prompt: &str) -> Option<Decision> {
        let key = Self::key(prompt);
        let mut cache = self.cache.lock().expect("routing cache lock poisoned");
        match cache.get(&key) {
            Some(entry) if entry.inserted.elapsed() < self.ttl => {
                debug!(key = %&key[..12], "routing cache hit");
                Some(entry.decision.clone())
            }
            Some(_) => {
                cache.pop(&key);
                None
            }
            None => None,
        }
    }

    /// Populate after a decision has passed validation.
    pub fn put(&self, prompt: &str, decision: Decision) {
        let key = Self::key(prompt);
        let mut cache = self.cache.lock().expect("routing cache lock poisoned");
        cache.put(
            key,
            CachedDecision {
                decision,
                inserted: Instant::now(),
            },
        );
    }

    pub fn clear(&self) {
        self.cache
            .lock()
            .expect("routing cache lock poisoned")
            .clear();
    }

    pub fn len(&self) -> usize {
        self.cache.lock().expect("routing cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RoutingCache {
    fn default() -> Self {
        Self::new(128, Duration::from_secs(10 * 60))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn decision() -> Decision {
        Decision::Delegate {
            target_agent: "explore".into(),
            task: "find the files".into(),
        }
    }

    #[test]
    fn hit_replays_decision() {
        let cache = RoutingCache::default();
        cache.put("Find all TypeScript files", decision());
        assert_eq!(cache.get("Find all TypeScript files"), Some(decision()));
    }

    #[test]
    fn normalisation_ignores_case_and_whitespace() {
        let cache = RoutingCache::default();
        cache.put("Find   all TypeScript\nfiles", decision());
        assert!(cache.get("find all typescript files").is_some());
        assert!(cache.get("find all javascript files").is_none());
    }

    #[test]
    fn ttl_expires_entries() {
        let cache = RoutingCache::new(16, Duration::from_millis(10));
        cache.put("prompt", decision());
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get("prompt").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn capacity_evicts_least_recent() {
        let cache = RoutingCache::new(2, Duration::from_secs(60));
        cache.put("one", decision());
        cache.put("two", decision());
        cache.get("one"); // refresh
        cache.put("three", decision());

        assert!(cache.get("one").is_some());
        assert!(cache.get("two").is_none());
        assert!(cache.get("three").is_some());
    }

    #[test]
    fn clear_empties_cache() {
        let cache = RoutingCache::default();
        cache.put("a", decision());
        cache.put("b", decision());
        cache.clear();
        assert!(cache.is_empty());
    }
}
