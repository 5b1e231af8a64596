//! Sliding-window fingerprint cache with LRU eviction: a per-source sliding
//! window capped by an LRU so high-cardinality sources cannot exhaust
//! memory.
//!
//! The cache is sharded to keep lock contention low under concurrent
//! adapters; each shard is an independently-locked [`lru::LruCache`] keyed
//! by fingerprint, holding the last-seen instant. A background sweep
//! (driven by the deduper, not by this type) periodically drops entries
//! whose window has already elapsed, bounding memory under bursty traffic
//! even before the LRU cap would kick in.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

use super::fingerprint::Fingerprint;

const SHARD_COUNT: usize = 16;

pub struct WindowCache {
    shards: Vec<Mutex<LruCache<Fingerprint, Instant>>>,
    window: Duration,
}

impl WindowCache {
    /// `capacity` is the total entry cap across all shards; `window` is the sliding dedup window.
    pub fn new(capacity: usize, window: Duration) -> Self {
        let per_shard = NonZeroUsize::new((capacity / SHARD_COUNT).max(1)).unwrap();
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(LruCache::new(per_shard)))
            .collect();
        WindowCache { shards, window }
    }

    fn shard_for(&self, fp: &Fingerprint) -> &Mutex<LruCache<Fingerprint, Instant>> {
        let idx = fp[0] as usize % self.shards.len();
        &self.shards[idx]
    }

    /// Returns `true` if `fp` has not been seen within the current window
    /// (a fresh event that should be emitted), recording `now` as its new
    /// last-seen instant either way.
    pub fn observe(&self, fp: Fingerprint, now: Instant) -> bool {
        let mut shard = self.shard_for(&fp).lock().expect("dedup shard mutex poisoned");
        match shard.get(&fp) {
            Some(last_seen) if now.duration_since(*last_seen) < self.window => {
                shard.put(fp, now);
                false
            }
            _ => {
                shard.put(fp, now);
                true
            }
        }
    }

    /// Drops entries whose window has already elapsed as of `now`. Called
    /// periodically by the deduper's background task; purely a memory
    /// optimization, `observe` is correct without it.
    pub fn sweep_expired(&self, now: Instant) {
        for shard in &self.shards {
            let mut guard = shard.lock().expect("dedup shard mutex poisoned");
            let expired: Vec<Fingerprint> = guard
                .iter()
                .filter(|(_, last_seen)| now.duration_since(**last_seen) >= self.window)
                .map(|(fp, _)| *fp)
                .collect();
            for fp in expired {
                guard.pop(&fp);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().expect("dedup shard mutex poisoned").len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(byte: u8) -> Fingerprint {
        let mut f = [0u8; 32];
        f[0] = byte;
        f
    }

    #[test]
    fn first_observation_is_fresh_repeat_within_window_is_not() {
        let cache = WindowCache::new(1000, Duration::from_secs(60));
        let now = Instant::now();
        assert!(cache.observe(fp(1), now));
        assert!(!cache.observe(fp(1), now + Duration::from_secs(10)));
    }

    #[test]
    fn repeat_after_window_elapses_is_fresh_again() {
        let cache = WindowCache::new(1000, Duration::from_secs(60));
        let now = Instant::now();
        assert!(cache.observe(fp(2), now));
        assert!(cache.observe(fp(2), now + Duration::from_secs(61)));
    }

    #[test]
    fn sweep_expired_removes_stale_entries_without_affecting_count() {
        let cache = WindowCache::new(1000, Duration::from_secs(60));
        let now = Instant::now();
        cache.observe(fp(3), now);
        assert_eq!(cache.len(), 1);
        cache.sweep_expired(now + Duration::from_secs(61));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn lru_cap_evicts_oldest_shard_entry_under_pressure() {
        // Tiny capacity forces each shard down to 1 entry.
        let cache = WindowCache::new(SHARD_COUNT, Duration::from_secs(60));
        let now = Instant::now();
        // Two fingerprints landing in the same shard (same low byte modulo
        // shard count) should evict one another rather than grow unbounded.
        let a = fp(0);
        let mut b = [0u8; 32];
        b[0] = SHARD_COUNT as u8; // same shard as `a`
        assert!(cache.observe(a, now));
        assert!(cache.observe(b, now));
        assert_eq!(cache.len(), 1);
    }
}
