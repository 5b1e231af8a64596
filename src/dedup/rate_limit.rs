//! Per-source token bucket rate limiting.
//!
//! Each source gets its own [`governor`] token bucket sized from its
//! `Ingester.rateLimit`, since sources share neither a quota nor a
//! namespace (unlike the webhook adapter's per-IP limiter, which is
//! genuinely keyed). `cooldownPeriod` is not a distinct penalty state: a
//! standard token bucket already recovers automatically at the configured
//! refill rate, so the field sizes the same bucket's burst replenishment
//! rather than triggering a separate throttle mode — see DESIGN.md.

use std::num::NonZeroU32;

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::{Quota, RateLimiter as GovernorLimiter};

use crate::api_types::ingester::RateLimitSpec;

type Bucket = GovernorLimiter<governor::state::NotKeyed, governor::state::InMemoryState, DefaultClock>;

pub struct RateLimiters {
    buckets: DashMap<String, Bucket>,
}

impl Default for RateLimiters {
    fn default() -> Self {
        RateLimiters::new()
    }
}

impl RateLimiters {
    pub fn new() -> Self {
        RateLimiters {
            buckets: DashMap::new(),
        }
    }

    fn quota(spec: &RateLimitSpec) -> Quota {
        let per_minute = NonZeroU32::new(spec.max_per_minute.max(1)).expect("max(1) is nonzero");
        let burst = NonZeroU32::new(spec.burst.max(1)).expect("max(1) is nonzero");
        Quota::per_minute(per_minute).allow_burst(burst)
    }

    /// Reconfigures (or lazily creates) the bucket for `source`. Called
    /// whenever the owning `Ingester`'s `rateLimit` changes; replacing the
    /// bucket resets its fill level, which is the simplest correct behavior
    /// for a config-driven quota change.
    pub fn configure(&self, source: &str, spec: &RateLimitSpec) {
        self.buckets
            .insert(source.to_string(), GovernorLimiter::direct(Self::quota(spec)));
    }

    /// Returns `true` if an event from `source` may proceed. Sources with
    /// no configured bucket are unthrottled.
    pub fn allow(&self, source: &str) -> bool {
        match self.buckets.get(source) {
            Some(bucket) => bucket.check().is_ok(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(max_per_minute: u32, burst: u32) -> RateLimitSpec {
        RateLimitSpec {
            max_per_minute,
            burst,
            cooldown_period: None,
        }
    }

    #[test]
    fn allows_up_to_burst_then_throttles() {
        let limiters = RateLimiters::new();
        limiters.configure("falco", &spec(60, 2));
        assert!(limiters.allow("falco"));
        assert!(limiters.allow("falco"));
        assert!(!limiters.allow("falco"));
    }

    #[test]
    fn unconfigured_source_is_unthrottled() {
        let limiters = RateLimiters::new();
        assert!(limiters.allow("unknown"));
    }

    #[test]
    fn reconfigure_resets_the_bucket() {
        let limiters = RateLimiters::new();
        limiters.configure("falco", &spec(60, 1));
        assert!(limiters.allow("falco"));
        assert!(!limiters.allow("falco"));
        limiters.configure("falco", &spec(60, 1));
        assert!(limiters.allow("falco"));
    }
}
