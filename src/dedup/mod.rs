//! Content dedup and per-source rate limiting, the stage between filter and
//! create. `Deduper::should_emit` is the full contract: a
//! single call that applies whichever strategy the owning `Ingester`
//! configured and records the drop reason for metrics.

pub mod fingerprint;
pub mod rate_limit;
pub mod window;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::api_types::ingester::{DedupSpec, DedupStrategy, RateLimitSpec};
use crate::error::reason;
use crate::event::Event;
use rate_limit::RateLimiters;
use window::WindowCache;

const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_CAPACITY: usize = 10_000;

/// Per-source seen/emitted counters backing the `dedup_effectiveness` gauge
///.
#[derive(Default)]
struct SourceCounts {
    seen: AtomicU64,
    emitted: AtomicU64,
}

struct SourceDedup {
    spec: DedupSpec,
    window: WindowCache,
}

impl SourceDedup {
    fn new(spec: DedupSpec) -> Self {
        let window = humantime::parse_duration(&spec.window).unwrap_or(DEFAULT_WINDOW);
        let capacity = spec.max_events_per_window.map(|n| n as usize).unwrap_or(DEFAULT_CAPACITY);
        SourceDedup {
            window: WindowCache::new(capacity, window),
            spec,
        }
    }

    fn fingerprint(&self, event: &Event) -> fingerprint::Fingerprint {
        match self.spec.strategy {
            DedupStrategy::Fingerprint => fingerprint::fingerprint(event),
            DedupStrategy::Key => fingerprint::key_fingerprint(event, &self.spec.fields),
            // Hybrid: combine both signals so either a content change or a
            // key change is enough to treat the event as new.
            DedupStrategy::Hybrid => {
                let content = fingerprint::fingerprint(event);
                let key = fingerprint::key_fingerprint(event, &self.spec.fields);
                let mut combined = [0u8; 32];
                for i in 0..32 {
                    combined[i] = content[i] ^ key[i];
                }
                combined
            }
        }
    }
}

pub struct Deduper {
    sources: DashMap<String, SourceDedup>,
    counts: DashMap<String, SourceCounts>,
    rate_limiters: RateLimiters,
}

impl Default for Deduper {
    fn default() -> Self {
        Deduper::new()
    }
}

impl Deduper {
    pub fn new() -> Self {
        Deduper {
            sources: DashMap::new(),
            counts: DashMap::new(),
            rate_limiters: RateLimiters::new(),
        }
    }

    /// (Re)configures a source's dedup window/strategy and rate limit
    /// bucket. Called whenever the owning `Ingester`'s spec changes.
    pub fn configure(&self, source: &str, dedup: DedupSpec, rate_limit: &RateLimitSpec) {
        self.sources.insert(source.to_string(), SourceDedup::new(dedup));
        self.rate_limiters.configure(source, rate_limit);
        self.counts.entry(source.to_string()).or_default();
    }

    /// Applies dedup then rate limiting to `event`, returning `(emit,
    /// reason)`. `reason` is only meaningful when `emit` is `false`.
    pub fn should_emit(&self, event: &Event) -> (bool, &'static str) {
        let counts = self.counts.entry(event.source.clone()).or_default();
        counts.seen.fetch_add(1, Ordering::Relaxed);

        if let Some(source) = self.sources.get(&event.source) {
            if source.spec.enabled {
                let fp = source.fingerprint(event);
                if !source.window.observe(fp, Instant::now()) {
                    return (false, reason::FINGERPRINT);
                }
            }
        }

        if !self.rate_limiters.allow(&event.source) {
            return (false, reason::RATE_LIMIT);
        }

        counts.emitted.fetch_add(1, Ordering::Relaxed);
        (true, "")
    }

    /// `1 - emitted/seen` for `source`, or `0.0` (no suppression observed
    /// yet) if the source has no recorded traffic.
    pub fn effectiveness(&self, source: &str) -> f64 {
        let Some(counts) = self.counts.get(source) else {
            return 0.0;
        };
        let seen = counts.seen.load(Ordering::Relaxed);
        if seen == 0 {
            return 0.0;
        }
        let emitted = counts.emitted.load(Ordering::Relaxed);
        1.0 - (emitted as f64 / seen as f64)
    }

    /// Periodic background sweep dropping window entries whose dedup
    /// window has already elapsed, across all configured sources.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        for entry in self.sources.iter() {
            entry.window.sweep_expired(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Category, ResourceRef, Severity};
    use std::collections::BTreeMap;

    fn event(source: &str, cve: &str) -> Event {
        Event {
            source: source.into(),
            category: Category::Security,
            severity: Severity::High,
            event_type: "vuln".into(),
            resource: Some(ResourceRef {
                kind: Some("Pod".into()),
                name: Some("web-1".into()),
                namespace: Some("prod".into()),
                ..Default::default()
            }),
            details: BTreeMap::from([("cve".to_string(), serde_json::json!(cve))]),
            namespace: Some("prod".into()),
            detected_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn repeated_fingerprint_within_window_is_suppressed() {
        let deduper = Deduper::new();
        deduper.configure(
            "trivy",
            DedupSpec {
                window: "60s".into(),
                ..Default::default()
            },
            &RateLimitSpec {
                max_per_minute: 6000,
                burst: 6000,
                cooldown_period: None,
            },
        );
        let (emit, _) = deduper.should_emit(&event("trivy", "CVE-1"));
        assert!(emit);
        let (emit, why) = deduper.should_emit(&event("trivy", "CVE-1"));
        assert!(!emit);
        assert_eq!(why, reason::FINGERPRINT);
    }

    #[test]
    fn distinct_fingerprints_both_emit() {
        let deduper = Deduper::new();
        deduper.configure(
            "trivy",
            DedupSpec::default(),
            &RateLimitSpec {
                max_per_minute: 6000,
                burst: 6000,
                cooldown_period: None,
            },
        );
        assert!(deduper.should_emit(&event("trivy", "CVE-1")).0);
        assert!(deduper.should_emit(&event("trivy", "CVE-2")).0);
    }

    #[test]
    fn unconfigured_source_skips_dedup_but_not_rate_limit() {
        let deduper = Deduper::new();
        assert!(deduper.should_emit(&event("unknown", "CVE-1")).0);
        assert!(deduper.should_emit(&event("unknown", "CVE-1")).0);
    }

    #[test]
    fn effectiveness_reflects_suppression_ratio() {
        let deduper = Deduper::new();
        deduper.configure(
            "trivy",
            DedupSpec::default(),
            &RateLimitSpec {
                max_per_minute: 6000,
                burst: 6000,
                cooldown_period: None,
            },
        );
        deduper.should_emit(&event("trivy", "CVE-1"));
        deduper.should_emit(&event("trivy", "CVE-1"));
        deduper.should_emit(&event("trivy", "CVE-1"));
        assert!((deduper.effectiveness("trivy") - (1.0 - 1.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn rate_limit_suppresses_after_burst_even_with_distinct_fingerprints() {
        let deduper = Deduper::new();
        deduper.configure(
            "webhook-src",
            DedupSpec {
                enabled: false,
                ..Default::default()
            },
            &RateLimitSpec {
                max_per_minute: 60,
                burst: 1,
                cooldown_period: None,
            },
        );
        assert!(deduper.should_emit(&event("webhook-src", "CVE-1")).0);
        let (emit, why) = deduper.should_emit(&event("webhook-src", "CVE-2"));
        assert!(!emit);
        assert_eq!(why, reason::RATE_LIMIT);
    }
}
