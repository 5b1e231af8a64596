//! Garbage collector: periodically deletes `Observation`s whose TTL has
//! elapsed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api_types::Observation;
use crate::store::ClusterStore;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3600);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const PAGE_SIZE: u32 = 500;
const DELETE_CHUNK: usize = 50;
const DELETE_CHUNK_PAUSE: Duration = Duration::from_millis(50);

#[derive(Default, Debug, Clone, Copy, Eq, PartialEq)]
pub struct SweepOutcome {
    pub deleted: u64,
    pub errors: u64,
}

pub struct GarbageCollector<S> {
    store: Arc<S>,
    interval: Duration,
    timeout: Duration,
}

impl<S: ClusterStore> GarbageCollector<S> {
    pub fn new(store: Arc<S>, interval: Duration, timeout: Duration) -> Self {
        GarbageCollector { store, interval, timeout }
    }

    /// Ticks every `interval`, bounding each sweep at `timeout` so a slow or
    /// wedged apiserver doesn't delay the next cycle indefinitely.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await; // first tick fires immediately; skip it here, sweep on the next cadence

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("garbage collector stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match tokio::time::timeout(self.timeout, self.sweep()).await {
                        Ok(outcome) => {
                            info!(deleted = outcome.deleted, errors = outcome.errors, "gc sweep complete");
                        }
                        Err(_) => {
                            warn!(timeout_secs = self.timeout.as_secs(), "gc sweep timed out");
                            metrics::counter!("gc_errors_total").increment(1);
                        }
                    }
                }
            }
        }
    }

    /// Pages through every `Observation` and deletes the ones whose TTL has
    /// elapsed. A failed page or delete is logged and counted; it never
    /// aborts the rest of the sweep.
    pub async fn sweep(&self) -> SweepOutcome {
        let now = Utc::now();
        let mut outcome = SweepOutcome::default();
        let mut continue_token = None;

        loop {
            let page = match self.store.list_observations_page(continue_token.clone(), PAGE_SIZE).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e.message, "gc failed to list observations; ending sweep early");
                    outcome.errors += 1;
                    metrics::counter!("gc_errors_total").increment(1);
                    break;
                }
            };

            let expired: Vec<&Observation> = page.items.iter().filter(|o| is_expired(o, now)).collect();
            for chunk in expired.chunks(DELETE_CHUNK) {
                for obs in chunk {
                    let (Some(namespace), Some(name)) = (obs.metadata.namespace.as_deref(), obs.metadata.name.as_deref()) else {
                        continue;
                    };
                    match self.store.delete_observation(namespace, name).await {
                        Ok(()) => {
                            outcome.deleted += 1;
                            metrics::gauge!("observations_live").decrement(1.0);
                        }
                        Err(e) => {
                            outcome.errors += 1;
                            warn!(namespace, name, error = %e.message, "gc failed to delete observation");
                            metrics::counter!("gc_errors_total").increment(1);
                        }
                    }
                }
                tokio::time::sleep(DELETE_CHUNK_PAUSE).await;
            }

            match page.continue_token {
                Some(token) => continue_token = Some(token),
                None => break,
            }
        }

        outcome
    }
}

fn is_expired(obs: &Observation, now: chrono::DateTime<Utc>) -> bool {
    let Some(ttl) = obs.spec.ttl_seconds_after_creation else {
        return false;
    };
    let created = match &obs.metadata.creation_timestamp {
        Some(t) => t.0,
        None => return false,
    };
    (now - created).num_seconds() >= ttl
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_types::ObservationSpec;
    use crate::store::fake::FakeStore;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::core::ObjectMeta;

    fn observation(name: &str, ttl: Option<i64>, age_seconds: i64) -> Observation {
        Observation {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                creation_timestamp: Some(Time(Utc::now() - chrono::Duration::seconds(age_seconds))),
                ..Default::default()
            },
            spec: ObservationSpec {
                source: "trivy".to_string(),
                category: "security".to_string(),
                severity: "HIGH".to_string(),
                event_type: "vuln".to_string(),
                resource: None,
                details: Default::default(),
                namespace: None,
                detected_at: None,
                ttl_seconds_after_creation: ttl,
            },
            status: None,
        }
    }

    #[tokio::test]
    async fn sweep_deletes_only_observations_past_their_ttl() {
        let store = Arc::new(FakeStore::new());
        store.seed_observation(observation("expired", Some(60), 120));
        store.seed_observation(observation("fresh", Some(3600), 10));

        let gc = GarbageCollector::new(store.clone(), DEFAULT_INTERVAL, DEFAULT_TIMEOUT);
        let outcome = gc.sweep().await;

        assert_eq!(outcome.deleted, 1);
        assert_eq!(outcome.errors, 0);
        let remaining = store.observations();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].metadata.name.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn sweep_leaves_observations_without_a_ttl_alone() {
        let store = Arc::new(FakeStore::new());
        store.seed_observation(observation("no-ttl", None, 1_000_000));

        let gc = GarbageCollector::new(store.clone(), DEFAULT_INTERVAL, DEFAULT_TIMEOUT);
        let outcome = gc.sweep().await;

        assert_eq!(outcome.deleted, 0);
        assert_eq!(store.observations().len(), 1);
    }

    #[tokio::test]
    async fn sweep_skips_observations_missing_required_metadata() {
        let store = Arc::new(FakeStore::new());
        let mut obs = observation("ghost", Some(60), 120);
        obs.metadata.name = None;
        store.seed_observation(obs);

        let gc = GarbageCollector::new(store.clone(), DEFAULT_INTERVAL, DEFAULT_TIMEOUT);
        let outcome = gc.sweep().await;
        assert_eq!(outcome.deleted, 0);
        assert_eq!(outcome.errors, 0);
    }
}
