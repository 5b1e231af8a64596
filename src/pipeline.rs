//! The observation pipeline: the single choke point every adapter's events
//! pass through before becoming an `Observation`.
//!
//! Order is normalize (canonicalize severity-independent fields so filter
//! and dedup see the same shape regardless of which adapter produced the
//! event) then filter and dedup in the order `Ingester.processing.order`
//! names, then create. `ProcessingOrder` only reorders filter vs dedup —
//! normalize always runs first since both later stages depend on
//! normalized `event_type`/`resource.kind`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api_types::ingester::{Ingester, NormalizationSpec, ProcessingOrder, TtlSpec};
use crate::api_types::observation::{clamp_ttl, ObservationSpec};
use crate::dedup::Deduper;
use crate::error::{reason, ErrorKind, StoreError};
use crate::event::Event;
use crate::filter::FilterEngine;
use crate::normalize;
use crate::store::{ClusterStore, CreateObservationRequest, OwnerRef};

const MAX_CONFLICT_RETRIES: u32 = 3;
const MAX_TRANSIENT_RETRIES: u32 = 5;
const TRANSIENT_BACKOFF_BASE: Duration = Duration::from_millis(100);
const TRANSIENT_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Per-source configuration the pipeline needs once filtering and dedup
/// have already made their go/no-go decision: who owns the `Observation`,
/// and how its TTL and field mappings are derived.
#[derive(Clone)]
struct SourceConfig {
    owner: OwnerRef,
    namespace: String,
    normalization: NormalizationSpec,
    ttl: TtlSpec,
    processing_order: ProcessingOrder,
}

pub enum Outcome {
    Created(String),
    Dropped(&'static str),
}

pub struct Pipeline<S: ClusterStore + 'static> {
    store: Arc<S>,
    filter: Arc<FilterEngine>,
    deduper: Arc<Deduper>,
    sources: DashMap<String, SourceConfig>,
}

impl<S: ClusterStore + 'static> Pipeline<S> {
    pub fn new(store: Arc<S>, filter: Arc<FilterEngine>, deduper: Arc<Deduper>) -> Self {
        Pipeline {
            store,
            filter,
            deduper,
            sources: DashMap::new(),
        }
    }

    /// The shared filter engine, for callers that reload its snapshot
    /// (the orchestrator, on every `Ingester` change).
    pub fn filter(&self) -> Arc<FilterEngine> {
        self.filter.clone()
    }

    /// Registers (or updates) the source-scoped config derived from an
    /// `Ingester`. Dedup/rate-limit state lives in `Deduper` directly;
    /// filter snapshots are reloaded as a whole by the config loader, not
    /// per-source here.
    pub fn configure_source(&self, ingester: &Ingester) {
        let owner = OwnerRef {
            api_version: "zen.kube-zen.io/v1alpha1".to_string(),
            kind: "Ingester".to_string(),
            name: ingester.metadata.name.clone().unwrap_or_default(),
            uid: ingester.metadata.uid.clone().unwrap_or_default(),
        };
        self.deduper
            .configure(&ingester.spec.source, ingester.spec.dedup.clone(), &ingester.spec.rate_limit);
        self.sources.insert(
            ingester.spec.source.clone(),
            SourceConfig {
                owner,
                namespace: ingester.metadata.namespace.clone().unwrap_or_else(|| "default".to_string()),
                normalization: ingester.spec.normalization.clone(),
                ttl: ingester.spec.ttl,
                processing_order: ingester.spec.processing.order,
            },
        );
    }

    pub fn remove_source(&self, source: &str) {
        self.sources.remove(source);
    }

    /// Runs one event through normalize/filter/dedup/create. `raw_payload`
    /// is the adapter's original decoded body, consulted only by field
    /// mappings; adapters with nothing better pass `Value::Null`.
    pub async fn process(&self, mut event: Event, raw_payload: &Value) -> Outcome {
        let Some(config) = self.sources.get(&event.source).map(|c| c.clone()) else {
            // No Ingester registered for this source: nothing to normalize
            // or route against. Treat as allowed-but-unconfigured, matching
            // the filter engine's own default-allow for unknown sources.
            warn!(source = %event.source, "no source config registered; processing with defaults");
            return self.finish(event, raw_payload, None).await;
        };

        normalize::normalize(&mut event, &config.normalization, raw_payload);

        match config.processing_order {
            ProcessingOrder::FilterFirst => {
                let (allowed, why) = self.filter.allow(&event);
                if !allowed {
                    metrics::counter!("observations_filtered_total", "source" => event.source.clone(), "reason" => why).increment(1);
                    return Outcome::Dropped(why);
                }
                let (emit, why) = self.deduper.should_emit(&event);
                if !emit {
                    metrics::counter!("observations_deduped_total", "source" => event.source.clone(), "reason" => why).increment(1);
                    return Outcome::Dropped(why);
                }
            }
            ProcessingOrder::DedupFirst => {
                let (emit, why) = self.deduper.should_emit(&event);
                if !emit {
                    metrics::counter!("observations_deduped_total", "source" => event.source.clone(), "reason" => why).increment(1);
                    return Outcome::Dropped(why);
                }
                let (allowed, why) = self.filter.allow(&event);
                if !allowed {
                    metrics::counter!("observations_filtered_total", "source" => event.source.clone(), "reason" => why).increment(1);
                    return Outcome::Dropped(why);
                }
            }
        }

        self.finish(event, raw_payload, Some(config)).await
    }

    async fn finish(&self, event: Event, _raw_payload: &Value, config: Option<SourceConfig>) -> Outcome {
        let (namespace, owner, ttl) = match &config {
            Some(c) => (c.namespace.clone(), Some(c.owner.clone()), c.ttl),
            None => (
                event.effective_namespace().unwrap_or("default").to_string(),
                None,
                TtlSpec::default(),
            ),
        };

        let ttl_seconds = clamp_ttl(ttl.default, ttl.min, ttl.max);
        let spec = ObservationSpec {
            source: event.source.clone(),
            category: event.category.as_str().to_string(),
            severity: event.severity.as_str().to_string(),
            event_type: event.event_type.clone(),
            resource: event.resource.clone().map(Into::into),
            details: event.details.clone(),
            namespace: event.namespace.clone(),
            detected_at: Some(event.detected_at),
            ttl_seconds_after_creation: Some(ttl_seconds),
        };

        let mut labels = BTreeMap::new();
        labels.insert("zen.io/source".to_string(), sanitize_label(&event.source));
        labels.insert("zen.io/category".to_string(), event.category.as_str().to_string());
        labels.insert("zen.io/priority".to_string(), event.severity.as_str().to_ascii_lowercase());

        let generate_name = format!("{}-{}-", sanitize_name(&event.source), sanitize_name(&event.event_type));

        let req = CreateObservationRequest {
            namespace,
            generate_name,
            labels,
            owner,
            spec,
        };

        match self.create_with_retry(req).await {
            Ok(obs) => {
                metrics::counter!("observations_created_total", "source" => event.source.clone()).increment(1);
                metrics::gauge!("observations_live").increment(1.0);
                let name = obs.metadata.name.clone().unwrap_or_default();
                info!(source = %event.source, observation = %name, "created observation");
                Outcome::Created(name)
            }
            Err(kind) => {
                metrics::counter!("observations_create_errors_total", "source" => event.source.clone(), "kind" => kind.as_str()).increment(1);
                Outcome::Dropped(reason_for(kind))
            }
        }
    }

    /// Retries `create_observation` on conflicts (generate-name collisions,
    /// vanishingly rare but possible): retries up to
    /// [`MAX_CONFLICT_RETRIES`] times with a regenerated name suffix,
    /// transient failures retry up to [`MAX_TRANSIENT_RETRIES`] times with
    /// bounded exponential backoff, anything else (validation failure,
    /// permission denial) is dropped without retrying.
    async fn create_with_retry(
        &self,
        mut req: CreateObservationRequest,
    ) -> Result<crate::api_types::Observation, ErrorKind> {
        let mut conflict_attempts = 0;
        let mut transient_attempts = 0;
        loop {
            match self.store.create_observation(req.clone()).await {
                Ok(obs) => return Ok(obs),
                Err(StoreError { kind: ErrorKind::Conflict, .. }) => {
                    conflict_attempts += 1;
                    if conflict_attempts > MAX_CONFLICT_RETRIES {
                        return Err(ErrorKind::Conflict);
                    }
                    req.generate_name = format!("{}{}-", req.generate_name, uuid::Uuid::new_v4().simple());
                }
                Err(StoreError { kind: ErrorKind::Transient, .. }) => {
                    transient_attempts += 1;
                    if transient_attempts > MAX_TRANSIENT_RETRIES {
                        return Err(ErrorKind::Transient);
                    }
                    let backoff = (TRANSIENT_BACKOFF_BASE * 2u32.pow(transient_attempts.min(6))).min(TRANSIENT_BACKOFF_CAP);
                    debug!(attempt = transient_attempts, ?backoff, "retrying transient create failure");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e.kind),
            }
        }
    }
}

fn reason_for(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Invalid => reason::INVALID,
        ErrorKind::Transient => reason::TRANSIENT_EXHAUSTED,
        _ => reason::INVALID,
    }
}

fn sanitize_name(raw: &str) -> String {
    let mut out: String = raw
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    out.truncate(40);
    if out.is_empty() {
        out.push_str("event");
    }
    out
}

fn sanitize_label(raw: &str) -> String {
    sanitize_name(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_types::ingester::{DedupSpec, IngesterKind, IngesterSpec, RateLimitSpec};
    use crate::event::{Category, Severity};
    use crate::store::fake::FakeStore;
    use kube::api::ObjectMeta;

    fn make_ingester(source: &str) -> Ingester {
        Ingester {
            metadata: ObjectMeta {
                name: Some(format!("{source}-ingester")),
                namespace: Some("zen-system".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            spec: IngesterSpec {
                source: source.to_string(),
                ingester: IngesterKind::Webhook,
                enabled: true,
                informer: None,
                webhook: None,
                logs: None,
                normalization: NormalizationSpec::default(),
                filter: Default::default(),
                dedup: DedupSpec::default(),
                processing: Default::default(),
                ttl: TtlSpec::default(),
                rate_limit: RateLimitSpec {
                    max_per_minute: 6000,
                    burst: 6000,
                    cooldown_period: None,
                },
                destinations: Vec::new(),
            },
            status: None,
        }
    }

    fn event(source: &str) -> Event {
        Event {
            source: source.to_string(),
            category: Category::Security,
            severity: Severity::High,
            event_type: "runtime-threat".into(),
            resource: None,
            details: BTreeMap::new(),
            namespace: Some("prod".into()),
            detected_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn unfiltered_event_is_created_with_clamped_ttl() {
        let store = Arc::new(FakeStore::default());
        let filter = Arc::new(FilterEngine::new());
        let deduper = Arc::new(Deduper::new());
        let pipeline = Pipeline::new(store.clone(), filter, deduper);
        pipeline.configure_source(&make_ingester("falco"));

        let outcome = pipeline.process(event("falco"), &Value::Null).await;
        assert!(matches!(outcome, Outcome::Created(_)));
        assert_eq!(store.observations().len(), 1);
        assert_eq!(
            store.observations()[0].spec.ttl_seconds_after_creation,
            Some(604_800)
        );
    }

    #[tokio::test]
    async fn repeated_event_is_deduped_not_created_twice() {
        let store = Arc::new(FakeStore::default());
        let filter = Arc::new(FilterEngine::new());
        let deduper = Arc::new(Deduper::new());
        let pipeline = Pipeline::new(store.clone(), filter, deduper);
        pipeline.configure_source(&make_ingester("falco"));

        pipeline.process(event("falco"), &Value::Null).await;
        let outcome = pipeline.process(event("falco"), &Value::Null).await;
        assert!(matches!(outcome, Outcome::Dropped(reason::FINGERPRINT)));
        assert_eq!(store.observations().len(), 1);
    }

    #[tokio::test]
    async fn conflict_on_create_retries_with_regenerated_name() {
        let store = Arc::new(FakeStore::default());
        *store.inject_create_error.lock().unwrap() = Some(ErrorKind::Conflict);
        let filter = Arc::new(FilterEngine::new());
        let deduper = Arc::new(Deduper::new());
        let pipeline = Pipeline::new(store.clone(), filter, deduper);
        pipeline.configure_source(&make_ingester("falco"));

        let outcome = pipeline.process(event("falco"), &Value::Null).await;
        assert!(matches!(outcome, Outcome::Created(_)));
        assert_eq!(store.observations().len(), 1);
    }
}
