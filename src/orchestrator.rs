//! Reconciles `Ingester` resources into running adapters. Runs only on the leader; the ingester informer
//! ([`crate::ingester_watch`]) feeds this reconciler one event at a time.
//!
//! A change to `Ingester.spec` is either structural (the adapter's own
//! wiring — which GVR it watches, which path it listens on, which pods it
//! tails) or not (filter/dedup/ttl/rateLimit/normalization, all of which
//! the pipeline and deduper can pick up live). Structural changes restart
//! the adapter; everything else hot-updates the pipeline's per-source
//! config in place.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::adapters::webhook::WebhookRoute;
use crate::adapters::{informer::InformerAdapter, logs::LogsAdapter, webhook::WebhookAdapter, Adapter, EventSender};
use crate::api_types::ingester::{
    FilterSpec, GroupVersionResource, Ingester, IngesterCondition, IngesterKind, IngesterStatus, InformerSpec, LogsSpec,
    WebhookSpec,
};
use crate::config::{self, LegacyFilterWatcher};
use crate::normalize::PriorityBuckets;
use crate::pipeline::Pipeline;
use crate::store::ClusterStore;

const STOP_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CHANNEL_DEPTH: usize = 1024;

/// The part of `Ingester.spec` that determines the adapter's own wiring.
/// Two specs with the same `StructuralKey` can swap places via a hot
/// update; a changed key requires stopping the old adapter and starting
/// a new one.
#[derive(Clone, PartialEq)]
struct StructuralKey {
    kind: IngesterKind,
    informer: Option<InformerSpec>,
    webhook: Option<WebhookSpec>,
    logs: Option<LogsSpec>,
}

impl StructuralKey {
    fn of(ingester: &Ingester) -> Self {
        StructuralKey {
            kind: ingester.spec.ingester,
            informer: ingester.spec.informer.clone(),
            webhook: ingester.spec.webhook.clone(),
            logs: ingester.spec.logs.clone(),
        }
    }
}

struct RunningAdapter {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
    key: StructuralKey,
}

pub struct Orchestrator<S: ClusterStore + 'static> {
    store: Arc<S>,
    pipeline: Arc<Pipeline<S>>,
    webhook_registry: Arc<DashMap<String, Arc<WebhookRoute>>>,
    running: DashMap<String, RunningAdapter>,
    event_tx: EventSender,
    legacy_filter: Option<Arc<LegacyFilterWatcher<S>>>,
}

impl<S: ClusterStore + 'static> Orchestrator<S> {
    /// Spawns the shared drain task that feeds every adapter's output into
    /// the pipeline, and returns the orchestrator plus that task's handle.
    /// `legacy_filter` supplies the legacy ConfigMap's rules when
    /// rebuilding the filter snapshot on every `Ingester` change; pass
    /// `None` where no legacy ConfigMap watcher runs.
    pub fn new(
        store: Arc<S>,
        pipeline: Arc<Pipeline<S>>,
        webhook_registry: Arc<DashMap<String, Arc<WebhookRoute>>>,
        legacy_filter: Option<Arc<LegacyFilterWatcher<S>>>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let drain_pipeline = pipeline.clone();
        let drain_handle = tokio::spawn(async move {
            while let Some((event, raw)) = rx.recv().await {
                let source = event.source.clone();
                match drain_pipeline.process(event, &raw).await {
                    crate::pipeline::Outcome::Created(name) => {
                        info!(source = %source, observation = %name, "event became an observation");
                    }
                    crate::pipeline::Outcome::Dropped(reason) => {
                        info!(source = %source, reason, "event dropped");
                    }
                }
            }
        });

        (
            Orchestrator {
                store,
                pipeline,
                webhook_registry,
                running: DashMap::new(),
                event_tx: tx,
                legacy_filter,
            },
            drain_handle,
        )
    }

    /// Rebuilds the filter engine's snapshot from the current full
    /// `Ingester` list plus whatever legacy ConfigMap rules are loaded.
    /// Called whenever an `Ingester` is added, updated, or deleted so
    /// `FilterEngine::allow` always reflects live `spec.filter` rules
    /// instead of the engine's default "no configuration" pass-through.
    async fn reload_filter_snapshot(&self) {
        match self.store.list_ingesters().await {
            Ok(ingesters) => {
                let legacy_rules = self.legacy_filter.as_ref().map(|lf| lf.current_rules());
                let empty = BTreeMap::new();
                let legacy: &BTreeMap<String, FilterSpec> = legacy_rules.as_deref().unwrap_or(&empty);
                config::reload_filters(&self.pipeline.filter(), &ingesters, legacy);
            }
            Err(e) => warn!(error = %e.message, "failed to list ingesters while reloading filter snapshot"),
        }
    }

    /// Applies one `Ingester` add/update. Starts, hot-updates, or restarts
    /// the adapter as needed, and writes the resulting status back.
    pub async fn reconcile(&self, ingester: Ingester) {
        let key = ingester.identity();

        if !ingester.spec.enabled {
            self.stop(&key).await;
            self.pipeline.remove_source(&ingester.spec.source);
            self.patch_status(&ingester, None).await;
            self.reload_filter_snapshot().await;
            return;
        }

        if let Err(detail) = validate(&ingester) {
            warn!(ingester = %key, %detail, "ingester failed validation; not (re)starting adapter");
            self.patch_status(&ingester, Some(detail)).await;
            return;
        }

        let desired_key = StructuralKey::of(&ingester);
        let needs_restart = match self.running.get(&key) {
            Some(running) => running.key != desired_key,
            None => true,
        };

        if needs_restart {
            self.stop(&key).await;
            match self.start(&ingester, desired_key).await {
                Ok(running) => {
                    self.running.insert(key.clone(), running);
                }
                Err(detail) => {
                    self.patch_status(&ingester, Some(detail)).await;
                    return;
                }
            }
        }

        self.pipeline.configure_source(&ingester);
        self.patch_status(&ingester, None).await;
        self.reload_filter_snapshot().await;
    }

    pub async fn handle_delete(&self, ingester: &Ingester) {
        let key = ingester.identity();
        self.stop(&key).await;
        self.pipeline.remove_source(&ingester.spec.source);
        self.reload_filter_snapshot().await;
    }

    async fn start(&self, ingester: &Ingester, key: StructuralKey) -> Result<RunningAdapter, String> {
        let namespace = ingester.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
        let source = ingester.spec.source.clone();
        let cancel = CancellationToken::new();

        let adapter: Box<dyn Adapter> = match ingester.spec.ingester {
            IngesterKind::Informer => {
                let spec = ingester.spec.informer.clone().ok_or("informer spec missing")?;
                Box::new(InformerAdapter::new(source.clone(), spec, self.store.clone()))
            }
            IngesterKind::K8sEvents => {
                // Specialization of the informer adapter over core/v1 Events
                // (SPEC_FULL.md supplement): same adapter, a fixed GVR.
                let mut spec = ingester.spec.informer.clone().unwrap_or(InformerSpec {
                    gvr: GroupVersionResource {
                        group: String::new(),
                        version: "v1".to_string(),
                        resource: "events".to_string(),
                    },
                    namespace: None,
                    label_selector: None,
                    resync_period: None,
                    emit_deletes: false,
                });
                spec.gvr = GroupVersionResource {
                    group: String::new(),
                    version: "v1".to_string(),
                    resource: "events".to_string(),
                };
                Box::new(InformerAdapter::new(source.clone(), spec, self.store.clone()))
            }
            IngesterKind::Webhook => {
                let spec = ingester.spec.webhook.clone().ok_or("webhook spec missing")?;
                Box::new(WebhookAdapter::new(
                    source.clone(),
                    namespace,
                    spec,
                    self.store.clone(),
                    self.webhook_registry.clone(),
                ))
            }
            IngesterKind::Logs => {
                let spec = ingester.spec.logs.clone().ok_or("logs spec missing")?;
                let buckets = PriorityBuckets::new(ingester.spec.normalization.priority.clone());
                Box::new(LogsAdapter::new(source.clone(), namespace, spec, self.store.clone(), buckets))
            }
        };

        let run_cancel = cancel.clone();
        let out = self.event_tx.clone();
        let run_source = source.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = adapter.run(run_cancel, out).await {
                error!(source = %run_source, error = %e, "adapter exited with error");
            }
        });

        Ok(RunningAdapter { handle, cancel, key })
    }

    async fn stop(&self, key: &str) {
        let Some((_, running)) = self.running.remove(key) else {
            return;
        };
        running.cancel.cancel();
        if tokio::time::timeout(STOP_TIMEOUT, running.handle).await.is_err() {
            warn!(ingester = %key, "adapter did not stop within the grace period; abandoning it");
        }
    }

    async fn patch_status(&self, ingester: &Ingester, error: Option<String>) {
        let namespace = ingester.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
        let Some(name) = ingester.metadata.name.clone() else { return };

        let condition = match &error {
            None => IngesterCondition {
                condition_type: "Ready".to_string(),
                status: "True".to_string(),
                reason: Some("AdapterRunning".to_string()),
                message: None,
            },
            Some(detail) => IngesterCondition {
                condition_type: "Ready".to_string(),
                status: "False".to_string(),
                reason: Some("InvalidSpec".to_string()),
                message: Some(detail.clone()),
            },
        };

        let status = IngesterStatus {
            observed_generation: ingester.metadata.generation,
            conditions: vec![condition],
        };

        if let Err(e) = self.store.patch_ingester_status(&namespace, &name, status).await {
            warn!(ingester = %name, error = %e.message, "failed to patch ingester status");
        }
    }
}

/// Validates an `Ingester` before (re)starting an adapter for it. A
/// structurally invalid spec is reported on `status` rather than silently
/// ignored or crashing the orchestrator.
fn validate(ingester: &Ingester) -> Result<(), String> {
    match ingester.spec.ingester {
        IngesterKind::Informer => {
            if ingester.spec.informer.is_none() {
                return Err("ingester: informer requires spec.informer".to_string());
            }
        }
        IngesterKind::Webhook => {
            let Some(webhook) = &ingester.spec.webhook else {
                return Err("ingester: webhook requires spec.webhook".to_string());
            };
            if webhook.path.is_empty() || !webhook.path.starts_with('/') {
                return Err("ingester: webhook.path must be a non-empty absolute path".to_string());
            }
        }
        IngesterKind::Logs => {
            let Some(logs) = &ingester.spec.logs else {
                return Err("ingester: logs requires spec.logs".to_string());
            };
            if logs.patterns.is_empty() {
                return Err("ingester: logs.patterns must not be empty".to_string());
            }
        }
        IngesterKind::K8sEvents => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_types::ingester::{DedupSpec, IngesterSpec, NormalizationSpec, RateLimitSpec};
    use crate::dedup::Deduper;
    use crate::event::{Category, Event, Severity};
    use crate::filter::FilterEngine;
    use crate::store::fake::FakeStore;
    use kube::api::ObjectMeta;

    fn webhook_ingester(path: &str, enabled: bool) -> Ingester {
        Ingester {
            metadata: ObjectMeta {
                name: Some("falco".to_string()),
                namespace: Some("zen-system".to_string()),
                uid: Some("uid-1".to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: IngesterSpec {
                source: "falco".to_string(),
                ingester: IngesterKind::Webhook,
                enabled,
                informer: None,
                webhook: Some(WebhookSpec {
                    path: path.to_string(),
                    port: None,
                    buffer_size: None,
                    auth: None,
                    ip_allowlist: Vec::new(),
                }),
                logs: None,
                normalization: NormalizationSpec::default(),
                filter: Default::default(),
                dedup: DedupSpec::default(),
                processing: Default::default(),
                ttl: Default::default(),
                rate_limit: RateLimitSpec::default(),
                destinations: Vec::new(),
            },
            status: None,
        }
    }

    fn build_orchestrator() -> (Orchestrator<FakeStore>, Arc<FakeStore>, Arc<FilterEngine>) {
        let store = Arc::new(FakeStore::default());
        let filter = Arc::new(FilterEngine::new());
        let deduper = Arc::new(Deduper::new());
        let pipeline = Arc::new(Pipeline::new(store.clone(), filter.clone(), deduper));
        let registry = Arc::new(DashMap::new());
        let (orch, _drain) = Orchestrator::new(store.clone(), pipeline, registry, None);
        (orch, store, filter)
    }

    fn event(source: &str, severity: Severity) -> Event {
        Event {
            source: source.to_string(),
            category: Category::Security,
            severity,
            event_type: "vuln".to_string(),
            resource: None,
            details: Default::default(),
            namespace: Some("prod".to_string()),
            detected_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn reconcile_starts_an_adapter_and_marks_ready() {
        let (orch, store, _filter) = build_orchestrator();
        let ingester = webhook_ingester("/webhooks/falco", true);
        store.seed_ingester(ingester.clone());
        orch.reconcile(ingester).await;
        assert_eq!(orch.running.len(), 1);
        let patched = store.list_ingesters().await.unwrap();
        assert_eq!(patched[0].status.as_ref().unwrap().conditions[0].status, "True");
    }

    #[tokio::test]
    async fn non_structural_change_hot_updates_without_restart() {
        let (orch, store, _filter) = build_orchestrator();
        let mut ingester = webhook_ingester("/webhooks/falco", true);
        store.seed_ingester(ingester.clone());
        orch.reconcile(ingester.clone()).await;

        ingester.spec.filter.min_severity = Some("HIGH".to_string());
        store.seed_ingester(ingester.clone());
        orch.reconcile(ingester).await;
        assert_eq!(orch.running.len(), 1);
    }

    #[tokio::test]
    async fn filter_change_is_enforced_without_restart() {
        let (orch, store, filter) = build_orchestrator();
        let mut ingester = webhook_ingester("/webhooks/falco", true);
        store.seed_ingester(ingester.clone());
        orch.reconcile(ingester.clone()).await;

        let (allowed, _) = filter.allow(&event("falco", Severity::Low));
        assert!(allowed, "no filter configured yet; everything should pass");

        ingester.spec.filter.min_severity = Some("HIGH".to_string());
        store.seed_ingester(ingester.clone());
        orch.reconcile(ingester).await;
        assert_eq!(orch.running.len(), 1, "filter-only change must not restart the adapter");

        let (allowed, _) = filter.allow(&event("falco", Severity::Low));
        assert!(!allowed, "reconcile must reload the filter snapshot so the new rule is enforced");
        let (allowed, _) = filter.allow(&event("falco", Severity::Critical));
        assert!(allowed);
    }

    #[tokio::test]
    async fn structural_change_restarts_adapter() {
        let (orch, store, _filter) = build_orchestrator();
        let mut ingester = webhook_ingester("/webhooks/falco", true);
        store.seed_ingester(ingester.clone());
        orch.reconcile(ingester.clone()).await;

        ingester.spec.webhook.as_mut().unwrap().path = "/webhooks/falco-v2".to_string();
        orch.reconcile(ingester).await;
        assert_eq!(orch.running.len(), 1);
    }

    #[tokio::test]
    async fn disabling_an_ingester_stops_its_adapter() {
        let (orch, store, _filter) = build_orchestrator();
        let ingester = webhook_ingester("/webhooks/falco", true);
        store.seed_ingester(ingester.clone());
        orch.reconcile(ingester.clone()).await;
        assert_eq!(orch.running.len(), 1);

        let mut disabled = ingester;
        disabled.spec.enabled = false;
        orch.reconcile(disabled).await;
        assert_eq!(orch.running.len(), 0);
    }

    #[tokio::test]
    async fn invalid_webhook_spec_is_rejected_without_starting() {
        let (orch, store, _filter) = build_orchestrator();
        let mut ingester = webhook_ingester("relative/path", true);
        ingester.spec.webhook.as_mut().unwrap().path = "relative/path".to_string();
        store.seed_ingester(ingester.clone());
        orch.reconcile(ingester).await;
        assert_eq!(orch.running.len(), 0);
    }
}
