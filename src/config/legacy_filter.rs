//! Watches the legacy filter ConfigMap and merges it into the live filter
//! snapshot. Pre-dates the `Ingester.filter` field; kept for
//! operators who haven't migrated their rules onto the CRD yet.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api_types::ingester::FilterSpec;
use crate::filter::FilterEngine;
use crate::store::ClusterStore;

use super::reload_filters;

pub struct LegacyFilterWatcher<S> {
    store: Arc<S>,
    engine: Arc<FilterEngine>,
    namespace: String,
    name: String,
    key: String,
    current: ArcSwap<BTreeMap<String, FilterSpec>>,
}

impl<S: ClusterStore> LegacyFilterWatcher<S> {
    pub fn new(store: Arc<S>, engine: Arc<FilterEngine>, namespace: String, name: String, key: String) -> Self {
        LegacyFilterWatcher {
            store,
            engine,
            namespace,
            name,
            key,
            current: ArcSwap::from_pointee(BTreeMap::new()),
        }
    }

    pub fn current_rules(&self) -> Arc<BTreeMap<String, FilterSpec>> {
        self.current.load_full()
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(namespace = %self.namespace, name = %self.name, "legacy filter configmap watcher starting");
        let mut stream = self.store.watch_configmap(&self.namespace, &self.name);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("legacy filter configmap watcher stopping");
                    break;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(watcher::Event::Applied(cm))) => self.apply(&cm).await,
                        Some(Ok(watcher::Event::Restarted(cms))) => {
                            if let Some(cm) = cms.into_iter().last() {
                                self.apply(&cm).await;
                            }
                        }
                        Some(Ok(watcher::Event::Deleted(_))) => self.clear().await,
                        Some(Err(e)) => warn!(error = %e, "legacy filter configmap watch error"),
                        None => {
                            warn!("legacy filter configmap watch stream ended");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn apply(&self, cm: &ConfigMap) {
        let Some(data) = cm.data.as_ref().and_then(|d| d.get(&self.key)) else {
            warn!(key = %self.key, "legacy filter configmap has no data for the configured key; ignoring");
            return;
        };
        match serde_json::from_str::<BTreeMap<String, FilterSpec>>(data) {
            Ok(parsed) => self.install(parsed).await,
            Err(e) => {
                warn!(error = %e, "legacy filter configmap failed to parse; retaining last-good rules");
            }
        }
    }

    async fn clear(&self) {
        self.install(BTreeMap::new()).await;
    }

    async fn install(&self, legacy: BTreeMap<String, FilterSpec>) {
        self.current.store(Arc::new(legacy.clone()));
        match self.store.list_ingesters().await {
            Ok(ingesters) => {
                reload_filters(&self.engine, &ingesters, &legacy);
                info!(sources = legacy.len(), "legacy filter rules merged into filter engine");
            }
            Err(e) => warn!(error = %e.message, "failed to list ingesters while merging legacy filter rules"),
        }
    }
}
