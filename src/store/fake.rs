//! In-memory fake `ClusterStore`, used by unit and pipeline tests instead of
//! a live apiserver.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use kube::core::{DynamicObject, ObjectMeta};
use kube::runtime::watcher;

use super::{ClusterStore, CreateObservationRequest, LogStream, ObservationPage, WatchStream};
use crate::api_types::ingester::GroupVersionResource;
use crate::api_types::{Ingester, IngesterStatus, Observation};
use crate::error::{ErrorKind, StoreError};

/// An in-memory stand-in for the cluster API, enough to drive the full
/// filter -> normalize -> dedup -> create pipeline in tests without a
/// running apiserver.
#[derive(Default)]
pub struct FakeStore {
    observations: Mutex<Vec<Observation>>,
    ingesters: Mutex<Vec<Ingester>>,
    secrets: Mutex<BTreeMap<(String, String), BTreeMap<String, Vec<u8>>>>,
    counter: AtomicU64,
    /// When set, every `create_observation` call fails with this kind once,
    /// then clears — used to test conflict/transient retry paths.
    pub inject_create_error: Mutex<Option<ErrorKind>>,
}

impl FakeStore {
    pub fn new() -> Self {
        FakeStore::default()
    }

    pub fn observations(&self) -> Vec<Observation> {
        self.observations.lock().unwrap().clone()
    }

    /// Upserts by namespace/name, mirroring how a real apiserver always
    /// holds one current version of an object.
    pub fn seed_ingester(&self, ing: Ingester) {
        let mut items = self.ingesters.lock().unwrap();
        if let Some(existing) = items
            .iter_mut()
            .find(|i| i.metadata.namespace == ing.metadata.namespace && i.metadata.name == ing.metadata.name)
        {
            *existing = ing;
        } else {
            items.push(ing);
        }
    }

    pub fn seed_secret(&self, namespace: &str, name: &str, data: BTreeMap<String, Vec<u8>>) {
        self.secrets
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), data);
    }

    pub fn seed_observation(&self, obs: Observation) {
        self.observations.lock().unwrap().push(obs);
    }
}

#[async_trait]
impl ClusterStore for FakeStore {
    async fn create_observation(&self, req: CreateObservationRequest) -> Result<Observation, StoreError> {
        if let Some(kind) = self.inject_create_error.lock().unwrap().take() {
            return Err(StoreError::new(kind, "injected failure"));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}{n:08x}", req.generate_name);
        let observation = Observation {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(req.namespace),
                labels: Some(req.labels),
                ..Default::default()
            },
            spec: req.spec,
            status: None,
        };
        self.observations.lock().unwrap().push(observation.clone());
        Ok(observation)
    }

    async fn list_observations_page(
        &self,
        _continue_token: Option<String>,
        limit: u32,
    ) -> Result<ObservationPage, StoreError> {
        let items = self.observations.lock().unwrap();
        let items: Vec<_> = items.iter().take(limit as usize).cloned().collect();
        Ok(ObservationPage {
            items,
            continue_token: None,
        })
    }

    async fn delete_observation(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut items = self.observations.lock().unwrap();
        let before = items.len();
        items.retain(|o| {
            !(o.metadata.namespace.as_deref() == Some(namespace) && o.metadata.name.as_deref() == Some(name))
        });
        if items.len() == before {
            return Err(StoreError::new(ErrorKind::NotFound, "observation not found"));
        }
        Ok(())
    }

    async fn list_ingesters(&self) -> Result<Vec<Ingester>, StoreError> {
        Ok(self.ingesters.lock().unwrap().clone())
    }

    fn watch_ingesters(&self) -> WatchStream<Ingester> {
        // Fake store has no watch support; tests drive the orchestrator
        // directly via `reconcile()` rather than via a watch stream.
        Box::pin(futures::stream::empty())
    }

    async fn patch_ingester_status(
        &self,
        namespace: &str,
        name: &str,
        status: IngesterStatus,
    ) -> Result<(), StoreError> {
        let mut items = self.ingesters.lock().unwrap();
        for ing in items.iter_mut() {
            if ing.metadata.namespace.as_deref() == Some(namespace) && ing.metadata.name.as_deref() == Some(name) {
                ing.status = Some(status);
                return Ok(());
            }
        }
        Err(StoreError::new(ErrorKind::NotFound, "ingester not found"))
    }

    fn watch_dynamic(
        &self,
        _gvr: GroupVersionResource,
        _namespace: Option<String>,
        _label_selector: Option<String>,
    ) -> WatchStream<DynamicObject> {
        Box::pin(futures::stream::empty())
    }

    async fn list_pods(&self, _namespace: &str, _label_selector: &str) -> Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }

    fn log_stream(&self, _namespace: &str, _pod: &str, _container: Option<&str>, _since_seconds: i64) -> LogStream {
        Box::pin(futures::stream::empty())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::new(ErrorKind::NotFound, "secret not found"))
    }

    fn watch_configmap(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> WatchStream<k8s_openapi::api::core::v1::ConfigMap> {
        Box::pin(futures::stream::empty())
    }
}

/// Builds a `watcher::Event::Applied` event, convenient in tests that feed
/// synthetic watch events directly into a handler function.
pub fn applied<K>(obj: K) -> watcher::Event<K> {
    watcher::Event::Applied(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_types::ObservationSpec;
    use crate::store::CreateObservationRequest;

    #[tokio::test]
    async fn create_observation_assigns_unique_names() {
        let store = FakeStore::new();
        let req = |gen_name: &str| CreateObservationRequest {
            namespace: "default".into(),
            generate_name: gen_name.into(),
            spec: ObservationSpec {
                source: "trivy".into(),
                category: "security".into(),
                severity: "HIGH".into(),
                event_type: "vuln".into(),
                resource: None,
                details: Default::default(),
                namespace: None,
                detected_at: None,
                ttl_seconds_after_creation: None,
            },
            ..Default::default()
        };
        let a = store.create_observation(req("trivy-")).await.unwrap();
        let b = store.create_observation(req("trivy-")).await.unwrap();
        assert_ne!(a.metadata.name, b.metadata.name);
        assert_eq!(store.observations().len(), 2);
    }

    #[tokio::test]
    async fn create_observation_honors_injected_failure_once() {
        let store = FakeStore::new();
        *store.inject_create_error.lock().unwrap() = Some(ErrorKind::Conflict);
        let req = CreateObservationRequest {
            namespace: "default".into(),
            generate_name: "trivy-".into(),
            spec: ObservationSpec {
                source: "trivy".into(),
                category: "security".into(),
                severity: "HIGH".into(),
                event_type: "vuln".into(),
                resource: None,
                details: Default::default(),
                namespace: None,
                detected_at: None,
                ttl_seconds_after_creation: None,
            },
            ..Default::default()
        };
        assert!(store.create_observation(req.clone()).await.is_err());
        assert!(store.create_observation(req).await.is_ok());
    }
}
