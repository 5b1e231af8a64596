//! Live `kube`-backed implementation of [`ClusterStore`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{DynamicObject, ObjectMeta};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};

use super::{ClusterStore, CreateObservationRequest, LogLine, LogStream, ObservationPage, WatchStream};
use crate::api_types::ingester::GroupVersionResource;
use crate::api_types::{Ingester, IngesterStatus, Observation};
use crate::error::{ErrorKind, StoreError};

/// Thin wrapper over a `kube::Client`. Cheap to clone; every adapter and the
/// pipeline share one instance. QPS/burst throttling is configured on the
/// `Client`'s underlying `Config` at construction.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        KubeStore { client }
    }

    /// Builds a client from the in-cluster service account, or the local
    /// kubeconfig when running outside the cluster.
    pub async fn try_default() -> Result<Self, StoreError> {
        let client = Client::try_default()
            .await
            .map_err(|e| StoreError::new(ErrorKind::Transient, format!("client init: {e}")))?;
        Ok(KubeStore::new(client))
    }

    fn dynamic_api_resource(gvr: &GroupVersionResource) -> kube::core::ApiResource {
        kube::core::ApiResource {
            group: gvr.group.clone(),
            version: gvr.version.clone(),
            api_version: if gvr.group.is_empty() {
                gvr.version.clone()
            } else {
                format!("{}/{}", gvr.group, gvr.version)
            },
            kind: gvr.resource.clone(),
            plural: gvr.resource.clone(),
        }
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn create_observation(&self, req: CreateObservationRequest) -> Result<Observation, StoreError> {
        let api: Api<Observation> = Api::namespaced(self.client.clone(), &req.namespace);
        let owner_refs = req.owner.map(|o| {
            vec![k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                api_version: o.api_version,
                kind: o.kind,
                name: o.name,
                uid: o.uid,
                controller: Some(false),
                block_owner_deletion: Some(false),
            }]
        });

        let observation = Observation {
            metadata: ObjectMeta {
                generate_name: Some(req.generate_name),
                namespace: Some(req.namespace),
                labels: Some(req.labels),
                owner_references: owner_refs,
                ..Default::default()
            },
            spec: req.spec,
            status: None,
        };

        api.create(&PostParams::default(), &observation)
            .await
            .map_err(StoreError::from_kube)
    }

    async fn list_observations_page(
        &self,
        continue_token: Option<String>,
        limit: u32,
    ) -> Result<ObservationPage, StoreError> {
        let api: Api<Observation> = Api::all(self.client.clone());
        let mut lp = ListParams::default().limit(limit);
        if let Some(token) = continue_token {
            lp = lp.continue_token(&token);
        }
        let list = api.list(&lp).await.map_err(StoreError::from_kube)?;
        Ok(ObservationPage {
            items: list.items,
            continue_token: list.metadata.continue_,
        })
    }

    async fn delete_observation(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let api: Api<Observation> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(StoreError::from_kube)?;
        Ok(())
    }

    async fn list_ingesters(&self) -> Result<Vec<Ingester>, StoreError> {
        let api: Api<Ingester> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(StoreError::from_kube)?;
        Ok(list.items)
    }

    fn watch_ingesters(&self) -> WatchStream<Ingester> {
        let api: Api<Ingester> = Api::all(self.client.clone());
        let stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .map_err(|e| StoreError::new(ErrorKind::Transient, e.to_string()));
        Box::pin(stream)
    }

    async fn patch_ingester_status(
        &self,
        namespace: &str,
        name: &str,
        status: IngesterStatus,
    ) -> Result<(), StoreError> {
        let api: Api<Ingester> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(StoreError::from_kube)?;
        Ok(())
    }

    fn watch_dynamic(
        &self,
        gvr: GroupVersionResource,
        namespace: Option<String>,
        label_selector: Option<String>,
    ) -> WatchStream<DynamicObject> {
        let ar = Self::dynamic_api_resource(&gvr);
        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), &ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        };
        let mut cfg = watcher::Config::default();
        if let Some(selector) = label_selector {
            cfg = cfg.labels(&selector);
        }
        let stream = watcher(api, cfg)
            .default_backoff()
            .map_err(|e| StoreError::new(ErrorKind::Transient, e.to_string()));
        Box::pin(stream)
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<String>, StoreError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(label_selector);
        let list = api.list(&lp).await.map_err(StoreError::from_kube)?;
        Ok(list.items.into_iter().map(|p| p.name_any()).collect())
    }

    fn log_stream(&self, namespace: &str, pod: &str, container: Option<&str>, since_seconds: i64) -> LogStream {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod_name = pod.to_string();
        let container_name = container.unwrap_or("").to_string();
        let lp = kube::api::LogParams {
            container: container.map(str::to_string),
            follow: true,
            since_seconds: Some(since_seconds),
            timestamps: false,
            ..Default::default()
        };

        let stream = async_stream::try_stream! {
            let bytes_stream = api
                .log_stream(&pod_name, &lp)
                .await
                .map_err(StoreError::from_kube)?;
            futures::pin_mut!(bytes_stream);
            let mut buf = Vec::new();
            while let Some(chunk) = bytes_stream
                .try_next()
                .await
                .map_err(StoreError::from_kube)?
            {
                buf.extend_from_slice(&chunk);
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line_bytes: Vec<u8> = buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line_bytes[..line_bytes.len().saturating_sub(1)]).to_string();
                    yield LogLine { pod: pod_name.clone(), container: container_name.clone(), line };
                }
            }
        };
        Box::pin(stream)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get(name).await.map_err(StoreError::from_kube)?;
        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect())
    }

    fn watch_configmap(&self, namespace: &str, name: &str) -> WatchStream<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let cfg = watcher::Config::default().fields(&format!("metadata.name={name}"));
        let stream = watcher(api, cfg)
            .default_backoff()
            .map_err(|e| StoreError::new(ErrorKind::Transient, e.to_string()));
        Box::pin(stream)
    }
}
