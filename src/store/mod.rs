//! Cluster store client: typed and dynamic access to watched resources and
//! the `Observation` resource, abstracted so the pipeline is testable
//! against an in-memory fake rather than a live apiserver.

pub mod fake;
pub mod kube_store;

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use kube::runtime::watcher;

use crate::api_types::ingester::GroupVersionResource;
use crate::api_types::{Ingester, IngesterStatus, Observation, ObservationSpec};
use crate::error::StoreError;

pub use kube_store::KubeStore;

/// A boxed, owned stream of watch events — the same shape `kube::runtime::watcher`
/// yields, kept abstract so `fake::FakeStore` can produce one without a client.
pub type WatchStream<K> = Pin<Box<dyn Stream<Item = Result<watcher::Event<K>, StoreError>> + Send>>;

/// One already-decoded log line plus which pod/container produced it.
#[derive(Clone, Debug)]
pub struct LogLine {
    pub pod: String,
    pub container: String,
    pub line: String,
}

pub type LogStream = Pin<Box<dyn Stream<Item = Result<LogLine, StoreError>> + Send>>;

#[derive(Clone, Debug, Default)]
pub struct CreateObservationRequest {
    pub namespace: String,
    pub generate_name: String,
    pub labels: BTreeMap<String, String>,
    pub owner: Option<OwnerRef>,
    pub spec: ObservationSpec,
}

#[derive(Clone, Debug)]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

#[derive(Clone, Debug, Default)]
pub struct ObservationPage {
    pub items: Vec<Observation>,
    pub continue_token: Option<String>,
}

/// The abstraction the rest of the system depends on instead of a specific
/// client library.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Creates an `Observation`. Callers are responsible for regenerating
    /// `generate_name` and retrying on `ErrorKind::Conflict`.
    async fn create_observation(&self, req: CreateObservationRequest) -> Result<Observation, StoreError>;

    /// Pages through all `Observation`s, `limit` at a time.
    async fn list_observations_page(
        &self,
        continue_token: Option<String>,
        limit: u32,
    ) -> Result<ObservationPage, StoreError>;

    async fn delete_observation(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    async fn list_ingesters(&self) -> Result<Vec<Ingester>, StoreError>;

    /// Runs only on the leader.
    fn watch_ingesters(&self) -> WatchStream<Ingester>;

    /// Patches `status` on an `Ingester`. Restricted in practice to the
    /// controller service account by admission policy.
    async fn patch_ingester_status(
        &self,
        namespace: &str,
        name: &str,
        status: IngesterStatus,
    ) -> Result<(), StoreError>;

    /// Opens a watch over an arbitrary GVR.
    fn watch_dynamic(
        &self,
        gvr: GroupVersionResource,
        namespace: Option<String>,
        label_selector: Option<String>,
    ) -> WatchStream<kube::core::DynamicObject>;

    /// Lists pods matching a label selector in a namespace.
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<String>, StoreError>;

    /// Tails one pod/container's logs from `since_seconds` ago.
    fn log_stream(&self, namespace: &str, pod: &str, container: Option<&str>, since_seconds: i64) -> LogStream;

    /// Reads a secret's data map, used by the webhook adapter's auth setup:
    /// the secret is read from the named cluster secret at adapter start.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, Vec<u8>>, StoreError>;

    /// Watches the legacy filter ConfigMap.
    fn watch_configmap(&self, namespace: &str, name: &str) -> WatchStream<k8s_openapi::api::core::v1::ConfigMap>;
}
