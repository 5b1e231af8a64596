//! Process entry point: wires the cluster store, pipeline, adapters,
//! coordination, GC, and HTTP surface together, then runs until a shutdown
//! signal arrives.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use dashmap::DashMap;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use zen_watcher::adapters::webhook::WebhookRoute;
use zen_watcher::config::{LegacyFilterWatcher, RuntimeConfig};
use zen_watcher::coordination::{KubeLeaseBackend, LeaderElector, LeaseBackend};
use zen_watcher::dedup::Deduper;
use zen_watcher::filter::FilterEngine;
use zen_watcher::gc::GarbageCollector;
use zen_watcher::http::{self, HttpState};
use zen_watcher::ingester_watch;
use zen_watcher::orchestrator::Orchestrator;
use zen_watcher::pipeline::Pipeline;
use zen_watcher::store::{ClusterStore, KubeStore};

const LEASE_NAME: &str = "zen-watcher-leader";

#[derive(Parser, Debug)]
#[command(name = "zen-watcher", about = "Kubernetes-native observation aggregation pipeline")]
struct Cli {
    /// Namespace the coordination lease and legacy filter ConfigMap live in.
    #[arg(long, env = "POD_NAMESPACE", default_value = "zen-system")]
    namespace: String,

    /// Stable identity for leader election; defaults to a generated one.
    #[arg(long, env = "POD_NAME")]
    identity: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = RuntimeConfig::from_env();
    zen_watcher::telemetry::init(&config.log_level);
    let prometheus_handle = zen_watcher::metrics::install_recorder();

    let identity = cli.identity.unwrap_or_else(|| format!("zen-watcher-{}", uuid::Uuid::new_v4().simple()));

    let client = match Client::try_default().await {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to build kube client");
            std::process::exit(1);
        }
    };
    let store = Arc::new(KubeStore::new(client.clone()));

    // The process crashes only on missing essential bootstrap; an
    // unreachable Observation CRD at startup is exactly that.
    if let Err(e) = store.list_observations_page(None, 1).await {
        error!(error = %e.message, "cannot reach the Observation custom resource at startup");
        std::process::exit(1);
    }

    let filter = Arc::new(FilterEngine::new());
    let deduper = Arc::new(Deduper::new());
    let pipeline = Arc::new(Pipeline::new(store.clone(), filter.clone(), deduper));
    let webhook_registry: Arc<DashMap<String, Arc<WebhookRoute>>> = Arc::new(DashMap::new());

    let legacy_filter = Arc::new(LegacyFilterWatcher::new(
        store.clone(),
        filter.clone(),
        config.filter_configmap_namespace.clone(),
        config.filter_configmap_name.clone(),
        config.filter_configmap_key.clone(),
    ));

    let (orchestrator, _drain_handle) = Orchestrator::new(
        store.clone(),
        pipeline,
        webhook_registry.clone(),
        Some(legacy_filter.clone()),
    );
    let orchestrator = Arc::new(orchestrator);

    let lease_backend: Arc<dyn LeaseBackend> = Arc::new(KubeLeaseBackend::new(client.clone(), &cli.namespace, LEASE_NAME));
    let (elector, mut leader_rx) = LeaderElector::new(lease_backend, identity.clone());
    let elector = Arc::new(elector);

    let ready = Arc::new(AtomicBool::new(false));
    let root_cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    tasks.push(tokio::spawn({
        let elector = elector.clone();
        let cancel = root_cancel.clone();
        async move { elector.run(cancel).await }
    }));

    tasks.push(tokio::spawn({
        let legacy_filter = legacy_filter.clone();
        let cancel = root_cancel.clone();
        async move { legacy_filter.run(cancel).await }
    }));

    // Trusted-proxy CIDRs for `X-Forwarded-For` reuse the same
    // IP-CIDR-shaped `WEBHOOK_ALLOWED_IPS` knob rather than adding a
    // second env var; see DESIGN.md.
    let http_state = Arc::new(HttpState::new(
        webhook_registry.clone(),
        ready.clone(),
        config.webhook_allowed_ips.clone(),
        prometheus_handle,
    ));
    let http_addr: SocketAddr = config.http_addr.parse().unwrap_or_else(|_| {
        warn!(addr = %config.http_addr, "invalid HTTP_ADDR; falling back to default");
        http::DEFAULT_ADDR.parse().expect("default HTTP address is valid")
    });
    tasks.push(tokio::spawn({
        let cancel = root_cancel.clone();
        let enable_pprof = config.enable_pprof;
        async move {
            if let Err(e) = http::serve(http_addr, http_state, enable_pprof, cancel).await {
                error!(error = %e, "http server exited with error");
            }
        }
    }));

    // Exclusive components: only the leader runs the
    // Ingester informer, the reconciler it feeds, and the GC sweep.
    tasks.push(tokio::spawn({
        let store = store.clone();
        let orchestrator = orchestrator.clone();
        let root_cancel = root_cancel.clone();
        let gc_interval = config.gc_interval;
        let gc_timeout = config.gc_timeout;
        async move {
            let mut current: Option<CancellationToken> = None;
            loop {
                tokio::select! {
                    _ = root_cancel.cancelled() => {
                        if let Some(c) = current.take() {
                            c.cancel();
                        }
                        break;
                    }
                    changed = leader_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let is_leader = *leader_rx.borrow_and_update();
                        if is_leader {
                            info!("acquired leadership; starting exclusive components");
                            let cancel = CancellationToken::new();
                            let gc = GarbageCollector::new(store.clone(), gc_interval, gc_timeout);
                            tokio::spawn(ingester_watch::run(store.clone(), orchestrator.clone(), cancel.clone()));
                            tokio::spawn(async move { gc.run(cancel.clone()).await });
                            current = Some(cancel);
                        } else if let Some(c) = current.take() {
                            info!("lost leadership; stopping exclusive components");
                            c.cancel();
                        }
                    }
                }
            }
        }
    }));

    ready.store(true, Ordering::Relaxed);
    info!(identity = %identity, namespace = %cli.namespace, "zen-watcher started");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install shutdown signal handler");
    }
    info!("shutdown signal received; draining");
    root_cancel.cancel();

    for task in tasks {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(30), task).await;
    }
}
