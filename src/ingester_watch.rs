//! Watches `Ingester` resources cluster-wide and feeds every change to the
//! [`Orchestrator`]. Only the leader runs this informer and the reconciler
//! it feeds; started and stopped by the coordination module as leadership
//! is gained and lost.

use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::orchestrator::Orchestrator;
use crate::store::ClusterStore;

/// Runs until `cancel` fires or the watch stream ends. Errors from the
/// underlying watch are logged and the stream continues (the `kube`
/// watcher already retries with backoff internally).
pub async fn run<S: ClusterStore + 'static>(store: Arc<S>, orchestrator: Arc<Orchestrator<S>>, cancel: CancellationToken) {
    info!("ingester informer starting");
    let mut stream = store.watch_ingesters();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("ingester informer stopping");
                break;
            }
            next = stream.next() => {
                match next {
                    Some(Ok(watcher::Event::Applied(ingester))) => {
                        debug!(ingester = %ingester.identity(), "ingester applied");
                        orchestrator.reconcile(ingester).await;
                    }
                    Some(Ok(watcher::Event::Deleted(ingester))) => {
                        debug!(ingester = %ingester.identity(), "ingester deleted");
                        orchestrator.handle_delete(&ingester).await;
                    }
                    Some(Ok(watcher::Event::Restarted(ingesters))) => {
                        info!(count = ingesters.len(), "ingester informer resynced");
                        for ingester in ingesters {
                            orchestrator.reconcile(ingester).await;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "ingester watch stream error");
                    }
                    None => {
                        warn!("ingester watch stream ended; stopping informer");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::webhook::WebhookRoute;
    use crate::dedup::Deduper;
    use crate::filter::FilterEngine;
    use crate::pipeline::Pipeline;
    use crate::store::fake::FakeStore;
    use dashmap::DashMap;

    #[tokio::test]
    async fn stops_promptly_on_cancellation() {
        let store = Arc::new(FakeStore::default());
        let filter = Arc::new(FilterEngine::new());
        let deduper = Arc::new(Deduper::new());
        let pipeline = Arc::new(Pipeline::new(store.clone(), filter, deduper));
        let registry: Arc<DashMap<String, Arc<WebhookRoute>>> = Arc::new(DashMap::new());
        let (orchestrator, _drain) = Orchestrator::new(store.clone(), pipeline, registry, None);
        let orchestrator = Arc::new(orchestrator);

        // FakeStore's watch_ingesters is an empty stream, so this returns as
        // soon as the cancellation (or stream end, whichever the select
        // picks) is observed — exercising that `run` terminates instead of
        // looping forever.
        let cancel = CancellationToken::new();
        cancel.cancel();
        run(store, orchestrator, cancel).await;
    }
}
