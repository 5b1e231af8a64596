//! Informer adapter: watches one GVR and turns `Apply`/`Delete` events into
//! pipeline events.
//!
//! Changes are queued through a small per-key de-duplicating work queue
//! rather than handed to the pipeline inline from the watch task: a
//! resync can replay hundreds of `Apply` events for objects that haven't
//! actually changed, and a slow pipeline (blocked on a store conflict
//! retry, say) must not make the watch task's internal buffer grow
//! without bound. The queue keeps at most one pending item per object key
//! and drops the oldest unrelated item when it is full: a slow consumer
//! loses old updates, never the newest one.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use kube::core::DynamicObject;
use kube::runtime::watcher;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api_types::ingester::InformerSpec;
use crate::error::reason;
use crate::event::{Category, Event, ResourceRef, Severity};
use crate::store::ClusterStore;

use super::{Adapter, AdapterError, EventSender};

const DEFAULT_QUEUE_CAPACITY: usize = 500;

#[derive(Clone)]
enum Change {
    Applied(DynamicObject),
    Deleted(DynamicObject),
}

struct WorkQueue {
    inner: Mutex<VecDeque<(String, Change)>>,
    capacity: usize,
    notify: Notify,
    source: String,
}

impl WorkQueue {
    fn new(capacity: usize, source: String) -> Self {
        WorkQueue {
            inner: Mutex::new(VecDeque::new()),
            capacity,
            notify: Notify::new(),
            source,
        }
    }

    fn push(&self, key: String, change: Change) {
        let mut guard = self.inner.lock().expect("work queue mutex poisoned");
        if let Some(pos) = guard.iter().position(|(k, _)| *k == key) {
            guard.remove(pos);
        }
        if guard.len() >= self.capacity {
            if let Some((dropped_key, _)) = guard.pop_front() {
                metrics::counter!("informer_events_dropped_total", "source" => self.source.clone(), "reason" => reason::QUEUE_FULL).increment(1);
                debug!(key = %dropped_key, "informer work queue full; dropped oldest pending item");
            }
        }
        guard.push_back((key, change));
        drop(guard);
        self.notify.notify_one();
    }

    async fn pop(&self) -> (String, Change) {
        loop {
            {
                let mut guard = self.inner.lock().expect("work queue mutex poisoned");
                if let Some(item) = guard.pop_front() {
                    return item;
                }
            }
            self.notify.notified().await;
        }
    }
}

pub struct InformerAdapter<S> {
    source: String,
    spec: InformerSpec,
    store: Arc<S>,
    /// Last resourceVersion processed per object key, so a resync's
    /// `Apply` replay of unchanged objects does not re-emit events.
    last_seen_version: DashMap<String, String>,
}

impl<S: ClusterStore> InformerAdapter<S> {
    pub fn new(source: String, spec: InformerSpec, store: Arc<S>) -> Self {
        InformerAdapter {
            source,
            spec,
            store,
            last_seen_version: DashMap::new(),
        }
    }

    fn object_key(obj: &DynamicObject) -> String {
        format!(
            "{}/{}",
            obj.metadata.namespace.as_deref().unwrap_or(""),
            obj.metadata.name.as_deref().unwrap_or("")
        )
    }

    fn to_event(&self, obj: &DynamicObject, deleted: bool) -> (Event, Value) {
        let kind = obj
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .unwrap_or_else(|| "Unknown".to_string());
        let api_version = obj.types.as_ref().map(|t| t.api_version.clone());
        let resource = ResourceRef {
            api_version,
            kind: Some(kind),
            name: obj.metadata.name.clone(),
            namespace: obj.metadata.namespace.clone(),
            uid: obj.metadata.uid.clone(),
        };
        let event_type = if deleted { "deleted" } else { "applied" };
        let raw = serde_json::to_value(obj).unwrap_or(Value::Null);
        let event = Event {
            source: self.source.clone(),
            category: Category::Operations,
            severity: Severity::Unknown,
            event_type: event_type.to_string(),
            resource: Some(resource),
            details: Default::default(),
            namespace: obj.metadata.namespace.clone(),
            detected_at: chrono::Utc::now(),
        };
        (event, raw)
    }
}

#[async_trait]
impl<S: ClusterStore + 'static> Adapter for InformerAdapter<S> {
    fn name(&self) -> &str {
        &self.source
    }

    async fn run(&self, cancel: CancellationToken, out: EventSender) -> Result<(), AdapterError> {
        let queue = Arc::new(WorkQueue::new(DEFAULT_QUEUE_CAPACITY, self.source.clone()));

        let mut stream = self.store.watch_dynamic(
            self.spec.gvr.clone(),
            self.spec.namespace.clone(),
            self.spec.label_selector.clone(),
        );

        let watch_queue = queue.clone();
        let watch_cancel = cancel.clone();
        let watch_source = self.source.clone();
        let watch_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = watch_cancel.cancelled() => break,
                    next = stream.next() => {
                        match next {
                            Some(Ok(watcher::Event::Applied(obj))) => {
                                let key = InformerAdapter::<S>::object_key(&obj);
                                queue_change(&watch_queue, key, Change::Applied(obj));
                            }
                            Some(Ok(watcher::Event::Deleted(obj))) => {
                                let key = InformerAdapter::<S>::object_key(&obj);
                                watch_queue.push(key, Change::Deleted(obj));
                            }
                            Some(Ok(watcher::Event::Restarted(objs))) => {
                                // A gap may have been missed; replay every
                                // currently-known object as an Apply so the
                                // resourceVersion dedup check below decides
                                // whether anything actually changed.
                                for obj in objs {
                                    let key = InformerAdapter::<S>::object_key(&obj);
                                    queue_change(&watch_queue, key, Change::Applied(obj));
                                }
                            }
                            Some(Err(e)) => {
                                warn!(source = %watch_source, error = %e, "informer watch stream error");
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                (key, change) = queue.pop() => {
                    let (event, raw, is_delete) = match change {
                        Change::Applied(obj) => {
                            let version = obj.metadata.resource_version.clone().unwrap_or_default();
                            if self.last_seen_version.get(&key).map(|v| *v == version).unwrap_or(false) {
                                continue;
                            }
                            self.last_seen_version.insert(key, version);
                            let (e, r) = self.to_event(&obj, false);
                            (e, r, false)
                        }
                        Change::Deleted(obj) => {
                            self.last_seen_version.remove(&key);
                            if !self.spec.emit_deletes {
                                continue;
                            }
                            let (e, r) = self.to_event(&obj, true);
                            (e, r, true)
                        }
                    };
                    debug!(source = %self.source, %key, is_delete, "informer emitting event");
                    if out.send((event, raw)).await.is_err() {
                        break;
                    }
                }
            }
        }

        watch_task.abort();
        let _ = tokio::time::timeout(Duration::from_secs(1), watch_task).await;
        Ok(())
    }
}

fn queue_change(queue: &Arc<WorkQueue>, key: String, change: Change) {
    queue.push(key, change);
}
