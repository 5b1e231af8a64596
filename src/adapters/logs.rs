//! Logs adapter: polls for matching pods and tails their log streams,
//! turning regex matches into events.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api_types::ingester::{LogPattern, LogsSpec};
use crate::event::{Category, Event, ResourceRef};
use crate::normalize::PriorityBuckets;
use crate::store::{ClusterStore, LogLine};

use super::{Adapter, AdapterError, EventSender};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct CompiledPattern {
    regex: Regex,
    event_type: String,
    priority: f64,
}

pub struct LogsAdapter<S> {
    source: String,
    namespace: String,
    spec: LogsSpec,
    store: Arc<S>,
    patterns: Vec<CompiledPattern>,
    buckets: PriorityBuckets,
}

impl<S: ClusterStore> LogsAdapter<S> {
    pub fn new(source: String, namespace: String, spec: LogsSpec, store: Arc<S>, buckets: PriorityBuckets) -> Self {
        let patterns = spec
            .patterns
            .iter()
            .filter_map(|p: &LogPattern| match Regex::new(&p.regex) {
                Ok(regex) => Some(CompiledPattern {
                    regex,
                    event_type: p.event_type.clone(),
                    priority: p.priority,
                }),
                Err(e) => {
                    warn!(source = %source, pattern = %p.regex, error = %e, "invalid log pattern regex; skipping");
                    None
                }
            })
            .collect();
        LogsAdapter {
            source,
            namespace,
            spec,
            store,
            patterns,
            buckets,
        }
    }

    fn poll_interval(&self) -> Duration {
        self.spec
            .poll_interval
            .as_deref()
            .and_then(|s| humantime::parse_duration(s).ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL)
    }
}

#[async_trait]
impl<S: ClusterStore + 'static> Adapter for LogsAdapter<S> {
    fn name(&self) -> &str {
        &self.source
    }

    async fn run(&self, cancel: CancellationToken, out: EventSender) -> Result<(), AdapterError> {
        let mut tailing: HashSet<String> = HashSet::new();
        let mut poll = tokio::time::interval(self.poll_interval());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = poll.tick() => {
                    let pods = match self.store.list_pods(&self.namespace, &self.spec.pod_selector).await {
                        Ok(pods) => pods,
                        Err(e) => {
                            warn!(source = %self.source, error = %e.message, "failed to list pods for log adapter");
                            continue;
                        }
                    };
                    for pod in pods {
                        if tailing.insert(pod.clone()) {
                            self.spawn_tail(pod, cancel.clone(), out.clone());
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl<S: ClusterStore + 'static> LogsAdapter<S> {
    fn spawn_tail(&self, pod: String, cancel: CancellationToken, out: EventSender) {
        let store = self.store.clone();
        let namespace = self.namespace.clone();
        let container = self.spec.container.clone();
        let since_seconds = self.spec.since_seconds.unwrap_or(10);
        let source = self.source.clone();
        let patterns = self.patterns.clone();
        let buckets = self.buckets.clone();

        tokio::spawn(async move {
            let mut stream = store.log_stream(&namespace, &pod, container.as_deref(), since_seconds);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = stream.next() => {
                        match next {
                            Some(Ok(LogLine { line, .. })) => {
                                if let Some((event, raw)) = match_line(&patterns, &buckets, &source, &namespace, &pod, &line) {
                                    debug!(source = %source, pod = %pod, event_type = %event.event_type, "log pattern matched");
                                    if out.send((event, raw)).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                warn!(source = %source, pod = %pod, error = %e.message, "log stream error");
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
        });
    }
}

fn match_line(
    patterns: &[CompiledPattern],
    buckets: &PriorityBuckets,
    source: &str,
    namespace: &str,
    pod: &str,
    line: &str,
) -> Option<(Event, serde_json::Value)> {
    let pattern = patterns.iter().find(|p| p.regex.is_match(line))?;
    let mut details = BTreeMap::new();
    if let Some(captures) = pattern.regex.captures(line) {
        for name in pattern.regex.capture_names().flatten() {
            if let Some(m) = captures.name(name) {
                details.insert(name.to_string(), serde_json::Value::String(m.as_str().to_string()));
            }
        }
    }
    let event = Event {
        source: source.to_string(),
        category: Category::Operations,
        severity: buckets.severity_for(pattern.priority),
        event_type: pattern.event_type.clone(),
        resource: Some(ResourceRef {
            kind: Some("Pod".to_string()),
            name: Some(pod.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }),
        details,
        namespace: Some(namespace.to_string()),
        detected_at: chrono::Utc::now(),
    };
    Some((event, serde_json::json!({ "line": line })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_line_extracts_named_captures_into_details() {
        let patterns = vec![CompiledPattern {
            regex: Regex::new(r"user (?P<user>\w+) denied").unwrap(),
            event_type: "access_denied".to_string(),
            priority: 7.0,
        }];
        let buckets = PriorityBuckets::default();
        let (event, _) = match_line(&patterns, &buckets, "audit", "prod", "pod-1", "user alice denied").unwrap();
        assert_eq!(event.details.get("user").unwrap(), "alice");
        assert_eq!(event.event_type, "access_denied");
    }

    #[test]
    fn match_line_returns_none_when_no_pattern_matches() {
        let patterns = vec![CompiledPattern {
            regex: Regex::new(r"fail").unwrap(),
            event_type: "failure".to_string(),
            priority: 5.0,
        }];
        let buckets = PriorityBuckets::default();
        assert!(match_line(&patterns, &buckets, "audit", "prod", "pod-1", "all good").is_none());
    }
}
