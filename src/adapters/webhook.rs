//! Webhook adapter: registers a dynamic HTTP route that decodes POSTed
//! JSON into an `Event`. The route itself is served by the
//! shared HTTP server (`crate::http`); this module owns the per-source
//! state that server looks up by path, and the teardown that happens when
//! the owning `Ingester` is deleted or restarted.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::{Quota, RateLimiter};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api_types::ingester::{WebhookAuthSpec, WebhookAuthType, WebhookSpec};
use crate::error::reason;
use crate::event::{Category, Event, Severity};
use crate::store::ClusterStore;

use super::{Adapter, AdapterError, EventSender};

pub const MAX_BODY_BYTES: usize = 1024 * 1024;
const DEFAULT_CHANNEL_DEPTH: usize = 100;
const PER_IP_BURST: u32 = 20;
const PER_IP_PER_MINUTE: u32 = 120;

/// What the HTTP server needs to handle one POST to a webhook path.
pub struct WebhookRoute {
    pub source: String,
    pub auth: Option<(WebhookAuthType, BTreeMap<String, Vec<u8>>)>,
    pub ip_allowlist: Vec<String>,
    sender: EventSender,
    per_ip_limiters: DashMap<IpAddr, Arc<RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, DefaultClock>>>,
}

impl WebhookRoute {
    /// Applies IP allowlist, per-IP rate limit, and auth, then decodes and
    /// enqueues the payload. Returns an HTTP status code plus a short body,
    /// matching the disposition the axum handler should return verbatim.
    pub async fn handle(&self, peer: IpAddr, headers: &http::HeaderMap, body: &[u8]) -> (u16, &'static str) {
        if body.len() > MAX_BODY_BYTES {
            return (413, "payload too large");
        }

        if let Some((auth_type, secret)) = &self.auth {
            if !check_auth(*auth_type, secret, headers) {
                return (401, "unauthorized");
            }
        }

        if !self.ip_allowlist.is_empty() && !self.ip_allowlist.iter().any(|cidr| ip_in_cidr(peer, cidr)) {
            return (403, "forbidden");
        }

        if !self.rate_limit_ok(peer) {
            metrics::counter!("webhook_events_dropped_total", "source" => self.source.clone(), "reason" => reason::RATE_LIMIT).increment(1);
            return (429, "rate limited");
        }

        let raw: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(_) => return (400, "invalid json"),
        };

        let event = event_from_payload(&self.source, &raw);
        match self.sender.try_send((event, raw)) {
            Ok(()) => (202, "accepted"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!("webhook_events_dropped_total", "source" => self.source.clone(), "reason" => reason::QUEUE_FULL).increment(1);
                (503, "busy")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => (503, "shutting down"),
        }
    }

    fn rate_limit_ok(&self, peer: IpAddr) -> bool {
        let limiter = self
            .per_ip_limiters
            .entry(peer)
            .or_insert_with(|| {
                let quota = Quota::per_minute(NonZeroU32::new(PER_IP_PER_MINUTE).unwrap())
                    .allow_burst(NonZeroU32::new(PER_IP_BURST).unwrap());
                Arc::new(RateLimiter::direct(quota))
            })
            .clone();
        limiter.check().is_ok()
    }
}

fn check_auth(auth_type: WebhookAuthType, secret: &BTreeMap<String, Vec<u8>>, headers: &http::HeaderMap) -> bool {
    match auth_type {
        WebhookAuthType::None => true,
        WebhookAuthType::Bearer => {
            let Some(expected) = secret.get("token") else { return false };
            let Some(header) = headers.get(http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
                return false;
            };
            header.strip_prefix("Bearer ").map(|t| t.as_bytes() == expected.as_slice()).unwrap_or(false)
        }
        WebhookAuthType::Basic => {
            let (Some(user), Some(pass)) = (secret.get("username"), secret.get("password")) else {
                return false;
            };
            let Some(header) = headers.get(http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
                return false;
            };
            let Some(encoded) = header.strip_prefix("Basic ") else { return false };
            use base64::Engine;
            let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
                return false;
            };
            let expected = format!(
                "{}:{}",
                String::from_utf8_lossy(user),
                String::from_utf8_lossy(pass)
            );
            decoded == expected.into_bytes()
        }
    }
}

/// Best-effort extraction of severity/category/event type from a webhook
/// body. Ingesters can still reshape `details` further via
/// `normalization.fieldMapping`; this only gives the pipeline enough to
/// filter and dedup sensibly out of the box for common shapes (Falco's
/// `rule`/`priority`/`output_fields`, a generic `severity`/`category`).
fn event_from_payload(source: &str, raw: &Value) -> Event {
    let severity_raw = raw
        .get("priority")
        .or_else(|| raw.get("severity"))
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN");
    let category_raw = raw.get("category").and_then(Value::as_str).unwrap_or("operations");
    let event_type = raw
        .get("rule")
        .and_then(Value::as_str)
        .or_else(|| raw.get("event_type").and_then(Value::as_str))
        .unwrap_or("webhook_event")
        .to_string();

    let mut details = BTreeMap::new();
    if let Some(rule) = raw.get("rule").and_then(Value::as_str) {
        details.insert("rule".to_string(), Value::String(rule.to_string()));
    }

    let namespace = raw
        .get("output_fields")
        .and_then(|f| f.get("k8s.ns.name"))
        .and_then(Value::as_str)
        .map(String::from);

    Event {
        source: source.to_string(),
        category: Category::parse(category_raw).unwrap_or(Category::Operations),
        severity: Severity::canonicalize(severity_raw),
        event_type,
        resource: None,
        details,
        namespace,
        detected_at: chrono::Utc::now(),
    }
}

/// Checks `ip` against a single CIDR (IPv4 or IPv6; no partial-octet
/// surprises since both sides are parsed as full addresses first).
pub(crate) fn ip_in_cidr(ip: IpAddr, cidr: &str) -> bool {
    let Some((base, prefix)) = cidr.split_once('/') else {
        return cidr.parse::<IpAddr>().map(|c| c == ip).unwrap_or(false);
    };
    let Ok(base): Result<IpAddr, _> = base.parse() else {
        return false;
    };
    let Ok(prefix_len): Result<u32, _> = prefix.parse() else {
        return false;
    };
    match (ip, base) {
        (IpAddr::V4(ip), IpAddr::V4(base)) => {
            let mask = if prefix_len == 0 { 0 } else { u32::MAX << (32 - prefix_len.min(32)) };
            (u32::from(ip) & mask) == (u32::from(base) & mask)
        }
        (IpAddr::V6(ip), IpAddr::V6(base)) => {
            let mask = if prefix_len == 0 { 0 } else { u128::MAX << (128 - prefix_len.min(128)) };
            (u128::from(ip) & mask) == (u128::from(base) & mask)
        }
        _ => false,
    }
}

pub struct WebhookAdapter<S> {
    source: String,
    namespace: String,
    spec: WebhookSpec,
    store: Arc<S>,
    registry: Arc<DashMap<String, Arc<WebhookRoute>>>,
}

impl<S: ClusterStore> WebhookAdapter<S> {
    pub fn new(
        source: String,
        namespace: String,
        spec: WebhookSpec,
        store: Arc<S>,
        registry: Arc<DashMap<String, Arc<WebhookRoute>>>,
    ) -> Self {
        WebhookAdapter {
            source,
            namespace,
            spec,
            store,
            registry,
        }
    }

    async fn load_auth(&self, namespace: &str) -> Option<(WebhookAuthType, BTreeMap<String, Vec<u8>>)> {
        let auth_spec: &WebhookAuthSpec = self.spec.auth.as_ref()?;
        if auth_spec.auth_type == WebhookAuthType::None {
            return Some((WebhookAuthType::None, BTreeMap::new()));
        }
        let secret_name = auth_spec.secret_name.as_deref()?;
        match self.store.get_secret(namespace, secret_name).await {
            Ok(data) => Some((auth_spec.auth_type, data)),
            Err(e) => {
                warn!(source = %self.source, error = %e.message, "failed to load webhook auth secret");
                None
            }
        }
    }
}

#[async_trait]
impl<S: ClusterStore + 'static> Adapter for WebhookAdapter<S> {
    fn name(&self) -> &str {
        &self.source
    }

    async fn run(&self, cancel: CancellationToken, out: EventSender) -> Result<(), AdapterError> {
        let auth = self.load_auth(&self.namespace).await;
        let depth = self.spec.buffer_size.unwrap_or(DEFAULT_CHANNEL_DEPTH).clamp(1, 200);
        let (tx, mut rx) = mpsc::channel(depth);

        let route = Arc::new(WebhookRoute {
            source: self.source.clone(),
            auth,
            ip_allowlist: self.spec.ip_allowlist.clone(),
            sender: tx,
            per_ip_limiters: DashMap::new(),
        });
        self.registry.insert(self.spec.path.clone(), route);
        info!(source = %self.source, path = %self.spec.path, "webhook route registered");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                item = rx.recv() => {
                    match item {
                        Some((event, raw)) => {
                            if out.send((event, raw)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        self.registry.remove(&self.spec.path);
        info!(source = %self.source, path = %self.spec.path, "webhook route unregistered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_in_cidr_matches_v4_prefix() {
        let ip: IpAddr = "10.0.5.9".parse().unwrap();
        assert!(ip_in_cidr(ip, "10.0.0.0/16"));
        assert!(!ip_in_cidr(ip, "10.1.0.0/16"));
    }

    #[test]
    fn ip_in_cidr_matches_exact_address_without_prefix() {
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        assert!(ip_in_cidr(ip, "192.168.1.1"));
        assert!(!ip_in_cidr(ip, "192.168.1.2"));
    }

    #[test]
    fn event_from_payload_reads_falco_shape() {
        let raw = serde_json::json!({
            "rule": "Terminal shell in container",
            "priority": "Critical",
            "output_fields": { "k8s.ns.name": "prod" }
        });
        let event = event_from_payload("falco", &raw);
        assert_eq!(event.severity, Severity::Critical);
        assert_eq!(event.event_type, "Terminal shell in container");
        assert_eq!(event.namespace.as_deref(), Some("prod"));
    }
}
