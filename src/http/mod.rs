//! The shared HTTP surface every pod runs: health,
//! readiness, Prometheus metrics, and every adapter-registered webhook path,
//! plus the legacy aliases kept for backward compatibility.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, OriginalUri, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::Router;
use dashmap::DashMap;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::adapters::webhook::{ip_in_cidr, WebhookRoute, MAX_BODY_BYTES};

pub const DEFAULT_ADDR: &str = "0.0.0.0:8080";

/// `POST /falco/webhook` and `POST /audit/webhook` are kept as aliases
/// pointing at the `/ingest/<source>` paths they replaced, both routing to
/// the same handler.
const LEGACY_ALIASES: &[(&str, &str)] = &[("/falco/webhook", "/ingest/falco"), ("/audit/webhook", "/ingest/k8s-audit")];

pub struct HttpState {
    webhook_registry: Arc<DashMap<String, Arc<WebhookRoute>>>,
    ready: Arc<AtomicBool>,
    trusted_proxies: Vec<String>,
    prometheus: PrometheusHandle,
    aliases: HashMap<&'static str, &'static str>,
}

impl HttpState {
    pub fn new(
        webhook_registry: Arc<DashMap<String, Arc<WebhookRoute>>>,
        ready: Arc<AtomicBool>,
        trusted_proxies: Vec<String>,
        prometheus: PrometheusHandle,
    ) -> Self {
        HttpState {
            webhook_registry,
            ready,
            trusted_proxies,
            prometheus,
            aliases: LEGACY_ALIASES.iter().copied().collect(),
        }
    }

    fn canonical_path<'a>(&self, path: &'a str) -> &'a str {
        self.aliases.get(path).copied().unwrap_or(path)
    }

    /// Only trusts `X-Forwarded-For` when `peer` itself is a configured
    /// trusted proxy; an empty allowlist means the header is never trusted
    ///.
    fn resolve_peer_ip(&self, peer: IpAddr, headers: &HeaderMap) -> IpAddr {
        if !self.trusted_proxies.iter().any(|cidr| ip_in_cidr(peer, cidr)) {
            return peer;
        }
        headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse().ok())
            .unwrap_or(peer)
    }
}

pub fn build_router(state: Arc<HttpState>, enable_pprof: bool) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics));

    if enable_pprof {
        router = router.route("/debug/pprof/*profile", get(pprof_stub));
    }

    router
        .fallback(any(webhook_dispatch))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds and serves until `cancel` fires, then stops accepting new
/// connections and drains in-flight requests for up to 30s.
pub async fn serve(addr: SocketAddr, state: Arc<HttpState>, enable_pprof: bool, cancel: CancellationToken) -> std::io::Result<()> {
    let app = build_router(state, enable_pprof);
    info!(%addr, "http surface starting");
    axum::Server::bind(&addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
}

async fn health() -> &'static str {
    "ok"
}

async fn ready(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    if state.ready.load(Ordering::Relaxed) {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    state.prometheus.render()
}

/// pprof is a Go-runtime facility with no equivalent profiler wired into
/// this build; the endpoint exists (gated by `ENABLE_PPROF`) so operators
/// get a clear signal rather than a generic 404.
async fn pprof_stub() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "profiling endpoints are not available in this build")
}

async fn webhook_dispatch(
    State(state): State<Arc<HttpState>>,
    OriginalUri(uri): OriginalUri,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let path = state.canonical_path(uri.path());
    let Some(route) = state.webhook_registry.get(path).map(|r| r.clone()) else {
        return (StatusCode::NOT_FOUND, "no webhook registered for this path".to_string());
    };
    let real_ip = state.resolve_peer_ip(peer.ip(), &headers);
    let (status, message) = route.handle(real_ip, &headers, &body).await;
    (StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR), message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_handle() -> PrometheusHandle {
        metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder().handle()
    }

    #[test]
    fn canonical_path_rewrites_legacy_aliases_only() {
        let state = HttpState::new(Arc::new(DashMap::new()), Arc::new(AtomicBool::new(false)), Vec::new(), test_handle());
        assert_eq!(state.canonical_path("/falco/webhook"), "/ingest/falco");
        assert_eq!(state.canonical_path("/audit/webhook"), "/ingest/k8s-audit");
        assert_eq!(state.canonical_path("/ingest/trivy"), "/ingest/trivy");
    }

    #[test]
    fn forwarded_for_is_ignored_unless_peer_is_a_trusted_proxy() {
        let state = HttpState::new(Arc::new(DashMap::new()), Arc::new(AtomicBool::new(false)), vec!["10.0.0.0/8".to_string()], test_handle());
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.5".parse().unwrap());

        let untrusted_peer: IpAddr = "192.168.1.1".parse().unwrap();
        assert_eq!(state.resolve_peer_ip(untrusted_peer, &headers), untrusted_peer);

        let trusted_peer: IpAddr = "10.1.2.3".parse().unwrap();
        assert_eq!(state.resolve_peer_ip(trusted_peer, &headers), "203.0.113.5".parse::<IpAddr>().unwrap());
    }
}
