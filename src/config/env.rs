//! Process-wide configuration loaded from environment variables. Every
//! variable is optional; an unset or unparseable value falls back to its
//! documented default rather than failing startup.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub api_group: String,
    pub dedup_window: Duration,
    pub dedup_max_size: usize,
    pub dedup_max_rate_per_source: Option<u32>,
    pub dedup_rate_burst: Option<u32>,
    pub observation_ttl_seconds: i64,
    pub gc_interval: Duration,
    pub gc_timeout: Duration,
    pub watch_namespace: Option<String>,
    pub filter_configmap_name: String,
    pub filter_configmap_namespace: String,
    pub filter_configmap_key: String,
    pub webhook_auth_disabled: bool,
    pub webhook_auth_token: Option<String>,
    pub webhook_allowed_ips: Vec<String>,
    pub server_max_request_bytes: usize,
    pub enable_pprof: bool,
    pub log_level: String,
    pub http_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            api_group: "zen.kube-zen.io".to_string(),
            dedup_window: Duration::from_secs(60),
            dedup_max_size: 10_000,
            dedup_max_rate_per_source: None,
            dedup_rate_burst: None,
            observation_ttl_seconds: 604_800,
            gc_interval: Duration::from_secs(3600),
            gc_timeout: Duration::from_secs(300),
            watch_namespace: None,
            filter_configmap_name: "zen-watcher-filter".to_string(),
            filter_configmap_namespace: "zen-system".to_string(),
            filter_configmap_key: "filter.json".to_string(),
            webhook_auth_disabled: false,
            webhook_auth_token: None,
            webhook_allowed_ips: Vec::new(),
            server_max_request_bytes: 1_048_576,
            enable_pprof: false,
            log_level: "INFO".to_string(),
            http_addr: crate::http::DEFAULT_ADDR.to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let defaults = RuntimeConfig::default();

        // `OBSERVATION_TTL_DAYS` is checked first since it's the coarser,
        // more operator-friendly knob; `OBSERVATION_TTL_SECONDS` wins if
        // both are set.
        let observation_ttl_seconds = parsed("OBSERVATION_TTL_DAYS")
            .map(|days: i64| days * 86_400)
            .or_else(|| parsed("OBSERVATION_TTL_SECONDS"))
            .unwrap_or(defaults.observation_ttl_seconds);

        RuntimeConfig {
            api_group: env_string("ZEN_API_GROUP", defaults.api_group),
            dedup_window: duration_seconds("DEDUP_WINDOW_SECONDS", defaults.dedup_window),
            dedup_max_size: parsed("DEDUP_MAX_SIZE").unwrap_or(defaults.dedup_max_size),
            dedup_max_rate_per_source: parsed("DEDUP_MAX_RATE_PER_SOURCE"),
            dedup_rate_burst: parsed("DEDUP_RATE_BURST"),
            observation_ttl_seconds,
            gc_interval: duration_seconds("GC_INTERVAL", defaults.gc_interval),
            gc_timeout: duration_seconds("GC_TIMEOUT", defaults.gc_timeout),
            watch_namespace: env::var("WATCH_NAMESPACE").ok().filter(|s| !s.is_empty()),
            filter_configmap_name: env_string("FILTER_CONFIGMAP_NAME", defaults.filter_configmap_name),
            filter_configmap_namespace: env_string("FILTER_CONFIGMAP_NAMESPACE", defaults.filter_configmap_namespace),
            filter_configmap_key: env_string("FILTER_CONFIGMAP_KEY", defaults.filter_configmap_key),
            webhook_auth_disabled: parsed("WEBHOOK_AUTH_DISABLED").unwrap_or(defaults.webhook_auth_disabled),
            webhook_auth_token: env::var("WEBHOOK_AUTH_TOKEN").ok(),
            webhook_allowed_ips: env::var("WEBHOOK_ALLOWED_IPS")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
            server_max_request_bytes: parsed("SERVER_MAX_REQUEST_BYTES").unwrap_or(defaults.server_max_request_bytes),
            enable_pprof: parsed("ENABLE_PPROF").unwrap_or(defaults.enable_pprof),
            log_level: env_string("LOG_LEVEL", defaults.log_level),
            http_addr: env_string("HTTP_ADDR", defaults.http_addr),
        }
    }
}

fn env_string(name: &str, default: String) -> String {
    env::var(name).unwrap_or(default)
}

fn parsed<T: FromStr>(name: &str) -> Option<T> {
    match env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(var = name, value = %raw, "failed to parse environment variable; using default");
                None
            }
        },
        Err(_) => None,
    }
}

fn duration_seconds(name: &str, default: Duration) -> Duration {
    parsed::<u64>(name).map(Duration::from_secs).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let defaults = RuntimeConfig::default();
        assert_eq!(defaults.dedup_window, Duration::from_secs(60));
        assert_eq!(defaults.dedup_max_size, 10_000);
        assert_eq!(defaults.observation_ttl_seconds, 604_800);
        assert_eq!(defaults.gc_interval, Duration::from_secs(3600));
        assert_eq!(defaults.gc_timeout, Duration::from_secs(300));
        assert_eq!(defaults.server_max_request_bytes, 1_048_576);
        assert!(!defaults.enable_pprof);
    }

    #[test]
    fn parsed_falls_back_to_none_on_garbage_input() {
        std::env::set_var("ZEN_TEST_GARBAGE_INT", "not-a-number");
        assert_eq!(parsed::<u32>("ZEN_TEST_GARBAGE_INT"), None);
        std::env::remove_var("ZEN_TEST_GARBAGE_INT");
    }
}
