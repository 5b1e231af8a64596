//! The `Ingester` custom resource (group `zen.kube-zen.io/v1alpha1`).
//! Declares one event source and its processing policy; watched by the
//! orchestrator and reconciled into a live adapter.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "zen.kube-zen.io",
    version = "v1alpha1",
    kind = "Ingester",
    plural = "ingesters",
    namespaced,
    status = "IngesterStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct IngesterSpec {
    /// `^[a-z0-9-]+$`
    pub source: String,
    pub ingester: IngesterKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub informer: Option<InformerSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<LogsSpec>,
    #[serde(default)]
    pub normalization: NormalizationSpec,
    #[serde(default)]
    pub filter: FilterSpec,
    #[serde(default)]
    pub dedup: DedupSpec,
    #[serde(default)]
    pub processing: ProcessingSpec,
    #[serde(default)]
    pub ttl: TtlSpec,
    #[serde(default)]
    pub rate_limit: RateLimitSpec,
    #[serde(default)]
    pub destinations: Vec<DestinationSpec>,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum IngesterKind {
    Informer,
    Webhook,
    Logs,
    #[serde(rename = "k8s-events")]
    K8sEvents,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GroupVersionResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InformerSpec {
    pub gvr: GroupVersionResource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,
    /// Humantime duration string (e.g. `"5m"`), defaulted in config loading.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resync_period: Option<String>,
    /// Emit an event on `Delete` too, rather than dropping it.
    #[serde(default)]
    pub emit_deletes: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAuthSpec {
    #[serde(rename = "type")]
    pub auth_type: WebhookAuthType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum WebhookAuthType {
    None,
    Bearer,
    Basic,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSpec {
    pub path: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<WebhookAuthSpec>,
    /// CIDRs allowed to call this webhook; empty means unrestricted
    ///.
    #[serde(default)]
    pub ip_allowlist: Vec<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogPattern {
    pub regex: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Maps to a `Severity` via bucketed thresholds.
    pub priority: f64,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogsSpec {
    pub pod_selector: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    pub patterns: Vec<LogPattern>,
    #[serde(default)]
    pub since_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    pub from: String,
    pub to: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NormalizationSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    /// token -> priority float, merged into the global severity bucket map
    /// for this source.
    #[serde(default)]
    pub priority: BTreeMap<String, f64>,
    #[serde(default)]
    pub field_mapping: Vec<FieldMapping>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DynamicRule {
    /// JSONPath-based condition; parsed and stored but not evaluated
    ///.
    pub condition: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilterSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_priority: Option<f64>,
    #[serde(default)]
    pub include_namespaces: Vec<String>,
    #[serde(default)]
    pub exclude_namespaces: Vec<String>,
    #[serde(default)]
    pub include_types: Vec<String>,
    #[serde(default)]
    pub exclude_types: Vec<String>,
    #[serde(default)]
    pub include_kinds: Vec<String>,
    #[serde(default)]
    pub exclude_kinds: Vec<String>,
    #[serde(default)]
    pub include_severity: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_severity: Option<String>,
    #[serde(default)]
    pub exclude_rules: Vec<String>,
    #[serde(default)]
    pub include_categories: Vec<String>,
    #[serde(default)]
    pub exclude_categories: Vec<String>,
    #[serde(default)]
    pub ignore_kinds: Vec<String>,
    #[serde(default)]
    pub dynamic_rules: Vec<DynamicRule>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DedupStrategy {
    Fingerprint,
    Key,
    Hybrid,
}

impl Default for DedupStrategy {
    fn default() -> Self {
        DedupStrategy::Fingerprint
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DedupSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Humantime duration string, default `"60s"`.
    #[serde(default = "default_dedup_window")]
    pub window: String,
    #[serde(default)]
    pub strategy: DedupStrategy,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_events_per_window: Option<u32>,
}

fn default_dedup_window() -> String {
    "60s".to_string()
}

impl Default for DedupSpec {
    fn default() -> Self {
        DedupSpec {
            enabled: true,
            window: default_dedup_window(),
            strategy: DedupStrategy::default(),
            fields: Vec::new(),
            max_events_per_window: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingOrder {
    FilterFirst,
    DedupFirst,
}

impl Default for ProcessingOrder {
    fn default() -> Self {
        ProcessingOrder::FilterFirst
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingSpec {
    #[serde(default)]
    pub order: ProcessingOrder,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TtlSpec {
    pub default: i64,
    pub min: i64,
    pub max: i64,
}

impl Default for TtlSpec {
    fn default() -> Self {
        TtlSpec {
            default: 604_800,
            min: 60,
            max: 31_536_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSpec {
    pub max_per_minute: u32,
    pub burst: u32,
    /// Humantime duration string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_period: Option<String>,
}

impl Default for RateLimitSpec {
    fn default() -> Self {
        RateLimitSpec {
            max_per_minute: 600,
            burst: 60,
            cooldown_period: None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DestinationSpec {
    #[serde(rename = "type")]
    pub destination_type: String,
    pub value: String,
}

/// `status.observedGeneration` and a minimal condition list.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngesterStatus {
    #[serde(default)]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<IngesterCondition>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngesterCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Ingester {
    /// `{ingesterNamespace}/{ingesterName}/{source}`.
    pub fn identity(&self) -> String {
        format!(
            "{}/{}/{}",
            self.metadata.namespace.as_deref().unwrap_or("default"),
            self.metadata.name.as_deref().unwrap_or("unnamed"),
            self.spec.source
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_order_defaults_to_filter_first() {
        assert_eq!(ProcessingSpec::default().order, ProcessingOrder::FilterFirst);
    }

    #[test]
    fn dedup_spec_defaults_are_sane() {
        let d = DedupSpec::default();
        assert!(d.enabled);
        assert_eq!(d.window, "60s");
        assert_eq!(d.strategy, DedupStrategy::Fingerprint);
    }
}
