//! The `Observation` custom resource (group `zen.kube-zen.io`).

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::event::ResourceRef;

pub const MIN_TTL_SECONDS: i64 = 60;
pub const MAX_TTL_SECONDS: i64 = 31_536_000;

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ObservationResource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl From<ResourceRef> for ObservationResource {
    fn from(r: ResourceRef) -> Self {
        ObservationResource {
            api_version: r.api_version,
            kind: r.kind,
            name: r.name,
            namespace: r.namespace,
            uid: r.uid,
        }
    }
}

/// `spec.ttlSecondsAfterCreation`, `spec.source`, ... — the persisted,
/// normalized mirror of an `Event`.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "zen.kube-zen.io",
    version = "v1",
    kind = "Observation",
    plural = "observations",
    namespaced,
    status = "ObservationStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ObservationSpec {
    pub source: String,
    pub category: String,
    pub severity: String,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<ObservationResource>,
    #[serde(default)]
    pub details: std::collections::BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_creation: Option<i64>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObservationStatus {
    #[serde(default)]
    pub processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_processed_at: Option<DateTime<Utc>>,
}

/// Clamps a requested TTL into `[min, max]` and then into the hard
/// `[MIN_TTL_SECONDS, MAX_TTL_SECONDS]` bound.
pub fn clamp_ttl(requested: i64, ingester_min: i64, ingester_max: i64) -> i64 {
    let lo = ingester_min.max(MIN_TTL_SECONDS);
    let hi = ingester_max.min(MAX_TTL_SECONDS).max(lo);
    requested.clamp(lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_ttl_respects_hard_bounds() {
        assert_eq!(clamp_ttl(10, 60, MAX_TTL_SECONDS), MIN_TTL_SECONDS);
        assert_eq!(clamp_ttl(i64::MAX, 60, MAX_TTL_SECONDS), MAX_TTL_SECONDS);
        assert_eq!(clamp_ttl(3600, 60, MAX_TTL_SECONDS), 3600);
    }

    #[test]
    fn clamp_ttl_respects_ingester_bounds_inside_hard_bounds() {
        assert_eq!(clamp_ttl(100, 300, 600), 300);
        assert_eq!(clamp_ttl(10_000, 300, 600), 600);
    }
}
