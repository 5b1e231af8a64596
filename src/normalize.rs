//! Severity/category/type canonicalization and field mapping.
//! Always the last transform before dedup/create; idempotent by
//! construction since every step re-derives its output from a canonical
//! form rather than accumulating state.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use crate::api_types::ingester::{FieldMapping, NormalizationSpec};
use crate::event::{pascal_case_kind, Category, Event, ResourceRef, Severity};

/// Per-source severity bucket thresholds derived from
/// `Ingester.normalization.priority` (token -> float), used by the log
/// adapter and by any source that reports a numeric priority instead of a
/// severity token: severity is derived from the priority float via bucketed
/// thresholds.
#[derive(Clone, Debug, Default)]
pub struct PriorityBuckets(BTreeMap<String, f64>);

impl PriorityBuckets {
    pub fn new(map: BTreeMap<String, f64>) -> Self {
        PriorityBuckets(map)
    }

    /// Default buckets when a source declares no custom priority mapping:
    /// >= 9.0 critical, >= 7.0 high, >= 4.0 medium, >= 1.0 low, else unknown.
    pub fn severity_for(&self, value: f64) -> Severity {
        if let Some((token, _)) = self
            .0
            .iter()
            .filter(|(_, threshold)| value >= **threshold)
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        {
            return Severity::canonicalize(token);
        }
        if value >= 9.0 {
            Severity::Critical
        } else if value >= 7.0 {
            Severity::High
        } else if value >= 4.0 {
            Severity::Medium
        } else if value >= 1.0 {
            Severity::Low
        } else {
            Severity::Unknown
        }
    }
}

/// Normalizes event_type into a lower/snake token (`Runtime-Threat` ->
/// `runtime_threat`).
pub fn normalize_event_type(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        if c.is_whitespace() || c == '-' {
            out.push('_');
        } else {
            out.extend(c.to_lowercase());
        }
    }
    out
}

/// Applies the full normalization pass to one event in place: severity,
/// category, event type, resource kind, and `Ingester`-declared field
/// mappings. Mapping errors are logged and normalization continues with
/// whatever succeeded.
pub fn normalize(event: &mut Event, spec: &NormalizationSpec, raw_payload: &Value) {
    // Severity is already a canonical Severity enum value by the time an
    // Event reaches here in most adapters; this path exists for sources
    // that populate severity from a raw string found in `raw_payload`
    // rather than constructing the enum directly (e.g. webhook adapter).
    event.event_type = normalize_event_type(&event.event_type);

    if let Some(resource) = event.resource.as_mut() {
        normalize_resource_kind(resource);
    }

    apply_field_mappings(event, &spec.field_mapping, raw_payload);
}

fn apply_field_mappings(event: &mut Event, mappings: &[FieldMapping], raw_payload: &Value) {
    for mapping in mappings {
        match get_path(raw_payload, &mapping.from) {
            Some(value) => set_details_path(&mut event.details, &mapping.to, value.clone()),
            None => warn!(from = %mapping.from, to = %mapping.to, "field mapping source path missing; skipping"),
        }
    }
}

fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = value;
    for part in path.split('.') {
        cur = cur.as_object()?.get(part)?;
    }
    Some(cur)
}

/// Writes `value` at a dotted path under `details`, creating intermediate
/// object levels as needed.
fn set_details_path(details: &mut BTreeMap<String, Value>, path: &str, value: Value) {
    let parts: Vec<&str> = path.split('.').collect();
    if parts.len() == 1 {
        details.insert(parts[0].to_string(), value);
        return;
    }
    let mut cur = details
        .entry(parts[0].to_string())
        .or_insert_with(|| Value::Object(Default::default()));
    for part in &parts[1..parts.len() - 1] {
        if !cur.is_object() {
            *cur = Value::Object(Default::default());
        }
        cur = cur
            .as_object_mut()
            .unwrap()
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    if !cur.is_object() {
        *cur = Value::Object(Default::default());
    }
    cur.as_object_mut()
        .unwrap()
        .insert(parts[parts.len() - 1].to_string(), value);
}

/// Canonicalizes a category string, falling back to `Operations` (the
/// least-surprising default) when the source reports something outside the
/// enum — callers that need a hard failure instead should check
/// `Category::parse` directly before constructing the `Event`.
pub fn normalize_category(raw: &str) -> Category {
    Category::parse(raw).unwrap_or(Category::Operations)
}

pub fn normalize_resource_kind(resource: &mut ResourceRef) {
    if let Some(kind) = resource.kind.take() {
        resource.kind = Some(pascal_case_kind(&kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_normalizes_to_lower_snake() {
        assert_eq!(normalize_event_type("Runtime-Threat"), "runtime_threat");
        assert_eq!(normalize_event_type("SQL Injection"), "sql_injection");
        assert_eq!(normalize_event_type("already_snake"), "already_snake");
    }

    #[test]
    fn normalize_is_idempotent_on_event_type() {
        let once = normalize_event_type("Runtime-Threat");
        let twice = normalize_event_type(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn field_mapping_creates_nested_details_path() {
        let mut details = BTreeMap::new();
        set_details_path(&mut details, "container.image", Value::String("nginx".into()));
        assert_eq!(
            details.get("container").unwrap().get("image").unwrap(),
            &Value::String("nginx".into())
        );
    }

    #[test]
    fn priority_buckets_use_custom_thresholds_when_present() {
        let mut map = BTreeMap::new();
        map.insert("CRITICAL".to_string(), 8.0);
        map.insert("LOW".to_string(), 2.0);
        let buckets = PriorityBuckets::new(map);
        assert_eq!(buckets.severity_for(9.0), Severity::Critical);
        assert_eq!(buckets.severity_for(3.0), Severity::Low);
    }

    #[test]
    fn priority_buckets_fall_back_to_defaults_when_empty() {
        let buckets = PriorityBuckets::default();
        assert_eq!(buckets.severity_for(9.5), Severity::Critical);
        assert_eq!(buckets.severity_for(0.0), Severity::Unknown);
    }
}
