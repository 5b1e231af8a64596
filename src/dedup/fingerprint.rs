//! Stable content fingerprint over the canonicalized subset of event fields
//!: source, category, severity, eventType, resource.kind,
//! resource.name, resource.namespace, and a fixed set of "selected" details
//! keys that tend to identify the same underlying finding across repeats
//! (the keys a scanner or runtime tool reuses when it re-reports the same
//! condition). This selection is a modeling decision, recorded in
//! DESIGN.md.

use sha2::{Digest, Sha256};

use crate::event::Event;

/// Details keys considered part of an event's identity for fingerprinting.
/// Anything else (timestamps, pod names that churn, free-form messages) is
/// deliberately excluded so that re-reports of the same condition collapse
/// to the same fingerprint.
const SELECTED_DETAIL_KEYS: &[&str] = &[
    "rule",
    "vulnerabilityID",
    "cve",
    "checkID",
    "ruleID",
    "policy",
    "signature",
];

pub type Fingerprint = [u8; 32];

/// Computes the 256-bit content fingerprint for `event`.
pub fn fingerprint(event: &Event) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(event.source.as_bytes());
    hasher.update([0u8]);
    hasher.update(event.category.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(event.severity.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(event.event_type.as_bytes());
    hasher.update([0u8]);
    if let Some(r) = &event.resource {
        hasher.update(r.kind.as_deref().unwrap_or("").as_bytes());
        hasher.update([0u8]);
        hasher.update(r.name.as_deref().unwrap_or("").as_bytes());
        hasher.update([0u8]);
        hasher.update(r.namespace.as_deref().unwrap_or("").as_bytes());
        hasher.update([0u8]);
    }
    for key in SELECTED_DETAIL_KEYS {
        if let Some(value) = event.details.get(*key) {
            hasher.update(key.as_bytes());
            hasher.update([b'='; 1]);
            hasher.update(value.to_string().as_bytes());
            hasher.update([0u8]);
        }
    }
    hasher.finalize().into()
}

/// Computes a fingerprint over an explicit set of dotted `details` paths
/// (the `key` dedup strategy's `dedup.fields`).
pub fn key_fingerprint(event: &Event, fields: &[String]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(event.source.as_bytes());
    hasher.update([0u8]);
    for field in fields {
        let value = event.details_path(field).map(|v| v.to_string()).unwrap_or_default();
        hasher.update(field.as_bytes());
        hasher.update([b'=']);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Category, ResourceRef, Severity};
    use std::collections::BTreeMap;

    fn base_event() -> Event {
        Event {
            source: "trivy".into(),
            category: Category::Security,
            severity: Severity::High,
            event_type: "vuln".into(),
            resource: Some(ResourceRef {
                kind: Some("Pod".into()),
                name: Some("web-1".into()),
                namespace: Some("prod".into()),
                ..Default::default()
            }),
            details: BTreeMap::from([("cve".to_string(), serde_json::json!("CVE-2024-1"))]),
            namespace: Some("prod".into()),
            detected_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn identical_shape_produces_identical_fingerprint() {
        let a = base_event();
        let mut b = base_event();
        b.detected_at = chrono::Utc::now() - chrono::Duration::seconds(100);
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn differing_cve_produces_different_fingerprint() {
        let a = base_event();
        let mut b = base_event();
        b.details.insert("cve".to_string(), serde_json::json!("CVE-2024-2"));
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn key_fingerprint_depends_only_on_named_fields() {
        let a = base_event();
        let mut b = base_event();
        b.details.insert("cve".to_string(), serde_json::json!("CVE-2024-9999"));
        let fields = vec!["rule".to_string()];
        assert_eq!(key_fingerprint(&a, &fields), key_fingerprint(&b, &fields));
    }
}
