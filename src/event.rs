//! The internal, ephemeral event record produced by adapters and consumed
//! exactly once by the observation pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical severity rank, highest first. Order here is the source of
/// truth for every `>`, `>=`, `minSeverity` comparison in the filter engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Unknown,
}

impl Severity {
    /// Rank used for ordering comparisons; higher is more severe.
    pub fn rank(self) -> u8 {
        match self {
            Severity::Critical => 4,
            Severity::High => 3,
            Severity::Medium => 2,
            Severity::Low => 1,
            Severity::Unknown => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
            Severity::Low => "LOW",
            Severity::Unknown => "UNKNOWN",
        }
    }

    /// Canonicalizes an arbitrary-case, free-form severity token. Unmappable
    /// input becomes `Unknown` rather than an error: severity is required but
    /// never blocks ingestion on a parse failure.
    pub fn canonicalize(raw: &str) -> Severity {
        match raw.trim().to_ascii_uppercase().as_str() {
            "CRITICAL" | "EMERGENCY" | "FATAL" | "PANIC" => Severity::Critical,
            "HIGH" | "ERROR" | "ALERT" => Severity::High,
            "MEDIUM" | "WARNING" | "WARN" | "NOTICE" => Severity::Medium,
            "LOW" | "INFO" | "INFORMATIONAL" | "DEBUG" => Severity::Low,
            _ => Severity::Unknown,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical event category enum.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Category {
    Security,
    Compliance,
    Performance,
    Operations,
    Cost,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Security => "security",
            Category::Compliance => "compliance",
            Category::Performance => "performance",
            Category::Operations => "operations",
            Category::Cost => "cost",
        }
    }

    /// Returns `None` for anything outside the fixed enum set; callers decide
    /// whether that is a hard failure (Observation creation) or a soft one
    /// (filter evaluation, where an unmappable category just never matches).
    pub fn parse(raw: &str) -> Option<Category> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "security" => Some(Category::Security),
            "compliance" => Some(Category::Compliance),
            "performance" => Some(Category::Performance),
            "operations" | "ops" => Some(Category::Operations),
            "cost" => Some(Category::Cost),
            _ => None,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to the Kubernetes resource an event is about, if any.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Canonicalized to PascalCase on construction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Preserved verbatim: downstream access-control decisions key off this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl ResourceRef {
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(pascal_case_kind(&kind.into()));
        self
    }
}

/// PascalCase-canonicalizes a resource kind token (`pod` -> `Pod`,
/// `persistent-volume-claim` -> `PersistentVolumeClaim`).
pub fn pascal_case_kind(raw: &str) -> String {
    if raw.chars().any(|c| c == '-' || c == '_') {
        raw.split(|c| c == '-' || c == '_')
            .filter(|s| !s.is_empty())
            .map(capitalize_first)
            .collect()
    } else if raw.chars().next().is_some_and(|c| c.is_lowercase()) {
        capitalize_first(raw)
    } else {
        raw.to_string()
    }
}

fn capitalize_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// The internal event record. Produced by exactly one adapter, consumed by
/// exactly one invocation of the observation pipeline, never retained.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    /// Canonical lower-case token, e.g. `trivy`, `falco`.
    pub source: String,
    pub category: Category,
    pub severity: Severity,
    /// Free-form lower/snake token, e.g. `runtime-threat` -> normalized to
    /// `runtime_threat` by the normalizer.
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceRef>,
    #[serde(default)]
    pub details: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub detected_at: DateTime<Utc>,
}

impl Event {
    /// The namespace used for namespace-scoped filter/access decisions:
    /// `event.namespace`, falling back to `event.resource.namespace`
    ///.
    pub fn effective_namespace(&self) -> Option<&str> {
        self.namespace
            .as_deref()
            .or_else(|| self.resource.as_ref().and_then(|r| r.namespace.as_deref()))
    }

    /// Reads `details.rule`, used by the rule include/exclude filter step.
    pub fn rule(&self) -> Option<&str> {
        self.details.get("rule").and_then(Value::as_str)
    }

    /// Looks up a dotted path under `details` (e.g. `vulnerabilityID`, or
    /// `container.image` for a nested map). Used by dedup `key` strategy and
    /// the expression language's `spec.details.*` leaves.
    pub fn details_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut cur = self.details.get(parts.next()?)?;
        for part in parts {
            cur = cur.as_object()?.get(part)?;
        }
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_rank_orders_critical_above_unknown() {
        assert!(Severity::Critical.rank() > Severity::High.rank());
        assert!(Severity::High.rank() > Severity::Medium.rank());
        assert!(Severity::Medium.rank() > Severity::Low.rank());
        assert!(Severity::Low.rank() > Severity::Unknown.rank());
    }

    #[test]
    fn severity_canonicalizes_mixed_case() {
        assert_eq!(Severity::canonicalize("High"), Severity::High);
        assert_eq!(Severity::canonicalize("eMERGENCY"), Severity::Critical);
        assert_eq!(Severity::canonicalize("bogus"), Severity::Unknown);
    }

    #[test]
    fn pascal_case_handles_hyphen_and_lowercase() {
        assert_eq!(pascal_case_kind("pod"), "Pod");
        assert_eq!(pascal_case_kind("persistent-volume-claim"), "PersistentVolumeClaim");
        assert_eq!(pascal_case_kind("Pod"), "Pod");
    }

    #[test]
    fn category_parse_rejects_unknown_tokens() {
        assert_eq!(Category::parse("security"), Some(Category::Security));
        assert_eq!(Category::parse("nonsense"), None);
    }
}
