//! Per-source list-based filter rules. The expression predicate is
//! compiled separately and held alongside these in
//! [`super::CompiledFilter`].

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::api_types::ingester::FilterSpec;
use crate::event::Severity;

static DYNAMIC_RULES_WARNED: AtomicBool = AtomicBool::new(false);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterRules {
    pub enabled: bool,
    pub include_severity: BTreeSet<String>,
    pub min_severity: Option<String>,
    pub include_types: BTreeSet<String>,
    pub exclude_types: BTreeSet<String>,
    pub include_namespaces: BTreeSet<String>,
    pub exclude_namespaces: BTreeSet<String>,
    pub include_kinds: BTreeSet<String>,
    pub exclude_kinds: BTreeSet<String>,
    pub include_categories: BTreeSet<String>,
    pub exclude_categories: BTreeSet<String>,
    pub exclude_rules: BTreeSet<String>,
}

impl FilterRules {
    pub fn from_spec(spec: &FilterSpec, enabled: bool) -> FilterRules {
        let mut exclude_kinds: BTreeSet<String> = spec.exclude_kinds.iter().cloned().collect();
        // ignoreKinds is merged into excludeKinds.
        exclude_kinds.extend(spec.ignore_kinds.iter().cloned());

        if !spec.dynamic_rules.is_empty() && !DYNAMIC_RULES_WARNED.swap(true, Ordering::Relaxed) {
            warn!("filter.dynamicRules is accepted and stored but not evaluated; rules will have no effect");
        }

        FilterRules {
            enabled,
            include_severity: spec.include_severity.iter().cloned().collect(),
            min_severity: spec.min_severity.clone(),
            include_types: spec.include_types.iter().cloned().collect(),
            exclude_types: spec.exclude_types.iter().cloned().collect(),
            include_namespaces: spec.include_namespaces.iter().cloned().collect(),
            exclude_namespaces: spec.exclude_namespaces.iter().cloned().collect(),
            include_kinds: spec.include_kinds.iter().cloned().collect(),
            exclude_kinds,
            include_categories: spec.include_categories.iter().cloned().collect(),
            exclude_categories: spec.exclude_categories.iter().cloned().collect(),
            exclude_rules: spec.exclude_rules.iter().cloned().collect(),
        }
    }

    pub fn min_severity_rank(&self) -> Option<u8> {
        self.min_severity.as_deref().map(|s| Severity::canonicalize(s).rank())
    }

    /// Merges `self` (an `Ingester`-derived rule set) with `other` (a
    /// ConfigMap-derived rule set) for the same source: exclude lists union,
    /// include lists intersect (empty = "no restriction", so an empty
    /// intersecting side wins only if the other side is also empty —
    /// intersecting with "no restriction" keeps the restrictive side),
    /// `minSeverity` takes the stricter (higher-ranked) of the two
    ///.
    pub fn union_with_configmap(&self, other: &FilterRules) -> FilterRules {
        let intersect_or_keep = |a: &BTreeSet<String>, b: &BTreeSet<String>| -> BTreeSet<String> {
            match (a.is_empty(), b.is_empty()) {
                (true, true) => BTreeSet::new(),
                (true, false) => b.clone(),
                (false, true) => a.clone(),
                (false, false) => a.intersection(b).cloned().collect(),
            }
        };

        let min_severity = match (self.min_severity_rank(), other.min_severity_rank()) {
            (Some(a), Some(b)) => {
                if a >= b {
                    self.min_severity.clone()
                } else {
                    other.min_severity.clone()
                }
            }
            (Some(_), None) => self.min_severity.clone(),
            (None, Some(_)) => other.min_severity.clone(),
            (None, None) => None,
        };

        FilterRules {
            enabled: self.enabled && other.enabled,
            include_severity: intersect_or_keep(&self.include_severity, &other.include_severity),
            min_severity,
            include_types: intersect_or_keep(&self.include_types, &other.include_types),
            exclude_types: self.exclude_types.union(&other.exclude_types).cloned().collect(),
            include_namespaces: intersect_or_keep(&self.include_namespaces, &other.include_namespaces),
            exclude_namespaces: self
                .exclude_namespaces
                .union(&other.exclude_namespaces)
                .cloned()
                .collect(),
            include_kinds: intersect_or_keep(&self.include_kinds, &other.include_kinds),
            exclude_kinds: self.exclude_kinds.union(&other.exclude_kinds).cloned().collect(),
            include_categories: intersect_or_keep(&self.include_categories, &other.include_categories),
            exclude_categories: self
                .exclude_categories
                .union(&other.exclude_categories)
                .cloned()
                .collect(),
            exclude_rules: self.exclude_rules.union(&other.exclude_rules).cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_kinds_merge_into_exclude_kinds() {
        let spec = FilterSpec {
            ignore_kinds: vec!["Secret".into()],
            exclude_kinds: vec!["ConfigMap".into()],
            ..Default::default()
        };
        let rules = FilterRules::from_spec(&spec, true);
        assert!(rules.exclude_kinds.contains("Secret"));
        assert!(rules.exclude_kinds.contains("ConfigMap"));
    }

    #[test]
    fn union_with_configmap_unions_excludes_and_intersects_includes() {
        let mut a = FilterRules::from_spec(&FilterSpec::default(), true);
        a.exclude_namespaces.insert("kube-system".into());
        a.include_types.insert("vuln".into());
        a.include_types.insert("misconfig".into());

        let mut b = FilterRules::from_spec(&FilterSpec::default(), true);
        b.exclude_namespaces.insert("monitoring".into());
        b.include_types.insert("vuln".into());

        let merged = a.union_with_configmap(&b);
        assert!(merged.exclude_namespaces.contains("kube-system"));
        assert!(merged.exclude_namespaces.contains("monitoring"));
        assert_eq!(merged.include_types.len(), 1);
        assert!(merged.include_types.contains("vuln"));
    }

    #[test]
    fn union_with_configmap_takes_stricter_min_severity() {
        let mut a = FilterRules::from_spec(&FilterSpec::default(), true);
        a.min_severity = Some("MEDIUM".into());
        let mut b = FilterRules::from_spec(&FilterSpec::default(), true);
        b.min_severity = Some("HIGH".into());
        let merged = a.union_with_configmap(&b);
        assert_eq!(merged.min_severity.as_deref(), Some("HIGH"));
    }
}
