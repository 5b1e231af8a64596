//! Configuration loading: environment variables, and the
//! legacy filter ConfigMap merge. `Ingester` specs feed the
//! pipeline and the filter engine directly — see [`crate::pipeline::Pipeline::configure_source`]
//! and [`build_filter_snapshot`] below — rather than through an
//! intermediate record type, since the `Ingester` CR already carries
//! everything both need.

pub mod env;
pub mod legacy_filter;

use std::collections::BTreeMap;
use std::collections::BTreeSet;

pub use env::RuntimeConfig;
pub use legacy_filter::LegacyFilterWatcher;

use crate::api_types::ingester::FilterSpec;
use crate::api_types::Ingester;
use crate::filter::{CompiledFilter, FilterEngine, FilterRules, FilterSnapshot};

/// Builds a full filter snapshot from every known `Ingester`, merged with
/// legacy ConfigMap rules for sources that appear in both: matching sources
/// union their rules rather than one overriding the other outright. A
/// legacy entry with no matching `Ingester` still
/// gets a snapshot slot of its own, since a source can be filtered before
/// its `Ingester` migration lands.
pub fn build_filter_snapshot(ingesters: &[Ingester], legacy: &BTreeMap<String, FilterSpec>) -> FilterSnapshot {
    let mut snapshot = FilterSnapshot::new();
    let mut covered: BTreeSet<&str> = BTreeSet::new();

    for ingester in ingesters {
        let source = ingester.spec.source.as_str();
        let ingester_rules = FilterRules::from_spec(&ingester.spec.filter, ingester.spec.enabled);
        let rules = match legacy.get(source) {
            Some(legacy_spec) => ingester_rules.union_with_configmap(&FilterRules::from_spec(legacy_spec, true)),
            None => ingester_rules,
        };
        let (compiled, _) = CompiledFilter::new(rules, ingester.spec.filter.expression.clone());
        snapshot.insert(source.to_string(), compiled);
        covered.insert(source);
    }

    for (source, spec) in legacy {
        if covered.contains(source.as_str()) {
            continue;
        }
        let rules = FilterRules::from_spec(spec, true);
        let (compiled, _) = CompiledFilter::new(rules, spec.expression.clone());
        snapshot.insert(source.clone(), compiled);
    }

    snapshot
}

pub fn reload_filters(engine: &FilterEngine, ingesters: &[Ingester], legacy: &BTreeMap<String, FilterSpec>) {
    engine.reload(build_filter_snapshot(ingesters, legacy));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_types::ingester::{IngesterKind, IngesterSpec};
    use crate::event::{Category, Event, Severity};
    use kube::core::ObjectMeta;

    fn ingester(source: &str, filter: FilterSpec) -> Ingester {
        Ingester {
            metadata: ObjectMeta {
                name: Some(source.to_string()),
                namespace: Some("zen-system".to_string()),
                ..Default::default()
            },
            spec: IngesterSpec {
                source: source.to_string(),
                ingester: IngesterKind::Webhook,
                enabled: true,
                informer: None,
                webhook: None,
                logs: None,
                normalization: Default::default(),
                filter,
                dedup: Default::default(),
                processing: Default::default(),
                ttl: Default::default(),
                rate_limit: Default::default(),
                destinations: Vec::new(),
            },
            status: None,
        }
    }

    fn event(source: &str, severity: Severity, namespace: &str) -> Event {
        Event {
            source: source.to_string(),
            category: Category::Security,
            severity,
            event_type: "vuln".to_string(),
            resource: None,
            details: Default::default(),
            namespace: Some(namespace.to_string()),
            detected_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn ingester_without_legacy_entry_uses_its_own_rules_unmodified() {
        let ingesters = vec![ingester(
            "trivy",
            FilterSpec {
                min_severity: Some("HIGH".into()),
                ..Default::default()
            },
        )];
        let engine = FilterEngine::new();
        reload_filters(&engine, &ingesters, &BTreeMap::new());

        let (allowed, _) = engine.allow(&event("trivy", Severity::Critical, "prod"));
        assert!(allowed);
        let (allowed, _) = engine.allow(&event("trivy", Severity::Low, "prod"));
        assert!(!allowed);
    }

    #[test]
    fn legacy_rules_for_the_same_source_are_unioned_in() {
        let ingesters = vec![ingester(
            "trivy",
            FilterSpec {
                exclude_namespaces: vec!["kube-system".into()],
                ..Default::default()
            },
        )];
        let mut legacy = BTreeMap::new();
        legacy.insert(
            "trivy".to_string(),
            FilterSpec {
                exclude_namespaces: vec!["monitoring".into()],
                ..Default::default()
            },
        );
        let engine = FilterEngine::new();
        reload_filters(&engine, &ingesters, &legacy);

        let (allowed, _) = engine.allow(&event("trivy", Severity::Critical, "monitoring"));
        assert!(!allowed);
        let (allowed, _) = engine.allow(&event("trivy", Severity::Critical, "kube-system"));
        assert!(!allowed);
        let (allowed, _) = engine.allow(&event("trivy", Severity::Critical, "prod"));
        assert!(allowed);
    }

    #[test]
    fn legacy_only_source_still_gets_a_snapshot_entry() {
        let legacy_spec = FilterSpec {
            min_severity: Some("CRITICAL".into()),
            ..Default::default()
        };
        let mut legacy = BTreeMap::new();
        legacy.insert("falco-legacy".to_string(), legacy_spec);

        let engine = FilterEngine::new();
        reload_filters(&engine, &[], &legacy);

        let (allowed, _) = engine.allow(&event("falco-legacy", Severity::High, "prod"));
        assert!(!allowed);
        let (allowed, _) = engine.allow(&event("falco-legacy", Severity::Critical, "prod"));
        assert!(allowed);
    }
}
