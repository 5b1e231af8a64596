//! Per-source rule evaluation with live reload.
//!
//! The engine holds an atomic pointer ([`arc_swap::ArcSwap`]) to the current
//! per-source configuration snapshot. Reloaders swap pointers; in-flight
//! evaluations complete against their own snapshot, and an invalid config
//! never replaces the current one.

pub mod expr;
pub mod rules;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::error::reason;
use crate::event::{Category, Event, Severity};
pub use rules::FilterRules;

/// A source's rule set plus its (possibly absent, possibly unparseable)
/// compiled expression.
#[derive(Clone, Debug, Default)]
pub struct CompiledFilter {
    pub rules: FilterRules,
    pub expression_source: Option<String>,
    pub expression: Option<expr::Expr>,
}

impl CompiledFilter {
    pub fn new(rules: FilterRules, expression_source: Option<String>) -> (Self, Option<expr::ParseError>) {
        let (expression, error) = match expression_source.as_deref() {
            Some(raw) => match expr::parse(raw) {
                Ok(e) => (Some(e), None),
                Err(e) => (None, Some(e)),
            },
            None => (None, None),
        };
        (
            CompiledFilter {
                rules,
                expression_source,
                expression,
            },
            error,
        )
    }
}

pub type FilterSnapshot = HashMap<String, CompiledFilter>;

pub struct FilterEngine {
    snapshot: ArcSwap<FilterSnapshot>,
    generation: AtomicU64,
    /// source -> last generation a parse error was logged for, so reload
    /// noise is capped at "once per config generation".
    logged_parse_errors: DashMap<String, u64>,
}

impl Default for FilterEngine {
    fn default() -> Self {
        FilterEngine::new()
    }
}

impl FilterEngine {
    pub fn new() -> Self {
        FilterEngine {
            snapshot: ArcSwap::from_pointee(FilterSnapshot::new()),
            generation: AtomicU64::new(0),
            logged_parse_errors: DashMap::new(),
        }
    }

    /// Swaps in a new snapshot. The caller (config loader) is responsible
    /// for deciding a snapshot is valid before calling this — an individual
    /// source's unparseable expression does not invalidate the whole
    /// snapshot, it just degrades that source to list-only rules.
    pub fn reload(&self, new_snapshot: FilterSnapshot) {
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        for (source, filter) in &new_snapshot {
            if filter.expression_source.is_some() && filter.expression.is_none() {
                let mut should_log = true;
                if let Some(last) = self.logged_parse_errors.get(source) {
                    if *last == gen {
                        should_log = false;
                    }
                }
                if should_log {
                    tracing::warn!(source, generation = gen, "filter expression failed to parse; falling back to list rules");
                    self.logged_parse_errors.insert(source.clone(), gen);
                }
            }
        }
        self.snapshot.store(std::sync::Arc::new(new_snapshot));
    }

    /// Evaluates the ordered filter steps against the engine's current
    /// snapshot. Returns `(allowed, reason)`; `reason` is only meaningful
    /// when `allowed` is `false`.
    pub fn allow(&self, event: &Event) -> (bool, &'static str) {
        let snapshot = self.snapshot.load();
        let Some(filter) = snapshot.get(&event.source) else {
            // No configuration for this source at all: default-allow, there
            // is nothing to filter against.
            return (true, "");
        };
        let rules = &filter.rules;

        if !rules.enabled {
            return (false, reason::SOURCE_DISABLED);
        }

        // Step 2: severity inclusion takes precedence over minSeverity.
        if !rules.include_severity.is_empty() {
            if !rules.include_severity.contains(event.severity.as_str()) {
                return (false, reason::SEVERITY);
            }
        } else if let Some(min_rank) = rules.min_severity_rank() {
            if event.severity.rank() < min_rank {
                return (false, reason::SEVERITY);
            }
        }

        // Step 3: event type include/exclude.
        if !rules.include_types.is_empty() && !rules.include_types.contains(&event.event_type) {
            return (false, reason::EVENT_TYPE);
        }
        if rules.exclude_types.contains(&event.event_type) {
            return (false, reason::EVENT_TYPE);
        }

        // Step 4: namespace include/exclude.
        if let Some(ns) = event.effective_namespace() {
            if !rules.include_namespaces.is_empty() && !rules.include_namespaces.contains(ns) {
                return (false, reason::NAMESPACE);
            }
            if rules.exclude_namespaces.contains(ns) {
                return (false, reason::NAMESPACE);
            }
        }

        // Step 5: kind include/exclude (ignoreKinds already merged in).
        if let Some(kind) = event.resource.as_ref().and_then(|r| r.kind.as_deref()) {
            if !rules.include_kinds.is_empty() && !rules.include_kinds.contains(kind) {
                return (false, reason::KIND);
            }
            if rules.exclude_kinds.contains(kind) {
                return (false, reason::KIND);
            }
        }

        // Step 6: category include/exclude.
        let category = event.category.as_str();
        if !rules.include_categories.is_empty() && !rules.include_categories.contains(category) {
            return (false, reason::CATEGORY);
        }
        if rules.exclude_categories.contains(category) {
            return (false, reason::CATEGORY);
        }

        // Step 7: rule include/exclude (details.rule).
        if let Some(rule) = event.rule() {
            if rules.exclude_rules.contains(rule) {
                return (false, reason::RULE);
            }
        }

        // Step 8: expression predicate, if present and parseable. A runtime
        // Indeterminate result falls through to the list-based decision,
        // which by this point is "allow".
        if let Some(compiled) = &filter.expression {
            match expr::eval(compiled, event) {
                expr::EvalOutcome::True => {}
                expr::EvalOutcome::False => return (false, reason::EXPRESSION),
                expr::EvalOutcome::Indeterminate => {}
            }
        }

        (true, "")
    }
}

/// Severity and category enum membership, used by the config loader to
/// validate an `Ingester.filter` before it is merged into a snapshot.
pub fn is_valid_severity_token(token: &str) -> bool {
    !matches!(Severity::canonicalize(token), Severity::Unknown) || token.eq_ignore_ascii_case("UNKNOWN")
}

pub fn is_valid_category_token(token: &str) -> bool {
    Category::parse(token).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_types::ingester::FilterSpec;
    use crate::event::ResourceRef;
    use std::collections::BTreeMap;

    fn event(severity: Severity, namespace: &str, source: &str) -> Event {
        Event {
            source: source.into(),
            category: Category::Security,
            severity,
            event_type: "runtime_threat".into(),
            resource: Some(ResourceRef::default().with_kind("pod")),
            details: BTreeMap::new(),
            namespace: Some(namespace.to_string()),
            detected_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn severity_ordering_property() {
        let engine = FilterEngine::new();
        let mut snapshot = FilterSnapshot::new();
        let spec = FilterSpec {
            min_severity: Some("HIGH".into()),
            ..Default::default()
        };
        let (compiled, _) = CompiledFilter::new(FilterRules::from_spec(&spec, true), None);
        snapshot.insert("falco".into(), compiled);
        engine.reload(snapshot);

        let (allowed, _) = engine.allow(&event(Severity::Critical, "prod", "falco"));
        assert!(allowed);
        let (allowed, reason) = engine.allow(&event(Severity::Low, "prod", "falco"));
        assert!(!allowed);
        assert_eq!(reason, reason::SEVERITY);
    }

    #[test]
    fn include_severity_takes_precedence_over_min_severity() {
        let engine = FilterEngine::new();
        let mut snapshot = FilterSnapshot::new();
        let spec = FilterSpec {
            min_severity: Some("CRITICAL".into()),
            include_severity: vec!["LOW".into()],
            ..Default::default()
        };
        let (compiled, _) = CompiledFilter::new(FilterRules::from_spec(&spec, true), None);
        snapshot.insert("falco".into(), compiled);
        engine.reload(snapshot);

        // Would fail minSeverity=CRITICAL, but includeSeverity=[LOW] wins.
        let (allowed, _) = engine.allow(&event(Severity::Low, "prod", "falco"));
        assert!(allowed);
    }

    #[test]
    fn invalid_expression_falls_back_to_list_rules() {
        let engine = FilterEngine::new();
        let mut snapshot = FilterSnapshot::new();
        let spec = FilterSpec {
            min_severity: Some("HIGH".into()),
            expression: Some("spec.severity >=".into()),
            ..Default::default()
        };
        let (compiled, err) = CompiledFilter::new(FilterRules::from_spec(&spec, true), spec.expression.clone());
        assert!(err.is_some());
        assert!(compiled.expression.is_none());
        snapshot.insert("falco".into(), compiled);
        engine.reload(snapshot);

        let (allowed, _) = engine.allow(&event(Severity::Critical, "prod", "falco"));
        assert!(allowed);
        let (allowed, _) = engine.allow(&event(Severity::Low, "prod", "falco"));
        assert!(!allowed);
    }

    #[test]
    fn unconfigured_source_defaults_to_allow() {
        let engine = FilterEngine::new();
        let (allowed, _) = engine.allow(&event(Severity::Low, "prod", "unknown-source"));
        assert!(allowed);
    }
}
