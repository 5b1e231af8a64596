//! The stable metric-name contract. Call sites across the
//! pipeline and adapters record directly via the `metrics` macros with
//! these names; gathered here so the full contract is visible in one place
//! and so a renamed metric is a one-line change.

pub const OBSERVATIONS_CREATED_TOTAL: &str = "observations_created_total";
pub const OBSERVATIONS_FILTERED_TOTAL: &str = "observations_filtered_total";
pub const OBSERVATIONS_DEDUPED_TOTAL: &str = "observations_deduped_total";
pub const OBSERVATIONS_CREATE_ERRORS_TOTAL: &str = "observations_create_errors_total";
pub const WEBHOOK_EVENTS_DROPPED_TOTAL: &str = "webhook_events_dropped_total";
pub const INFORMER_EVENTS_DROPPED_TOTAL: &str = "informer_events_dropped_total";
pub const EVENT_PROCESSING_DURATION_SECONDS: &str = "event_processing_duration_seconds";
pub const DEDUP_EFFECTIVENESS: &str = "dedup_effectiveness";
pub const FILTER_PASS_RATE: &str = "filter_pass_rate";
pub const OBSERVATIONS_LIVE: &str = "observations_live";
pub const INFORMER_CACHE_SYNCED: &str = "informer_cache_synced";
pub const LEADER_STATUS: &str = "leader_status";
pub const GC_ERRORS_TOTAL: &str = "gc_errors_total";

/// Installs the Prometheus recorder, wrapped so `tracing` span fields
/// attach as metric labels. Returns the handle `/metrics` renders from.
pub fn install_recorder() -> metrics_exporter_prometheus::PrometheusHandle {
    use metrics_util::layer::Layer as _;

    let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    let layered = metrics_tracing_context::TracingContextLayer::all().layer(recorder);
    if metrics::set_global_recorder(layered).is_err() {
        tracing::warn!("metrics recorder already installed; skipping");
    }
    handle
}
