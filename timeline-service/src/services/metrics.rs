use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use service_core::error::AppError;
use std::sync::OnceLock;
use std::time::Duration;

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder behind the `metrics` facade. Safe to call
/// more than once; later calls are no-ops.
pub fn init_metrics() -> Result<(), AppError> {
    if METRICS_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        AppError::InternalError(anyhow::anyhow!(
            "failed to install Prometheus recorder: {}",
            e
        ))
    })?;

    // A concurrent initialiser may have won the race; its handle is equivalent.
    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string())
}

pub fn record_ingestion_run(outcome: &'static str, duration: Duration) {
    metrics::counter!("ingestion_runs_total", "outcome" => outcome).increment(1);
    metrics::histogram!("ingestion_run_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_upserts(collection: &'static str, count: usize) {
    metrics::counter!("ingestion_records_upserted_total", "collection" => collection)
        .increment(count as u64);
}

pub fn record_timeline_build(outcome: &'static str, entries: usize) {
    metrics::counter!("timeline_builds_total", "outcome" => outcome).increment(1);
    if outcome == "success" {
        metrics::histogram!("timeline_entries_returned").record(entries as f64);
    }
}
