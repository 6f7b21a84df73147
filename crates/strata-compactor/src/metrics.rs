//! Compactor metrics.
//!
//! Counters and histograms for compaction, archival and age-off. Recording
//! is a no-op until a recorder is installed (see [`init_metrics`]).

use std::sync::OnceLock;
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// ============================================================================
// Metric Names
// ============================================================================

/// Hours compacted successfully.
pub const HOURS_COMPACTED: &str = "strata_hours_compacted_total";

/// Hours examined and skipped as clean, or failed, by outcome.
pub const HOURS_SKIPPED: &str = "strata_hours_skipped_total";

/// Hours found dirty, by reason.
pub const HOURS_DIRTY: &str = "strata_hours_dirty_total";

/// Corrupt raw files removed.
pub const CORRUPT_FILES_REMOVED: &str = "strata_corrupt_files_removed_total";

/// Safe deletes aborted because a writer was active.
pub const SAFE_DELETE_ABORTS: &str = "strata_safe_delete_aborts_total";

/// Dates consolidated into daily artifacts.
pub const DAILY_CONSOLIDATIONS: &str = "strata_daily_consolidations_total";

/// Partitions removed by age-off, by category.
pub const AGE_OFF_DELETIONS: &str = "strata_age_off_deletions_total";

/// Compaction run duration in seconds.
pub const RUN_DURATION: &str = "strata_compaction_run_duration_seconds";

/// Unix timestamp of the last completed compaction run.
pub const LAST_RUN_TIMESTAMP: &str = "strata_compaction_last_run_timestamp_seconds";

// ============================================================================
// Registration
// ============================================================================

/// Registers all compactor metric descriptions.
///
/// Call this once at application startup after initializing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(HOURS_COMPACTED, "Total hours compacted");
    describe_counter!(HOURS_SKIPPED, "Total hours skipped, by outcome");
    describe_counter!(HOURS_DIRTY, "Total dirty hours detected, by reason");
    describe_counter!(CORRUPT_FILES_REMOVED, "Total corrupt raw files removed");
    describe_counter!(
        SAFE_DELETE_ABORTS,
        "Total directory deletions aborted due to in-flight writes"
    );
    describe_counter!(DAILY_CONSOLIDATIONS, "Total dates consolidated to daily artifacts");
    describe_counter!(AGE_OFF_DELETIONS, "Total partitions removed by age-off");
    describe_histogram!(RUN_DURATION, "Duration of compaction runs in seconds");
    describe_gauge!(LAST_RUN_TIMESTAMP, "Unix time of the last completed compaction run");
}

// ============================================================================
// Prometheus Recorder
// ============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global Prometheus recorder and registers descriptions.
///
/// Safe to call multiple times; subsequent calls are no-ops.
///
/// # Panics
///
/// Panics if the Prometheus recorder cannot be installed. The service should
/// not start without metrics.
#[allow(clippy::panic)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .unwrap_or_else(|e| panic!("failed to install prometheus recorder: {e}"));
            register_metrics();
            tracing::info!("Prometheus metrics recorder initialized for compactor");
            handle
        })
        .clone()
}

/// Handler for the `/metrics` endpoint.
pub async fn serve_metrics() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        ),
    }
}

// ============================================================================
// Recording
// ============================================================================

/// Records a dirty hour.
pub fn record_dirty_hour(reason: &'static str) {
    counter!(HOURS_DIRTY, "reason" => reason).increment(1);
}

/// Records a successfully compacted hour.
pub fn record_hour_compacted() {
    counter!(HOURS_COMPACTED).increment(1);
}

/// Records an hour that was not compacted (`clean`, `failed`, `no_data`).
pub fn record_hour_skipped(outcome: &'static str) {
    counter!(HOURS_SKIPPED, "outcome" => outcome).increment(1);
}

/// Records removed corrupt files.
pub fn record_corrupt_files_removed(count: u64) {
    if count > 0 {
        counter!(CORRUPT_FILES_REMOVED).increment(count);
    }
}

/// Records an aborted safe delete.
pub fn record_safe_delete_abort() {
    counter!(SAFE_DELETE_ABORTS).increment(1);
}

/// Records a daily consolidation.
pub fn record_daily_consolidation() {
    counter!(DAILY_CONSOLIDATIONS).increment(1);
}

/// Records an age-off deletion.
pub fn record_age_off_deletion(category: &'static str) {
    counter!(AGE_OFF_DELETIONS, "category" => category).increment(1);
}

/// RAII-style timer for a compaction run.
pub struct RunTimer {
    start: Instant,
}

impl RunTimer {
    /// Starts timing a run.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Stops the timer and records duration and completion time.
    pub fn finish(self) {
        histogram!(RUN_DURATION).record(self.start.elapsed().as_secs_f64());
        #[allow(clippy::cast_precision_loss)]
        let now = chrono::Utc::now().timestamp() as f64;
        gauge!(LAST_RUN_TIMESTAMP).set(now);
    }
}
