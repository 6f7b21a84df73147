//! # strata-compactor
//!
//! Compaction service for strata telemetry analytics.
//!
//! ## Modes
//!
//! - **Service Mode**: periodic compaction with HTTP health endpoints
//! - **CLI Mode**: one-shot compaction or age-off for debugging or recovery
//!
//! ## Health Endpoints
//!
//! - `GET /health` - Shallow liveness check (always 200)
//! - `GET /ready` - Readiness check with compaction health status
//! - `GET /metrics` - Prometheus metrics
//! - `POST /compact` - Trigger a compaction run
//!
//! ## Usage
//!
//! ```bash
//! # Run as service (default port 8081)
//! strata-compactor --data-dir /data/analytics serve
//!
//! # Single pass
//! strata-compactor --data-dir /data/analytics compact
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;

use strata_compactor::{CompactionReport, Compactor, CompactorConfig, metrics};
use strata_core::config::{ConfigProvider, FileConfigProvider, StaticConfigProvider};
use strata_core::observability::{LogFormat, init_logging};

// ============================================================================
// CLI Arguments
// ============================================================================

/// Strata analytics compactor.
#[derive(Debug, Parser)]
#[command(name = "strata-compactor")]
#[command(about = "Compacts raw telemetry partitions into queryable aggregates")]
#[command(version)]
struct Args {
    /// Root of the analytics data directory.
    #[arg(long, env = "STRATA_DATA_DIR", default_value = "/data/analytics", global = true)]
    data_dir: PathBuf,

    /// Hours after which partitions are archived.
    #[arg(long, env = "STRATA_ARCHIVE_THRESHOLD_HOURS", default_value = "72", global = true)]
    archive_threshold_hours: u64,

    /// JSON settings file providing `ageOffDays` and `groupAnnotationKey`.
    #[arg(long, env = "STRATA_CONFIG_FILE", global = true)]
    config_file: Option<PathBuf>,

    /// Log output format (`json` or `pretty`).
    #[arg(long, env = "STRATA_LOG_FORMAT", default_value = "json", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run as a service with health endpoints.
    Serve {
        /// HTTP port for health endpoints.
        #[arg(long, env = "STRATA_COMPACTOR_PORT", default_value = "8081")]
        port: u16,

        /// Compaction interval in seconds.
        #[arg(long, env = "STRATA_COMPACTOR_INTERVAL_SECS", default_value = "60")]
        interval_secs: u64,

        /// Maximum time without successful compaction before unhealthy (seconds).
        #[arg(
            long,
            env = "STRATA_COMPACTOR_UNHEALTHY_THRESHOLD_SECS",
            default_value = "300"
        )]
        unhealthy_threshold_secs: u64,
    },

    /// Run a single compaction pass.
    Compact,

    /// Run only the age-off sweep.
    AgeOff,
}

impl Args {
    fn compactor_config(&self, check_interval_secs: u64) -> Result<CompactorConfig> {
        let config = CompactorConfig {
            data_dir: self.data_dir.clone(),
            archive_threshold_hours: self.archive_threshold_hours,
            check_interval_secs,
            ..CompactorConfig::default()
        };
        if let Some(message) = config.validate() {
            return Err(anyhow!("invalid configuration: {message}"));
        }
        Ok(config)
    }

    fn config_provider(&self) -> Arc<dyn ConfigProvider> {
        match &self.config_file {
            Some(path) => Arc::new(FileConfigProvider::new(path)),
            None => Arc::new(StaticConfigProvider::new(0, "")),
        }
    }
}

// ============================================================================
// Health State
// ============================================================================

/// Shared state for tracking compaction health.
#[derive(Debug)]
struct CompactorState {
    /// Whether the service is ready to accept work.
    ready: AtomicBool,
    /// Unix timestamp of last successful compaction.
    last_successful_compaction_ts: AtomicU64,
    /// Total successful compaction runs.
    successful_compactions: AtomicU64,
    /// Total failed compaction runs.
    failed_compactions: AtomicU64,
    /// Hours that failed in the most recent run.
    last_run_failed_hours: AtomicU64,
    /// Whether a compaction run is currently active.
    compaction_in_progress: AtomicBool,
    /// Threshold (seconds) before marking unhealthy.
    unhealthy_threshold_secs: u64,
}

impl CompactorState {
    fn new(unhealthy_threshold_secs: u64) -> Self {
        Self {
            ready: AtomicBool::new(false),
            last_successful_compaction_ts: AtomicU64::new(0),
            successful_compactions: AtomicU64::new(0),
            failed_compactions: AtomicU64::new(0),
            last_run_failed_hours: AtomicU64::new(0),
            compaction_in_progress: AtomicBool::new(false),
            unhealthy_threshold_secs,
        }
    }

    fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    fn record_success(&self, report: &CompactionReport) {
        let now: u64 = Utc::now().timestamp().try_into().unwrap_or_default();
        self.last_successful_compaction_ts
            .store(now, Ordering::Release);
        self.successful_compactions.fetch_add(1, Ordering::Relaxed);
        self.last_run_failed_hours
            .store(report.hours_failed, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failed_compactions.fetch_add(1, Ordering::Relaxed);
    }

    fn is_healthy(&self) -> bool {
        if !self.ready.load(Ordering::Acquire) {
            return false;
        }
        if self.successful_compactions.load(Ordering::Acquire) == 0 {
            return false;
        }
        let last = self.last_successful_compaction_ts.load(Ordering::Acquire);
        if last == 0 {
            return false;
        }
        let now: u64 = Utc::now().timestamp().try_into().unwrap_or_default();
        now.saturating_sub(last) < self.unhealthy_threshold_secs
    }

    fn last_successful_compaction(&self) -> Option<DateTime<Utc>> {
        let ts = self.last_successful_compaction_ts.load(Ordering::Acquire);
        if ts == 0 {
            None
        } else {
            DateTime::from_timestamp(i64::try_from(ts).ok()?, 0)
        }
    }
}

/// Shared state for HTTP handlers.
#[derive(Clone)]
struct ServiceState {
    health: Arc<CompactorState>,
    compactor: Arc<Compactor>,
}

// ============================================================================
// Health Endpoints
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Debug, Serialize)]
struct ReadyResponse {
    ready: bool,
    healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_successful_compaction: Option<String>,
    successful_compactions: u64,
    failed_compactions: u64,
    last_run_failed_hours: u64,
    compaction_in_progress: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

/// GET /health - Shallow liveness check.
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// GET /ready - Readiness check with compaction health.
async fn ready(State(state): State<Arc<ServiceState>>) -> impl IntoResponse {
    let health = &state.health;
    let ready = health.ready.load(Ordering::Acquire);
    let healthy = health.is_healthy();
    let successful_compactions = health.successful_compactions.load(Ordering::Relaxed);

    let message = if !ready {
        Some("Service starting up".to_string())
    } else if successful_compactions == 0 {
        Some("Waiting for first successful compaction".to_string())
    } else if !healthy {
        Some(format!(
            "No successful compaction in {} seconds",
            health.unhealthy_threshold_secs
        ))
    } else {
        None
    };

    let status = if ready && healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            ready,
            healthy,
            last_successful_compaction: health.last_successful_compaction().map(|dt| dt.to_rfc3339()),
            successful_compactions,
            failed_compactions: health.failed_compactions.load(Ordering::Relaxed),
            last_run_failed_hours: health.last_run_failed_hours.load(Ordering::Relaxed),
            compaction_in_progress: health.compaction_in_progress.load(Ordering::Acquire),
            message,
        }),
    )
}

/// POST /compact - Trigger a compaction run on demand.
///
/// Returns:
/// - `202 Accepted` if a new run was started
/// - `409 Conflict` if a run is already in progress
async fn compact(State(state): State<Arc<ServiceState>>) -> impl IntoResponse {
    if state.compactor.is_running()
        || state
            .health
            .compaction_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
    {
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "status": "already_running",
                "message": "Compaction is already in progress"
            })),
        );
    }

    let state = Arc::clone(&state);
    tokio::spawn(async move {
        run_compaction_guarded(&state).await;
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "status": "started",
            "message": "Compaction triggered"
        })),
    )
}

// ============================================================================
// Compaction Loop
// ============================================================================

/// Runs the compaction loop in service mode.
async fn run_compaction_loop(state: Arc<ServiceState>, interval: Duration) {
    let mut interval_timer = tokio::time::interval(interval);
    interval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    // The first tick completes immediately.
    interval_timer.tick().await;
    state.health.mark_ready();
    tracing::info!("Compactor ready, starting compaction loop");

    run_compaction_guarded(&state).await;

    loop {
        interval_timer.tick().await;
        tracing::debug!("Starting compaction run");
        run_compaction_guarded(&state).await;
    }
}

async fn run_compaction_guarded(state: &Arc<ServiceState>) {
    state
        .health
        .compaction_in_progress
        .store(true, Ordering::Release);

    let compactor = Arc::clone(&state.compactor);
    match tokio::task::spawn_blocking(move || compactor.run(Utc::now())).await {
        Ok(Some(report)) => {
            state.health.record_success(&report);
            if report.has_errors() {
                tracing::warn!(errors = ?report.errors, "Compaction run completed with errors");
            }
        }
        Ok(None) => tracing::debug!("Compaction already running, trigger dropped"),
        Err(e) => {
            state.health.record_failure();
            tracing::error!(error = %e, "Compaction run panicked");
        }
    }

    state
        .health
        .compaction_in_progress
        .store(false, Ordering::Release);
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    match &args.command {
        &Commands::Serve {
            port,
            interval_secs,
            unhealthy_threshold_secs,
        } => {
            let config = args.compactor_config(interval_secs)?;
            metrics::init_metrics();

            tracing::info!(
                port = port,
                interval_secs = interval_secs,
                unhealthy_threshold_secs = unhealthy_threshold_secs,
                data_dir = %config.data_dir.display(),
                archive_threshold_hours = config.archive_threshold_hours,
                "Starting compactor service"
            );

            let interval = config.check_interval();
            let compactor = Arc::new(Compactor::new(config, args.config_provider()));
            let state = Arc::new(ServiceState {
                health: Arc::new(CompactorState::new(unhealthy_threshold_secs)),
                compactor,
            });

            let router = Router::new()
                .route("/health", get(health))
                .route("/ready", get(ready))
                .route("/metrics", get(metrics::serve_metrics))
                .route("/compact", post(compact))
                .with_state(Arc::clone(&state));

            let loop_state = Arc::clone(&state);
            tokio::spawn(async move {
                run_compaction_loop(loop_state, interval).await;
            });

            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            tracing::info!(address = %addr, "Starting health server");
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, router).await?;
        }

        Commands::Compact => {
            let config = args.compactor_config(CompactorConfig::default().check_interval_secs)?;
            tracing::info!(data_dir = %config.data_dir.display(), "Starting manual compaction");
            let compactor = Arc::new(Compactor::new(config, args.config_provider()));
            let report = tokio::task::spawn_blocking(move || compactor.run(Utc::now()))
                .await?
                .ok_or_else(|| anyhow!("compaction already running"))?;
            tracing::info!(
                hours_compacted = report.hours_compacted,
                hours_failed = report.hours_failed,
                dates_consolidated = report.dates_consolidated,
                "Compaction complete"
            );
            if report.has_errors() {
                return Err(anyhow!("compaction finished with {} errors", report.errors.len()));
            }
        }

        Commands::AgeOff => {
            let config = args.compactor_config(CompactorConfig::default().check_interval_secs)?;
            let compactor = Compactor::new(config, args.config_provider());
            let report = compactor.age_off(Utc::now());
            tracing::info!(
                cutoff = ?report.cutoff,
                removed = report.removed.len(),
                errors = report.errors.len(),
                "Age-off complete"
            );
        }
    }

    Ok(())
}
