//! # strata-query
//!
//! Answers dashboard queries from the final artifacts the compactor writes.
//!
//! A time range resolves to files per date: the consolidated
//! `aggregated/{date}.parquet` when it exists, otherwise the hourly files
//! under `aggregated/{date}/`. Those rows are queried with `DataFusion` on a
//! memory-limited runtime.
//!
//! Dimension and annotation lookups take a fast path through the metadata
//! index (`aggregated/metadata.json`) unless the caller asks for a
//! time-filtered answer. Scans are cached for a short TTL.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use strata_core::StaticConfigProvider;
//! use strata_query::{AnalyticsRequest, QueryConfig, QueryService};
//!
//! # async fn example() -> strata_query::Result<()> {
//! let service = QueryService::new(
//!     QueryConfig::default(),
//!     Arc::new(StaticConfigProvider::new(0, "region")),
//! )?;
//! let now = chrono::Utc::now();
//! let rows = service
//!     .analytics(&AnalyticsRequest {
//!         time_from: now - chrono::Duration::hours(6),
//!         time_to: now,
//!         interval_ms: 60_000,
//!         ..AnalyticsRequest::default()
//!     })
//!     .await?;
//! println!("{} rows", rows.len());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod config;
pub mod error;
pub mod filters;
pub mod metrics;
pub mod request;
pub mod resolve;
pub mod service;
pub mod sql;

pub use config::QueryConfig;
pub use error::{QueryError, Result};
pub use request::{
    AnalyticsRequest, AnalyticsRow, DataStats, EventAnalysisRequest, EventAnalysisRow,
    EventTypeFilter, SqlResult, TimeRange,
};
pub use service::QueryService;
