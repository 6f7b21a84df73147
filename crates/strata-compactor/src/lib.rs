//! # strata-compactor
//!
//! Turns raw telemetry partitions into queryable aggregates.
//!
//! Raw events and annotations land under `events/{date}/{hour}/` and
//! `annotations/{date}/{hour}/`, partitioned by creation time. The compactor
//! rewrites them in two stages:
//!
//! - **Stage 1** keeps the DID and buckets by 5 minutes of event time, so late
//!   annotations can still be joined (`preagg/{date}/{hour}.parquet`).
//! - **Stage 2** drops the DID and partitions by event hour
//!   (`aggregated/{date}/{hour}.parquet`).
//!
//! Once an hour is older than the archive threshold its raw inputs are
//! deleted, and once a whole date is, its hourly artifacts are rolled into
//! `aggregated/{date}.parquet` with 1-hour buckets.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use strata_compactor::{Compactor, CompactorConfig};
//! use strata_core::StaticConfigProvider;
//!
//! let compactor = Compactor::new(
//!     CompactorConfig::default(),
//!     Arc::new(StaticConfigProvider::new(30, "")),
//! );
//! if let Some(report) = compactor.run(chrono::Utc::now()) {
//!     println!("compacted {} hours", report.hours_compacted);
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod age_off;
pub mod aggregate;
pub mod archivist;
pub mod compactor;
pub mod config;
pub mod date_meta;
pub mod ingest;
pub mod metadata_builder;
pub mod metrics;
pub mod scanner;

pub use age_off::AgeOffReport;
pub use compactor::{CompactionReport, Compactor};
pub use config::CompactorConfig;
pub use date_meta::{DirtyReason, DirtyTracker};
