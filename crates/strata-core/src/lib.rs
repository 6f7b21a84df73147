//! # strata-core
//!
//! Core primitives for the strata telemetry analytics pipeline.
//!
//! This crate provides the foundational types shared by the compactor and the
//! query planner:
//!
//! - **Records**: raw events and annotations, Stage-1 and Stage-2 aggregate rows
//! - **Partitioning**: creation-hour partition keys and event-time bucketing
//! - **Layout**: the on-disk directory contract (`events/`, `annotations/`,
//!   `preagg/`, `aggregated/`)
//! - **Codec**: Parquet encoding/decoding for every artifact kind
//! - **Ingestion**: the count/time triggered [`Buffer`] and the [`PartitionWriter`]
//! - **Error Types**: shared error definitions and result types
//!
//! ## Crate Boundary
//!
//! Everything that touches the on-disk format lives here so that the compactor
//! (writer side) and the query planner (reader side) cannot drift apart.
//!
//! ## Example
//!
//! ```rust
//! use strata_core::prelude::*;
//!
//! let key = PartitionKey::from_millis(1_735_725_780_000).unwrap();
//! assert_eq!(key.to_string(), "20250101/10");
//! assert_eq!(bucket_start(1_735_725_780_000, BUCKET_WIDTH_MS), 1_735_725_600_000);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod annotations;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod layout;
pub mod metadata;
pub mod observability;
pub mod partition;
pub mod record;
pub mod writer;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use strata_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::annotations::AnnotationMap;
    pub use crate::buffer::{Buffer, BufferConfig, FlushFn};
    pub use crate::config::{ConfigProvider, FileConfigProvider, StaticConfigProvider};
    pub use crate::error::{Error, Result};
    pub use crate::layout::{DataLayout, RawKind};
    pub use crate::metadata::MetadataIndex;
    pub use crate::partition::{BUCKET_WIDTH_MS, HOUR_MS, PartitionKey, bucket_start};
    pub use crate::record::{
        AggregatedRecord, Annotation, Dimensions, Event, EventType, Measures,
        PreAggregatedRecord,
    };
    pub use crate::writer::PartitionWriter;
}

// Re-export key types at crate root for ergonomics
pub use annotations::AnnotationMap;
pub use buffer::{Buffer, BufferConfig, FlushFn};
pub use config::{ConfigProvider, FileConfigProvider, StaticConfigProvider};
pub use error::{Error, Result};
pub use layout::{DataLayout, RawKind};
pub use metadata::MetadataIndex;
pub use observability::{LogFormat, init_logging};
pub use partition::{PartitionKey, bucket_start};
pub use record::{
    AggregatedRecord, Annotation, Dimensions, Event, EventType, Measures, PreAggregatedRecord,
};
pub use writer::PartitionWriter;
