//! Record types flowing through the pipeline.

use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::annotations::AnnotationMap;
use crate::error::{Error, Result};

/// Kind of telemetry event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Data entered the system.
    Ingress,
    /// Data left the system.
    Egress,
    /// Processing failed.
    Error,
    /// Data was filtered out.
    Filter,
}

impl EventType {
    /// Stored string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ingress => "INGRESS",
            Self::Egress => "EGRESS",
            Self::Error => "ERROR",
            Self::Filter => "FILTER",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INGRESS" => Ok(Self::Ingress),
            "EGRESS" => Ok(Self::Egress),
            "ERROR" => Ok(Self::Error),
            "FILTER" => Ok(Self::Filter),
            other => Err(Error::InvalidInput(format!("unknown event type: {other}"))),
        }
    }
}

/// Raw telemetry event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Row-level identifier.
    pub did: String,
    /// Originating data source.
    pub data_source: String,
    /// Event kind.
    pub event_type: EventType,
    /// When the activity happened (ms since epoch).
    pub event_time: i64,
    /// When the collector received it (ms since epoch).
    pub ingest_time: i64,
    /// Logical creation time used for raw partitioning (ms since epoch).
    pub creation_time: i64,
    /// Byte count.
    pub bytes: i64,
    /// File count.
    pub file_count: i64,
    /// Optional flow name.
    pub flow_name: Option<String>,
    /// Optional action name.
    pub action_name: Option<String>,
    /// Optional cause (errors and filters).
    pub cause: Option<String>,
    /// Optional ingress type.
    pub ingress_type: Option<String>,
}

/// Raw key/value annotation for a DID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    /// Row-level identifier the annotation applies to.
    pub did: String,
    /// Annotation key.
    pub key: String,
    /// Annotation value.
    pub value: String,
    /// When the annotation was written (ms since epoch).
    pub update_time: i64,
    /// Creation time of the annotated record (ms since epoch, 0 if unknown).
    pub creation_time: i64,
}

impl Annotation {
    /// Timestamp used to pick the raw partition: creation time, else update time.
    #[must_use]
    pub const fn partition_time(&self) -> i64 {
        if self.creation_time == 0 {
            self.update_time
        } else {
            self.creation_time
        }
    }
}

/// Grouping dimensions shared by every aggregate level.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    /// Data source.
    pub data_source: String,
    /// Event kind.
    pub event_type: EventType,
    /// Flow name.
    pub flow_name: Option<String>,
    /// Action name.
    pub action_name: Option<String>,
    /// Cause.
    pub cause: Option<String>,
    /// Ingress type.
    pub ingress_type: Option<String>,
}

impl Dimensions {
    /// Dimensions of a raw event.
    #[must_use]
    pub fn of(event: &Event) -> Self {
        Self {
            data_source: event.data_source.clone(),
            event_type: event.event_type,
            flow_name: event.flow_name.clone(),
            action_name: event.action_name.clone(),
            cause: event.cause.clone(),
            ingress_type: event.ingress_type.clone(),
        }
    }
}

/// Additive measures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Measures {
    /// Number of events.
    pub event_count: i64,
    /// Sum of bytes.
    pub total_bytes: i64,
    /// Sum of file counts.
    pub total_file_count: i64,
}

impl Measures {
    /// Measures contributed by one raw event.
    #[must_use]
    pub const fn of(event: &Event) -> Self {
        Self {
            event_count: 1,
            total_bytes: event.bytes,
            total_file_count: event.file_count,
        }
    }
}

impl Add for Measures {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            event_count: self.event_count + rhs.event_count,
            total_bytes: self.total_bytes + rhs.total_bytes,
            total_file_count: self.total_file_count + rhs.total_file_count,
        }
    }
}

impl AddAssign for Measures {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Stage-1 output row: DID preserved, 5-minute event-time bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreAggregatedRecord {
    /// Row-level identifier.
    pub did: String,
    /// Event-time bucket start (ms since epoch, 5-minute aligned).
    pub bucket: i64,
    /// Grouping dimensions.
    pub dims: Dimensions,
    /// Resolved annotations for the DID.
    pub annotations: AnnotationMap,
    /// Summed measures.
    pub measures: Measures,
}

/// Stage-2 output row (final artifact). DID is gone past this point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedRecord {
    /// Bucket start (ms since epoch): 5-minute aligned in hourly artifacts,
    /// 1-hour aligned in daily artifacts.
    pub bucket: i64,
    /// Grouping dimensions.
    pub dims: Dimensions,
    /// Annotations shared by the aggregated DIDs.
    pub annotations: AnnotationMap,
    /// Creation-hour partition (`YYYYMMDD/HH`) that contributed the row.
    pub source_partition: String,
    /// Summed measures.
    pub measures: Measures,
}
