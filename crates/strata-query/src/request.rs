//! Request and result types for the query service.
//!
//! Field names follow the dashboard JSON contract: requests are camelCase,
//! result rows are snake_case with `time` in epoch milliseconds.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use strata_core::partition::format_date;

/// Half-open time window `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive start.
    pub from: DateTime<Utc>,
    /// Exclusive end.
    pub to: DateTime<Utc>,
}

impl TimeRange {
    /// Creates a range.
    #[must_use]
    pub const fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// Start in epoch milliseconds.
    #[must_use]
    pub fn from_millis(&self) -> i64 {
        self.from.timestamp_millis()
    }

    /// End in epoch milliseconds.
    #[must_use]
    pub fn to_millis(&self) -> i64 {
        self.to.timestamp_millis()
    }

    /// Calendar dates touched by the range, inclusive of both ends.
    #[must_use]
    pub fn dates(&self) -> Vec<NaiveDate> {
        strata_core::partition::dates_between(self.from, self.to)
    }

    /// Number of calendar dates the range touches (0 when `to` precedes `from`).
    #[must_use]
    pub fn span_days(&self) -> i64 {
        let days = (self.to.date_naive() - self.from.date_naive()).num_days();
        if days < 0 {
            0
        } else {
            days + 1
        }
    }

    /// `YYYYMMDD` of both ends, used as a cache key.
    #[must_use]
    pub fn date_key(&self) -> (String, String) {
        (
            format_date(self.from.date_naive()),
            format_date(self.to.date_naive()),
        )
    }
}

/// Which events a time-series query covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventTypeFilter {
    /// Every event type.
    #[default]
    All,
    /// Only `ERROR` events.
    Errors,
    /// Only `FILTER` events.
    Filters,
}

/// Parameters of a time-series analytics query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalyticsRequest {
    /// Inclusive start.
    pub time_from: DateTime<Utc>,
    /// Exclusive end.
    pub time_to: DateTime<Utc>,
    /// Requested bucket width; raised to the configured minimum.
    pub interval_ms: i64,
    /// Data source filter.
    pub data_sources: Vec<String>,
    /// Flow name filter.
    pub flow_names: Vec<String>,
    /// Annotation filters: key to allowed values.
    pub annotations: BTreeMap<String, Vec<String>>,
    /// Annotation key to split series by.
    pub group_by_annotation: String,
    /// Ingress type filter.
    pub ingress_types: Vec<String>,
    /// Event type restriction.
    pub event_type: EventTypeFilter,
}

impl AnalyticsRequest {
    /// The request's time window.
    #[must_use]
    pub const fn range(&self) -> TimeRange {
        TimeRange::new(self.time_from, self.time_to)
    }
}

/// Parameters of an error or filter breakdown query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventAnalysisRequest {
    /// Inclusive start.
    pub time_from: DateTime<Utc>,
    /// Exclusive end.
    pub time_to: DateTime<Utc>,
    /// Requested bucket width; raised to the configured minimum.
    pub interval_ms: i64,
    /// Data source filter.
    pub data_sources: Vec<String>,
    /// Annotation filters: key to allowed values.
    pub annotations: BTreeMap<String, Vec<String>>,
    /// `data_source`, `cause`, `action_name`, `flow_name`, or an annotation key.
    pub group_by: String,
}

impl EventAnalysisRequest {
    /// The request's time window.
    #[must_use]
    pub const fn range(&self) -> TimeRange {
        TimeRange::new(self.time_from, self.time_to)
    }
}

/// One time-series row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsRow {
    /// Bucket start, epoch milliseconds.
    pub time: i64,
    /// Data source, suffixed with the annotation value when grouping.
    pub data_source: String,
    /// Group-by annotation value, empty when not grouping.
    pub annotation_value: String,
    /// Ingress bytes.
    pub ingress_bytes: i64,
    /// Ingress files.
    pub ingress_files: i64,
    /// Egress bytes.
    pub egress_bytes: i64,
    /// Egress files.
    pub egress_files: i64,
    /// Error events.
    pub error_files: i64,
    /// Filter events.
    pub filter_files: i64,
}

/// One error or filter breakdown row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAnalysisRow {
    /// Bucket start, epoch milliseconds.
    pub time: i64,
    /// Value of the group-by field.
    pub group_value: String,
    /// Number of events.
    pub count: i64,
}

/// File counts and sizes in the data directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStats {
    /// Hourly plus daily final artifacts.
    pub aggregated_files: usize,
    /// Total size of the final artifacts.
    pub aggregated_size_bytes: u64,
    /// Raw event files awaiting compaction or archival.
    pub event_files: usize,
    /// Raw annotation files awaiting compaction or archival.
    pub annotation_files: usize,
}

/// Result of a raw SQL query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SqlResult {
    /// Column names in output order.
    pub columns: Vec<String>,
    /// Rows as JSON objects.
    pub rows: Vec<Map<String, Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn analytics_request_reads_dashboard_json() {
        let req: AnalyticsRequest = serde_json::from_str(
            r#"{
                "timeFrom": "2025-01-01T00:00:00Z",
                "timeTo": "2025-01-02T00:00:00Z",
                "intervalMs": 60000,
                "dataSources": ["sensor"],
                "annotations": {"env": ["prod"]},
                "eventType": "ERRORS"
            }"#,
        )
        .unwrap();
        assert_eq!(req.interval_ms, 60_000);
        assert_eq!(req.event_type, EventTypeFilter::Errors);
        assert_eq!(req.annotations["env"], vec!["prod"]);
        assert!(req.flow_names.is_empty());
    }

    #[test]
    fn range_dates_are_inclusive() {
        let range = TimeRange::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 22, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 3, 1, 0, 0).unwrap(),
        );
        assert_eq!(range.dates().len(), 3);
        assert_eq!(range.date_key(), ("20250101".to_string(), "20250103".to_string()));
    }
}
