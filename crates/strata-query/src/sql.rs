//! SQL statement builders.
//!
//! Every statement reads from the [`TABLE`] registered by the service. All
//! caller-supplied strings pass through [`filters::quote`] or
//! [`filters::escape`] before they are interpolated.
//!
//! Annotations are a `Map<Utf8, Utf8>` column; a key's value is read with
//! `array_element(map_extract(annotations, 'key'), 1)`, which is null when
//! the map is null or the key is absent.

use strata_core::record::EventType;

use crate::filters::{self, AnnotationFilter, NOT_PRESENT};
use crate::request::{AnalyticsRequest, EventAnalysisRequest, EventTypeFilter, TimeRange};

/// Name of the table holding final artifact rows.
pub const TABLE: &str = "aggregated";

/// Dimension columns that can be listed or grouped by.
pub const DIMENSION_FIELDS: [&str; 6] = [
    "data_source",
    "event_type",
    "flow_name",
    "action_name",
    "cause",
    "ingress_type",
];

const EVENT_GROUP_FIELDS: [&str; 4] = ["data_source", "cause", "action_name", "flow_name"];

/// Expression reading one annotation value.
#[must_use]
pub fn annotation_value(key: &str) -> String {
    format!(
        "array_element(map_extract(annotations, '{}'), 1)",
        filters::escape(key)
    )
}

fn time_filter(range: &TimeRange) -> String {
    format!(
        "bucket >= {} AND bucket < {}",
        range.from_millis(),
        range.to_millis()
    )
}

fn bucket_expr(width_ms: i64) -> String {
    format!("(bucket / {width_ms}) * {width_ms}")
}

fn in_filter(column: &str, values: &[String]) -> Option<String> {
    filters::dimension_values(values)
        .map(|values| format!("{column} IN ({})", filters::quote_list(&values)))
}

fn annotation_predicate(filter: &AnnotationFilter) -> String {
    let value = annotation_value(&filter.key);
    match (filter.include_missing, filter.values.is_empty()) {
        (true, true) => format!("{value} IS NULL"),
        (true, false) => format!(
            "({value} IS NULL OR {value} IN ({}))",
            filters::quote_list(&filter.values)
        ),
        (false, _) => format!("{value} IN ({})", filters::quote_list(&filter.values)),
    }
}

fn push_annotation_filters(
    predicates: &mut Vec<String>,
    annotations: &std::collections::BTreeMap<String, Vec<String>>,
) {
    predicates.extend(
        filters::expand_annotation_filters(annotations)
            .iter()
            .map(annotation_predicate),
    );
}

/// Time-series metrics, one row per `(bucket, series, annotation value)`.
///
/// Output columns: `ts, data_source, annotation_value, ingress_bytes,
/// ingress_files, egress_bytes, egress_files, error_files, filter_files`.
#[must_use]
pub fn analytics(req: &AnalyticsRequest, width_ms: i64) -> String {
    let mut predicates = vec![time_filter(&req.range())];
    match req.event_type {
        EventTypeFilter::All => {}
        EventTypeFilter::Errors => {
            predicates.push(format!("event_type = '{}'", EventType::Error.as_str()));
        }
        EventTypeFilter::Filters => {
            predicates.push(format!("event_type = '{}'", EventType::Filter.as_str()));
        }
    }
    predicates.extend(in_filter("data_source", &req.data_sources));
    predicates.extend(in_filter("flow_name", &req.flow_names));
    predicates.extend(in_filter("ingress_type", &req.ingress_types));
    push_annotation_filters(&mut predicates, &req.annotations);

    let (series, annotation) = match filters::normalize_group_key(&req.group_by_annotation) {
        Some(key) => {
            let value = format!("COALESCE({}, '{NOT_PRESENT}')", annotation_value(key));
            (format!("data_source || ' - ' || {value}"), value)
        }
        None => ("data_source".to_string(), "''".to_string()),
    };

    format!(
        "SELECT \
            {bucket} AS ts, \
            CAST({series} AS VARCHAR) AS data_source, \
            CAST({annotation} AS VARCHAR) AS annotation_value, \
            CAST(SUM(CASE WHEN event_type = 'INGRESS' THEN total_bytes ELSE 0 END) AS BIGINT) AS ingress_bytes, \
            CAST(SUM(CASE WHEN event_type = 'INGRESS' THEN total_file_count ELSE 0 END) AS BIGINT) AS ingress_files, \
            CAST(SUM(CASE WHEN event_type = 'EGRESS' THEN total_bytes ELSE 0 END) AS BIGINT) AS egress_bytes, \
            CAST(SUM(CASE WHEN event_type = 'EGRESS' THEN total_file_count ELSE 0 END) AS BIGINT) AS egress_files, \
            CAST(SUM(CASE WHEN event_type = 'ERROR' THEN event_count ELSE 0 END) AS BIGINT) AS error_files, \
            CAST(SUM(CASE WHEN event_type = 'FILTER' THEN event_count ELSE 0 END) AS BIGINT) AS filter_files \
         FROM {TABLE} \
         WHERE {where_clause} \
         GROUP BY 1, 2, 3 \
         ORDER BY 1, 2, 3",
        bucket = bucket_expr(width_ms),
        where_clause = predicates.join(" AND "),
    )
}

/// Error or filter breakdown, one row per `(bucket, group value)`.
///
/// Output columns: `ts, group_value, events`.
#[must_use]
pub fn event_analysis(req: &EventAnalysisRequest, event_type: EventType, width_ms: i64) -> String {
    let mut predicates = vec![
        time_filter(&req.range()),
        format!("event_type = '{}'", event_type.as_str()),
    ];
    predicates.extend(in_filter("data_source", &req.data_sources));
    push_annotation_filters(&mut predicates, &req.annotations);

    let group = if req.group_by.is_empty() {
        "''".to_string()
    } else if EVENT_GROUP_FIELDS.contains(&req.group_by.as_str()) {
        format!("COALESCE({}, '')", req.group_by)
    } else {
        format!(
            "COALESCE({}, '{NOT_PRESENT}')",
            annotation_value(&req.group_by)
        )
    };

    format!(
        "SELECT \
            {bucket} AS ts, \
            CAST({group} AS VARCHAR) AS group_value, \
            CAST(SUM(event_count) AS BIGINT) AS events \
         FROM {TABLE} \
         WHERE {where_clause} \
         GROUP BY 1, 2 \
         ORDER BY 1, 2",
        bucket = bucket_expr(width_ms),
        where_clause = predicates.join(" AND "),
    )
}

/// Distinct non-null values of a dimension column. Output column: `val`.
///
/// Returns `None` for columns outside [`DIMENSION_FIELDS`].
#[must_use]
pub fn distinct_values(field: &str, range: &TimeRange) -> Option<String> {
    if !DIMENSION_FIELDS.contains(&field) {
        return None;
    }
    Some(format!(
        "SELECT DISTINCT CAST({field} AS VARCHAR) AS val FROM {TABLE} \
         WHERE {} AND {field} IS NOT NULL",
        time_filter(range)
    ))
}

/// Distinct annotation keys. Output column: `val`.
#[must_use]
pub fn annotation_keys(range: &TimeRange) -> String {
    format!(
        "SELECT DISTINCT val FROM (\
            SELECT unnest(map_keys(annotations)) AS val FROM {TABLE} \
            WHERE {} AND annotations IS NOT NULL\
         )",
        time_filter(range)
    )
}

/// Distinct values of one annotation key. Output column: `val`.
#[must_use]
pub fn annotation_values(key: &str, range: &TimeRange) -> String {
    let value = annotation_value(key);
    format!(
        "SELECT DISTINCT CAST({value} AS VARCHAR) AS val FROM {TABLE} \
         WHERE {} AND {value} IS NOT NULL",
        time_filter(range)
    )
}

/// Distinct values across every annotation key. Output column: `val`.
#[must_use]
pub fn all_annotation_values(range: &TimeRange) -> String {
    format!(
        "SELECT DISTINCT val FROM (\
            SELECT unnest(map_values(annotations)) AS val FROM {TABLE} \
            WHERE {} AND annotations IS NOT NULL\
         )",
        time_filter(range)
    )
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};

    use super::*;

    fn range() -> TimeRange {
        TimeRange::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap(),
        )
    }

    fn request() -> AnalyticsRequest {
        AnalyticsRequest {
            time_from: range().from,
            time_to: range().to,
            ..AnalyticsRequest::default()
        }
    }

    #[test]
    fn analytics_without_filters_only_bounds_time() {
        let sql = analytics(&request(), 300_000);
        assert!(sql.contains("bucket >= 1735689600000 AND bucket < 1735776000000"));
        assert!(sql.contains("(bucket / 300000) * 300000 AS ts"));
        assert!(!sql.contains(" IN ("));
        assert!(sql.contains("CAST('' AS VARCHAR) AS annotation_value"));
    }

    #[test]
    fn all_sentinel_skips_dimension_filter() {
        let req = AnalyticsRequest {
            data_sources: vec!["$__all".into()],
            flow_names: vec!["{a,b}".into()],
            ..request()
        };
        let sql = analytics(&req, 300_000);
        assert!(!sql.contains("data_source IN"));
        assert!(sql.contains("flow_name IN ('a', 'b')"));
    }

    #[test]
    fn not_present_combines_with_values() {
        let mut annotations = BTreeMap::new();
        annotations.insert("env".to_string(), vec!["prod".into(), "not present".into()]);
        let req = AnalyticsRequest {
            annotations,
            ..request()
        };
        let sql = analytics(&req, 300_000);
        let value = annotation_value("env");
        assert!(sql.contains(&format!("({value} IS NULL OR {value} IN ('prod'))")));
    }

    #[test]
    fn grouping_by_annotation_suffixes_series() {
        let req = AnalyticsRequest {
            group_by_annotation: "env".into(),
            event_type: EventTypeFilter::Errors,
            ..request()
        };
        let sql = analytics(&req, 300_000);
        assert!(sql.contains("data_source || ' - ' || COALESCE("));
        assert!(sql.contains("'not present'"));
        assert!(sql.contains("event_type = 'ERROR'"));
    }

    #[test]
    fn values_are_escaped() {
        let req = AnalyticsRequest {
            data_sources: vec!["x' OR '1'='1".into()],
            ..request()
        };
        let sql = analytics(&req, 300_000);
        assert!(sql.contains("data_source IN ('x'' OR ''1''=''1')"));
        assert_eq!(
            annotation_value("it's"),
            "array_element(map_extract(annotations, 'it''s'), 1)"
        );
    }

    #[test]
    fn event_analysis_groups_by_column_or_annotation() {
        let req = EventAnalysisRequest {
            time_from: range().from,
            time_to: range().to,
            group_by: "cause".into(),
            ..EventAnalysisRequest::default()
        };
        let sql = event_analysis(&req, EventType::Error, 3_600_000);
        assert!(sql.contains("COALESCE(cause, '')"));
        assert!(sql.contains("event_type = 'ERROR'"));

        let req = EventAnalysisRequest {
            group_by: "env".into(),
            ..req
        };
        let sql = event_analysis(&req, EventType::Filter, 3_600_000);
        assert!(sql.contains(&annotation_value("env")));
    }

    #[test]
    fn distinct_values_rejects_unknown_fields() {
        assert!(distinct_values("data_source", &range()).is_some());
        assert!(distinct_values("bytes; DROP TABLE x", &range()).is_none());
    }
}
