//! Dashboard filter values and SQL literal escaping.
//!
//! Dashboards send a few special values: any of [`ALL_SENTINELS`] means
//! "match everything" and skips the filter, `{a,b,c}` is a multi-select,
//! and [`NOT_PRESENT`] selects rows where an annotation key is absent.

use std::collections::BTreeMap;

/// Values meaning "do not filter on this dimension".
pub const ALL_SENTINELS: [&str; 3] = ["All", "'All'", "$__all"];

/// Annotation value meaning "key absent or null".
pub const NOT_PRESENT: &str = "not present";

/// Pseudo annotation key meaning "do not group by an annotation".
pub const NO_GROUPING: &str = "None";

/// Returns true if any value is an "All" sentinel.
#[must_use]
pub fn contains_all<S: AsRef<str>>(values: &[S]) -> bool {
    values
        .iter()
        .any(|v| ALL_SENTINELS.contains(&v.as_ref()))
}

/// Splits a `{a,b,c}` multi-select into its parts. Other strings yield `None`.
#[must_use]
pub fn parse_multi_value(value: &str) -> Option<Vec<String>> {
    let inner = value.strip_prefix('{')?.strip_suffix('}')?;
    if inner.is_empty() {
        return None;
    }
    Some(inner.split(',').map(str::to_string).collect())
}

/// Normalizes a group-by annotation key.
///
/// Empty, "All", [`NO_GROUPING`] and multi-select keys mean no grouping.
#[must_use]
pub fn normalize_group_key(key: &str) -> Option<&str> {
    if key.is_empty() || key == "$__all" || key == NO_GROUPING || parse_multi_value(key).is_some() {
        None
    } else {
        Some(key)
    }
}

/// Values for a dimension filter, or `None` when the filter should be skipped.
#[must_use]
pub fn dimension_values(values: &[String]) -> Option<Vec<String>> {
    if values.is_empty() || contains_all(values) {
        return None;
    }
    let mut expanded = Vec::with_capacity(values.len());
    for value in values {
        match parse_multi_value(value) {
            Some(parts) => expanded.extend(parts),
            None => expanded.push(value.clone()),
        }
    }
    Some(expanded)
}

/// A resolved annotation filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationFilter {
    /// Annotation key.
    pub key: String,
    /// Concrete values to match.
    pub values: Vec<String>,
    /// Whether rows without the key also match.
    pub include_missing: bool,
}

/// Expands dashboard annotation filters into concrete filters.
///
/// Keys that are empty, "All" or multi-select are dropped, as are keys whose
/// values contain an "All" sentinel. Multi-select values are expanded.
#[must_use]
pub fn expand_annotation_filters(filters: &BTreeMap<String, Vec<String>>) -> Vec<AnnotationFilter> {
    let mut out = Vec::new();
    for (key, values) in filters {
        if key.is_empty() || key == "$__all" || parse_multi_value(key).is_some() {
            continue;
        }
        let Some(expanded) = dimension_values(values) else {
            continue;
        };
        let include_missing = expanded.iter().any(|v| v == NOT_PRESENT);
        let values: Vec<String> = expanded.into_iter().filter(|v| v != NOT_PRESENT).collect();
        if values.is_empty() && !include_missing {
            continue;
        }
        out.push(AnnotationFilter {
            key: key.clone(),
            values,
            include_missing,
        });
    }
    out
}

/// Escapes a value for use inside a single-quoted SQL literal.
///
/// Surrounding quotes added by dashboards are stripped first.
#[must_use]
pub fn escape(value: &str) -> String {
    value
        .trim_matches(|c| c == '\'' || c == '"')
        .replace('\'', "''")
}

/// Renders a value as a quoted SQL string literal.
#[must_use]
pub fn quote(value: &str) -> String {
    format!("'{}'", escape(value))
}

/// Renders values as a comma-separated list of SQL literals.
#[must_use]
pub fn quote_list<S: AsRef<str>>(values: &[S]) -> String {
    values
        .iter()
        .map(|v| quote(v.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}
