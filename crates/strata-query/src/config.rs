//! Query service configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Smallest time-series bucket the planner will emit, in seconds.
pub const MIN_BUCKET_SECS: u64 = 300;

/// Tuning for the query service.
///
/// # Example
///
/// ```rust
/// use strata_query::QueryConfig;
///
/// let config = QueryConfig {
///     data_dir: "/var/lib/strata".into(),
///     ..QueryConfig::default()
/// };
/// assert!(config.validate().is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryConfig {
    /// Root of the analytics data directory.
    pub data_dir: PathBuf,

    /// Engine memory pool size in bytes. Sorts and aggregations spill past it.
    pub memory_limit_bytes: usize,

    /// Directory for engine spill files. `None` uses the OS temp dir.
    pub spill_dir: Option<PathBuf>,

    /// Lifetime of cached lookup results, in seconds.
    pub cache_ttl_secs: u64,

    /// Minimum time-series bucket width, in seconds.
    pub min_bucket_secs: u64,

    /// Per-query execution timeout, in seconds.
    pub query_timeout_secs: u64,

    /// Row cap applied to raw SQL queries.
    pub max_sql_rows: usize,

    /// Longest time range a query may span, in calendar days.
    pub max_range_days: u32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/data/analytics"),
            memory_limit_bytes: 1024 * 1024 * 1024,
            spill_dir: None,
            cache_ttl_secs: 30,
            min_bucket_secs: MIN_BUCKET_SECS,
            query_timeout_secs: 30,
            max_sql_rows: 10_000,
            max_range_days: 400,
        }
    }
}

impl QueryConfig {
    /// Cache entry lifetime.
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Per-query execution timeout.
    #[must_use]
    pub const fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    /// Bucket width in milliseconds for a requested interval, never below the minimum.
    #[must_use]
    pub fn bucket_width_ms(&self, interval_ms: i64) -> i64 {
        let min = i64::try_from(self.min_bucket_secs.max(1)).unwrap_or(i64::MAX / 1000);
        (interval_ms / 1000).max(min).saturating_mul(1000)
    }

    /// Validates the settings.
    ///
    /// Returns an error message if validation fails.
    #[must_use]
    pub fn validate(&self) -> Option<String> {
        if self.data_dir.as_os_str().is_empty() {
            return Some("data_dir must not be empty".to_string());
        }
        if self.memory_limit_bytes == 0 {
            return Some("memory_limit_bytes must be greater than 0".to_string());
        }
        if self.query_timeout_secs == 0 {
            return Some("query_timeout_secs must be at least 1".to_string());
        }
        if self.max_sql_rows == 0 {
            return Some("max_sql_rows must be at least 1".to_string());
        }
        if self.max_range_days == 0 {
            return Some("max_range_days must be at least 1".to_string());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueryConfig::default();
        assert_eq!(config.memory_limit_bytes, 1 << 30);
        assert_eq!(config.cache_ttl(), Duration::from_secs(30));
        assert_eq!(config.min_bucket_secs, 300);
        assert!(config.validate().is_none());
    }

    #[test]
    fn test_bucket_width_has_a_floor() {
        let config = QueryConfig::default();
        assert_eq!(config.bucket_width_ms(10_000), 300_000);
        assert_eq!(config.bucket_width_ms(3_600_000), 3_600_000);
        assert_eq!(config.bucket_width_ms(-5), 300_000);
    }

    #[test]
    fn test_validation_rejects_zero_memory() {
        let config = QueryConfig {
            memory_limit_bytes: 0,
            ..QueryConfig::default()
        };
        assert!(config.validate().unwrap().contains("memory_limit_bytes"));
    }

    #[test]
    fn test_deserializes_camel_case_with_defaults() {
        let config: QueryConfig =
            serde_json::from_str(r#"{"dataDir": "/tmp/strata", "cacheTtlSecs": 5}"#).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/strata"));
        assert_eq!(config.cache_ttl(), Duration::from_secs(5));
        assert_eq!(config.max_sql_rows, 10_000);
        assert_eq!(config.max_range_days, 400);
    }
}
