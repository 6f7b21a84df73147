//! Compactor configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// Keeps `chrono::Duration::hours` in range.
const MAX_THRESHOLD_HOURS: i64 = 1_000_000;

/// Tuning for the compaction engine.
///
/// # Example
///
/// ```rust
/// use strata_compactor::CompactorConfig;
///
/// let config = CompactorConfig {
///     data_dir: "/var/lib/strata".into(),
///     archive_threshold_hours: 24,
///     ..CompactorConfig::default()
/// };
/// assert!(config.validate().is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CompactorConfig {
    /// Root of the analytics data directory.
    pub data_dir: PathBuf,

    /// Seconds between periodic compaction runs.
    pub check_interval_secs: u64,

    /// Age (hours) past which an hour is immutable: raw inputs are deleted
    /// after compaction and fully aged dates are consolidated to daily files.
    pub archive_threshold_hours: u64,

    /// Maximum distinct values recorded per annotation key in the metadata index.
    pub metadata_value_limit: usize,

    /// Temp-write markers younger than this (seconds) block a safe delete.
    pub stale_tmp_secs: u64,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/data/analytics"),
            check_interval_secs: 60,
            archive_threshold_hours: 72,
            metadata_value_limit: 500,
            stale_tmp_secs: 60,
        }
    }
}

impl CompactorConfig {
    /// Short intervals for local development.
    ///
    /// - 10 second check interval
    /// - 1 hour archive threshold
    #[must_use]
    pub fn development() -> Self {
        Self {
            check_interval_secs: 10,
            archive_threshold_hours: 1,
            ..Self::default()
        }
    }

    /// Keeps raw data around longer before archiving.
    ///
    /// - 5 minute check interval
    /// - 7 day archive threshold
    #[must_use]
    pub fn conservative() -> Self {
        Self {
            check_interval_secs: 300,
            archive_threshold_hours: 168,
            ..Self::default()
        }
    }

    /// Interval between compaction runs.
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Archive threshold as a signed duration for timestamp arithmetic.
    #[must_use]
    pub fn archive_threshold(&self) -> chrono::Duration {
        let hours = i64::try_from(self.archive_threshold_hours).unwrap_or(MAX_THRESHOLD_HOURS);
        chrono::Duration::hours(hours.min(MAX_THRESHOLD_HOURS))
    }

    /// Stale temp-marker age.
    #[must_use]
    pub const fn stale_tmp_age(&self) -> Duration {
        Duration::from_secs(self.stale_tmp_secs)
    }

    /// Validates the settings.
    ///
    /// Returns an error message if validation fails.
    #[must_use]
    pub fn validate(&self) -> Option<String> {
        if self.data_dir.as_os_str().is_empty() {
            return Some("data_dir must not be empty".to_string());
        }
        if self.check_interval_secs == 0 {
            return Some("check_interval_secs must be at least 1".to_string());
        }
        if self.archive_threshold_hours == 0 {
            return Some("archive_threshold_hours must be at least 1".to_string());
        }
        if self.metadata_value_limit == 0 {
            return Some("metadata_value_limit must be at least 1".to_string());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CompactorConfig::default();
        assert_eq!(config.check_interval(), Duration::from_secs(60));
        assert_eq!(config.archive_threshold(), chrono::Duration::hours(72));
        assert_eq!(config.metadata_value_limit, 500);
        assert_eq!(config.stale_tmp_age(), Duration::from_secs(60));
        assert!(config.validate().is_none());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(CompactorConfig::development().validate().is_none());
        assert_eq!(CompactorConfig::conservative().archive_threshold_hours, 168);
    }

    #[test]
    fn test_validation_rejects_zero_threshold() {
        let config = CompactorConfig {
            archive_threshold_hours: 0,
            ..CompactorConfig::default()
        };
        assert!(config.validate().unwrap().contains("archive_threshold_hours"));
    }

    #[test]
    fn test_deserializes_camel_case_with_defaults() {
        let config: CompactorConfig =
            serde_json::from_str(r#"{"dataDir": "/tmp/strata", "archiveThresholdHours": 24}"#)
                .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/strata"));
        assert_eq!(config.archive_threshold_hours, 24);
        assert_eq!(config.check_interval_secs, 60);
    }
}
