//! External configuration pulled by the compactor and query layers.
//!
//! Only two scalars are consumed: the age-off retention window and the
//! default grouping annotation key. Providers never fail; missing or
//! malformed configuration yields the defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Pull interface for the externally managed settings.
pub trait ConfigProvider: Send + Sync {
    /// Retention window in days. Zero or negative disables age-off.
    fn age_off_days(&self) -> i64;

    /// Annotation key dashboards group by default (empty when unset).
    fn group_annotation_key(&self) -> String;
}

/// Settings document read by [`FileConfigProvider`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExternalSettings {
    /// Retention window in days.
    pub age_off_days: i64,
    /// Default grouping annotation key.
    pub group_annotation_key: String,
}

/// Provider returning fixed values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticConfigProvider {
    settings: ExternalSettings,
}

impl StaticConfigProvider {
    /// Creates a provider with the given values.
    #[must_use]
    pub fn new(age_off_days: i64, group_annotation_key: impl Into<String>) -> Self {
        Self {
            settings: ExternalSettings {
                age_off_days,
                group_annotation_key: group_annotation_key.into(),
            },
        }
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn age_off_days(&self) -> i64 {
        self.settings.age_off_days
    }

    fn group_annotation_key(&self) -> String {
        self.settings.group_annotation_key.clone()
    }
}

/// Provider that re-reads a JSON file on every pull.
///
/// ```json
/// { "ageOffDays": 30, "groupAnnotationKey": "team" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileConfigProvider {
    path: PathBuf,
}

impl FileConfigProvider {
    /// Creates a provider reading `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Settings file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> ExternalSettings {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(path = %self.path.display(), error = %e, "config unavailable, using defaults");
                return ExternalSettings::default();
            }
        };
        serde_json::from_slice(&raw).unwrap_or_else(|e| {
            tracing::debug!(path = %self.path.display(), error = %e, "config malformed, using defaults");
            ExternalSettings::default()
        })
    }
}

impl ConfigProvider for FileConfigProvider {
    fn age_off_days(&self) -> i64 {
        self.load().age_off_days
    }

    fn group_annotation_key(&self) -> String {
        self.load().group_annotation_key
    }
}
