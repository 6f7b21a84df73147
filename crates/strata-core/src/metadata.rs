//! Dimension value index (`aggregated/metadata.json`).
//!
//! The index is a cache. Readers must tolerate it being absent or stale.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::layout::atomic_write;

/// Distinct dimension values observed across all final artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataIndex {
    /// Sorted distinct data sources.
    #[serde(default)]
    pub data_sources: Vec<String>,
    /// Sorted distinct flow names.
    #[serde(default)]
    pub flow_names: Vec<String>,
    /// Sorted distinct annotation keys.
    #[serde(default)]
    pub annotation_keys: Vec<String>,
    /// Sorted distinct values per annotation key (bounded per key).
    #[serde(default)]
    pub annotation_values: BTreeMap<String, Vec<String>>,
    /// When the index was built.
    pub updated_at: DateTime<Utc>,
}

impl MetadataIndex {
    /// Loads the index, returning `None` if it is missing or unreadable.
    #[must_use]
    pub fn load(path: &Path) -> Option<Self> {
        let raw = std::fs::read(path).ok()?;
        match serde_json::from_slice(&raw) {
            Ok(index) => Some(index),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "ignoring unreadable metadata index");
                None
            }
        }
    }

    /// Atomically writes the index to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(Error::from)?;
        atomic_write(path, &json)
    }

    /// Distinct values for a dimension field, if the index tracks it.
    #[must_use]
    pub fn field_values(&self, field: &str) -> Option<&[String]> {
        match field {
            "data_source" => Some(&self.data_sources),
            "flow_name" => Some(&self.flow_names),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        let mut index = MetadataIndex {
            data_sources: vec!["a".into(), "b".into()],
            updated_at: Utc::now(),
            ..MetadataIndex::default()
        };
        index
            .annotation_values
            .insert("env".into(), vec!["prod".into()]);
        index.save(&path).unwrap();

        let loaded = MetadataIndex::load(&path).unwrap();
        assert_eq!(loaded, index);
        assert_eq!(loaded.field_values("data_source").unwrap(), ["a", "b"]);
        assert!(loaded.field_values("cause").is_none());

        let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(raw.get("annotation_values").is_some());
        assert!(raw.get("updated_at").is_some());
    }

    #[test]
    fn missing_or_garbage_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        assert!(MetadataIndex::load(&path).is_none());
        std::fs::write(&path, b"[]").unwrap();
        assert!(MetadataIndex::load(&path).is_none());
    }
}
