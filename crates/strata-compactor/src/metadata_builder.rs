//! Rebuilds the dimension value index from final artifacts.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;

use strata_core::codec;
use strata_core::error::Result;
use strata_core::layout::DataLayout;
use strata_core::metadata::MetadataIndex;
use strata_core::record::AggregatedRecord;

#[derive(Debug, Default)]
struct Collector {
    data_sources: BTreeSet<String>,
    flow_names: BTreeSet<String>,
    annotation_values: BTreeMap<String, BTreeSet<String>>,
}

impl Collector {
    fn observe(&mut self, row: &AggregatedRecord) {
        if !row.dims.data_source.is_empty() {
            self.data_sources.insert(row.dims.data_source.clone());
        }
        if let Some(flow) = row.dims.flow_name.as_deref().filter(|f| !f.is_empty()) {
            self.flow_names.insert(flow.to_string());
        }
        for (key, value) in row.annotations.iter() {
            if key.is_empty() {
                continue;
            }
            let values = self.annotation_values.entry(key.to_string()).or_default();
            if !value.is_empty() {
                values.insert(value.to_string());
            }
        }
    }

    fn finish(self, value_limit: usize) -> MetadataIndex {
        let annotation_keys = self.annotation_values.keys().cloned().collect();
        let annotation_values = self
            .annotation_values
            .into_iter()
            .map(|(key, values)| {
                if values.len() > value_limit {
                    tracing::debug!(key = %key, limit = value_limit, "truncated annotation values");
                }
                (key, values.into_iter().take(value_limit).collect())
            })
            .collect();
        MetadataIndex {
            data_sources: self.data_sources.into_iter().collect(),
            flow_names: self.flow_names.into_iter().collect(),
            annotation_keys,
            annotation_values,
            updated_at: Utc::now(),
        }
    }
}

/// Scans every final artifact and builds the index.
///
/// Returns `None` when there are no final artifacts. Unreadable artifacts are
/// skipped with a warning.
///
/// # Errors
///
/// Returns an error if the aggregated directory cannot be listed.
pub fn build(layout: &DataLayout, value_limit: usize) -> Result<Option<MetadataIndex>> {
    let artifacts = layout.all_final_artifacts()?;
    if artifacts.is_empty() {
        return Ok(None);
    }
    let mut collector = Collector::default();
    for path in &artifacts {
        match codec::read_aggregated(path) {
            Ok(rows) => rows.iter().for_each(|row| collector.observe(row)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable artifact");
            }
        }
    }
    Ok(Some(collector.finish(value_limit)))
}

/// Builds the index and writes it to `aggregated/metadata.json`.
///
/// Returns `false` if there was nothing to index.
///
/// # Errors
///
/// Returns an error if listing or writing fails.
pub fn rebuild(layout: &DataLayout, value_limit: usize) -> Result<bool> {
    let Some(index) = build(layout, value_limit)? else {
        return Ok(false);
    };
    index.save(&layout.metadata_file())?;
    tracing::info!(
        data_sources = index.data_sources.len(),
        flow_names = index.flow_names.len(),
        annotation_keys = index.annotation_keys.len(),
        "metadata updated"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use strata_core::partition::PartitionKey;
    use strata_core::record::{Dimensions, EventType, Measures};
    use strata_core::AnnotationMap;

    use super::*;

    fn row(source: &str, flow: Option<&str>, annotations: &[(&str, &str)]) -> AggregatedRecord {
        AggregatedRecord {
            bucket: 0,
            dims: Dimensions {
                data_source: source.into(),
                event_type: EventType::Ingress,
                flow_name: flow.map(Into::into),
                action_name: None,
                cause: None,
                ingress_type: None,
            },
            annotations: annotations.iter().copied().collect::<AnnotationMap>(),
            source_partition: "20250101/10".into(),
            measures: Measures::default(),
        }
    }

    #[test]
    fn collects_sorted_distinct_values_across_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        let key: PartitionKey = "20250102/10".parse().unwrap();
        codec::write_aggregated(
            &layout.hourly_artifact(key),
            &[row("b", Some("f1"), &[("env", "prod")]), row("", None, &[])],
        )
        .unwrap();
        codec::write_aggregated(
            &layout.daily_artifact(key.date().pred_opt().unwrap()),
            &[row("a", Some(""), &[("env", "dev"), ("team", "")])],
        )
        .unwrap();
        std::fs::write(layout.hourly_dir(key.date()).join("11.parquet"), b"junk").unwrap();

        assert!(rebuild(&layout, 500).unwrap());
        let index = MetadataIndex::load(&layout.metadata_file()).unwrap();
        assert_eq!(index.data_sources, vec!["a", "b"]);
        assert_eq!(index.flow_names, vec!["f1"]);
        assert_eq!(index.annotation_keys, vec!["env", "team"]);
        assert_eq!(index.annotation_values["env"], vec!["dev", "prod"]);
        assert!(index.annotation_values["team"].is_empty());
    }

    #[test]
    fn caps_values_per_key() {
        let mut collector = Collector::default();
        for i in 0..10 {
            let value = format!("v{i}");
            collector.observe(&row("s", None, &[("k", value.as_str())]));
        }
        let index = collector.finish(3);
        assert_eq!(index.annotation_values["k"], vec!["v0", "v1", "v2"]);
    }

    #[test]
    fn nothing_to_index() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        assert!(!rebuild(&layout, 500).unwrap());
        assert!(!layout.metadata_file().exists());
    }
}
