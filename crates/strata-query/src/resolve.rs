//! Resolves time ranges to final artifact files.
//!
//! A consolidated date is read from its single daily file. A date that is
//! still rolling is read from whatever hourly files exist.

use std::path::PathBuf;

use strata_core::error::Result;
use strata_core::layout::{DataLayout, RawKind, parquet_files};
use strata_core::partition::PartitionKey;

use crate::request::{DataStats, TimeRange};

/// Final artifacts covering `range`, in date order.
///
/// # Errors
///
/// Returns an error if an hourly directory exists but cannot be listed.
pub fn files_for_range(layout: &DataLayout, range: &TimeRange) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for date in range.dates() {
        let daily = layout.daily_artifact(date);
        if daily.is_file() {
            files.push(daily);
        } else {
            files.extend(parquet_files(&layout.hourly_dir(date))?);
        }
    }
    tracing::debug!(
        from = %range.from,
        to = %range.to,
        files = files.len(),
        "resolved query files"
    );
    Ok(files)
}

/// Whether any final artifact exists.
#[must_use]
pub fn has_data(layout: &DataLayout) -> bool {
    layout
        .all_final_artifacts()
        .is_ok_and(|files| !files.is_empty())
}

/// Counts artifacts and raw files. Unreadable entries are skipped.
#[must_use]
pub fn data_stats(layout: &DataLayout) -> DataStats {
    let finals = layout.all_final_artifacts().unwrap_or_default();
    let aggregated_size_bytes = finals
        .iter()
        .filter_map(|path| std::fs::metadata(path).ok())
        .map(|meta| meta.len())
        .sum();
    DataStats {
        aggregated_files: finals.len(),
        aggregated_size_bytes,
        event_files: raw_file_count(layout, RawKind::Events),
        annotation_files: raw_file_count(layout, RawKind::Annotations),
    }
}

fn raw_file_count(layout: &DataLayout, kind: RawKind) -> usize {
    let dates = DataLayout::date_dirs(&layout.raw_dir(kind)).unwrap_or_default();
    dates
        .into_iter()
        .flat_map(PartitionKey::hours_of)
        .map(|key| {
            parquet_files(&layout.raw_hour_dir(kind, key)).map_or(0, |files| files.len())
        })
        .sum()
}
