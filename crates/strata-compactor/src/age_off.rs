//! Age-off: retention sweep over whole date partitions.
//!
//! Partition names are `YYYYMMDD`, so "older than the cutoff" is a plain
//! string comparison on the first eight characters of each entry. That also
//! catches leftover `{date}.deleting` directories from interrupted deletes.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use strata_core::layout::{DataLayout, PARQUET_EXT, RawKind};
use strata_core::partition::{format_date, parse_date};

use crate::metrics;

/// Outcome of an age-off sweep.
#[derive(Debug, Clone, Default)]
pub struct AgeOffReport {
    /// Cutoff date (`YYYYMMDD`); partitions sorting before it were removed.
    pub cutoff: Option<String>,
    /// Removed directories and files.
    pub removed: Vec<PathBuf>,
    /// Errors encountered (the sweep continues past them).
    pub errors: Vec<String>,
}

impl AgeOffReport {
    /// Returns true if any errors were encountered.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Cutoff date string for a retention window of `days`, or `None` when
/// age-off is disabled.
#[must_use]
pub fn cutoff(days: i64, now: DateTime<Utc>) -> Option<String> {
    if days <= 0 {
        return None;
    }
    let then = now.checked_sub_signed(chrono::Duration::try_days(days)?)?;
    Some(format_date(then.date_naive()))
}

/// Deletes every partition older than `days` days.
///
/// Covers raw events, raw annotations, intermediates, hourly final-artifact
/// directories and daily final-artifact files. `days <= 0` disables the sweep.
pub fn age_off(layout: &DataLayout, days: i64, now: DateTime<Utc>) -> AgeOffReport {
    let mut report = AgeOffReport {
        cutoff: cutoff(days, now),
        ..AgeOffReport::default()
    };
    let Some(cutoff) = report.cutoff.clone() else {
        return report;
    };

    let categories = [
        ("events", layout.raw_dir(RawKind::Events)),
        ("annotations", layout.raw_dir(RawKind::Annotations)),
        ("preagg", layout.preagg_dir()),
        ("aggregated", layout.aggregated_dir()),
    ];
    for (category, dir) in categories {
        sweep(category, &dir, &cutoff, &mut report);
    }

    if !report.removed.is_empty() {
        tracing::info!(
            cutoff = %cutoff,
            retention_days = days,
            removed = report.removed.len(),
            "age-off complete"
        );
    }
    report
}

fn sweep(category: &'static str, dir: &Path, cutoff: &str, report: &mut AgeOffReport) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return,
        Err(e) => {
            report.errors.push(format!("listing {}: {e}", dir.display()));
            return;
        }
    };

    for entry in entries.filter_map(std::result::Result::ok) {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(date) = name.get(..8).filter(|d| parse_date(d).is_some()) else {
            continue;
        };
        if date >= cutoff {
            continue;
        }

        let path = entry.path();
        let is_dir = entry.file_type().is_ok_and(|t| t.is_dir());
        let result = if is_dir {
            fs::remove_dir_all(&path)
        } else if category == "aggregated" && name == format!("{date}.{PARQUET_EXT}") {
            fs::remove_file(&path)
        } else {
            continue;
        };

        match result {
            Ok(()) => {
                tracing::info!(
                    category,
                    path = %path.display(),
                    metric = "strata_age_off_deletions_total",
                    "aged off partition"
                );
                metrics::record_age_off_deletion(category);
                report.removed.push(path);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(category, path = %path.display(), error = %e, "age-off failed");
                report.errors.push(format!("removing {}: {e}", path.display()));
            }
        }
    }
}
