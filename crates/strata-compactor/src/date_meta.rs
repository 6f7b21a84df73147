//! Per-date processing records and the dirty check built on them.
//!
//! `aggregated/{date}/meta.json` maps each hour to the newest raw-file mtime
//! (unix nanoseconds) consumed by its last successful Stage-1 write. An hour
//! is recompacted only when raw input newer than that record shows up.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use strata_core::codec;
use strata_core::error::Result;
use strata_core::layout::{self, DataLayout, RawKind, atomic_write};
use strata_core::partition::PartitionKey;
use strata_core::Error;

/// Processing record for one date.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateMeta {
    /// Hour (`"HH"`) to last processed source mtime in unix nanoseconds.
    #[serde(default)]
    pub hour_mtimes: BTreeMap<String, i64>,
}

/// Why an hour needs compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirtyReason {
    /// Raw events exist but nothing has been produced from them yet.
    NoAggregate,
    /// A raw event file is newer than the last processed mtime.
    EventsNewer,
    /// A raw annotation file is newer than the last processed mtime.
    AnnotationsNewer,
    /// New raw files arrived for a date already consolidated to a daily artifact.
    LateArrivals,
}

impl DirtyReason {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoAggregate => "no_aggregate",
            Self::EventsNewer => "events_newer",
            Self::AnnotationsNewer => "annotations_newer",
            Self::LateArrivals => "late_arrivals",
        }
    }
}

impl fmt::Display for DirtyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Converts a file mtime to unix nanoseconds (0 for pre-epoch times).
#[must_use]
pub fn to_nanos(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}

/// Reads and writes [`DateMeta`] records and answers the dirty check.
#[derive(Debug, Clone)]
pub struct DirtyTracker {
    layout: DataLayout,
}

impl DirtyTracker {
    /// Creates a tracker over `layout`.
    #[must_use]
    pub fn new(layout: DataLayout) -> Self {
        Self { layout }
    }

    /// Loads the record for `key`'s date. Missing or unreadable files yield `None`.
    fn load(&self, key: PartitionKey) -> Option<DateMeta> {
        let path = self.layout.date_meta(key.date());
        let raw = std::fs::read(&path).ok()?;
        match serde_json::from_slice(&raw) {
            Ok(meta) => Some(meta),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable date meta");
                None
            }
        }
    }

    /// Last processed source mtime for `key`, in unix nanoseconds.
    ///
    /// Falls back to the hourly final artifact's mtime when the date has no
    /// record file at all, but only if that artifact holds rows produced from
    /// `key` itself. Other creation hours write into the same event-hour
    /// artifact and say nothing about this hour's raw files.
    #[must_use]
    pub fn last_processed(&self, key: PartitionKey) -> Option<i64> {
        match self.load(key) {
            Some(meta) => meta.hour_mtimes.get(&key.hour_str()).copied(),
            None => self.artifact_fallback(key),
        }
    }

    fn artifact_fallback(&self, key: PartitionKey) -> Option<i64> {
        let path = self.layout.hourly_artifact(key);
        let modified = layout::modified(&path)?;
        let source = key.to_string();
        let rows = codec::read_aggregated(&path).ok()?;
        rows.iter()
            .any(|row| row.source_partition == source)
            .then(|| to_nanos(modified))
    }

    /// Records `mtime_nanos` as processed for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn record(&self, key: PartitionKey, mtime_nanos: i64) -> Result<()> {
        let mut meta = self.load(key).unwrap_or_default();
        meta.hour_mtimes.insert(key.hour_str(), mtime_nanos);
        let json = serde_json::to_vec(&meta).map_err(Error::from)?;
        atomic_write(&self.layout.date_meta(key.date()), &json)
    }

    /// Committed raw files for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the hour directory cannot be listed.
    pub fn raw_files(&self, kind: RawKind, key: PartitionKey) -> Result<Vec<PathBuf>> {
        layout::parquet_files(&self.layout.raw_hour_dir(kind, key))
    }

    /// Raw files for `key` modified strictly after `since` (all files when `None`).
    ///
    /// # Errors
    ///
    /// Returns an error if the hour directory cannot be listed.
    pub fn raw_files_newer_than(
        &self,
        kind: RawKind,
        key: PartitionKey,
        since: Option<i64>,
    ) -> Result<Vec<PathBuf>> {
        let files = self.raw_files(kind, key)?;
        let Some(since) = since else {
            return Ok(files);
        };
        Ok(files
            .into_iter()
            .filter(|f| layout::modified(f).is_some_and(|m| to_nanos(m) > since))
            .collect())
    }

    fn any_newer(&self, kind: RawKind, key: PartitionKey, since: Option<i64>) -> Result<bool> {
        Ok(!self.raw_files_newer_than(kind, key, since)?.is_empty())
    }

    /// Decides whether `key` needs compaction.
    ///
    /// Returns `None` when the hour is clean and should be skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a raw directory cannot be listed.
    pub fn check(&self, key: PartitionKey) -> Result<Option<DirtyReason>> {
        if self.raw_files(RawKind::Events, key)?.is_empty() {
            return Ok(None);
        }
        let last = self.last_processed(key);

        if self.layout.is_archived(key.date()) {
            let late = self.any_newer(RawKind::Events, key, last)?
                || self.any_newer(RawKind::Annotations, key, last)?;
            return Ok(late.then_some(DirtyReason::LateArrivals));
        }

        if last.is_none() && !self.layout.hourly_artifact(key).is_file() {
            return Ok(Some(DirtyReason::NoAggregate));
        }
        if self.any_newer(RawKind::Events, key, last)? {
            return Ok(Some(DirtyReason::EventsNewer));
        }
        if self.any_newer(RawKind::Annotations, key, last)? {
            return Ok(Some(DirtyReason::AnnotationsNewer));
        }
        Ok(None)
    }
}
