//! Archival: safe directory deletion and daily consolidation.
//!
//! Deleting a raw partition races with the partition writer, which may be
//! creating files under the same hour directory. [`PendingDelete`] models the
//! rename-then-verify protocol as an explicit lifecycle:
//!
//! ```text
//! active ──begin()──▶ pending-delete ──finish()──▶ gone
//!                          │
//!                          └──restore()──▶ active
//! ```
//!
//! A directory is renamed to a `.deleting` sibling first. Writers only ever
//! address the original path, so once the rename lands they fail loudly
//! instead of writing into a half-deleted tree. The renamed tree is then
//! walked for temp-write markers: a fresh one means a writer raced the rename
//! and the directory is put back.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, NaiveDate, Utc};

use strata_core::codec;
use strata_core::error::{Error, Result};
use strata_core::layout::{self, DELETING_SUFFIX, DataLayout, RawKind, TMP_SUFFIX};
use strata_core::partition::{HOUR_MS, PartitionKey, end_of_day, format_date};

use crate::aggregate::regroup;
use crate::metrics;

/// A directory that has been renamed aside and awaits deletion.
#[derive(Debug)]
#[must_use = "a pending delete must be finished or restored"]
pub struct PendingDelete {
    original: PathBuf,
    staged: PathBuf,
}

impl PendingDelete {
    /// Renames `dir` to `{dir}.deleting`.
    ///
    /// A leftover `.deleting` sibling from a crashed run is removed first.
    /// Returns `None` if `dir` does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the stale sibling cannot be removed or the rename fails.
    pub fn begin(dir: &Path) -> Result<Option<Self>> {
        if !dir.exists() {
            return Ok(None);
        }
        let staged = deleting_path(dir);
        match fs::remove_dir_all(&staged) {
            Ok(()) => tracing::debug!(path = %staged.display(), "removed stale deleting directory"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io_at("removing stale", &staged, e)),
        }
        match fs::rename(dir, &staged) {
            Ok(()) => Ok(Some(Self {
                original: dir.to_path_buf(),
                staged,
            })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io_at("renaming", dir, e)),
        }
    }

    /// The path the directory was moved to.
    #[must_use]
    pub fn staged(&self) -> &Path {
        &self.staged
    }

    /// Temp-write markers younger than `stale_age`.
    ///
    /// Older markers are crash residue and are removed as they are found.
    ///
    /// # Errors
    ///
    /// Returns an error if the staged tree cannot be walked.
    pub fn live_markers(&self, stale_age: Duration, now: SystemTime) -> Result<Vec<PathBuf>> {
        let mut live = Vec::new();
        let mut pending = vec![self.staged.clone()];
        while let Some(dir) = pending.pop() {
            let entries = fs::read_dir(&dir).map_err(|e| Error::io_at("walking", &dir, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| Error::io_at("walking", &dir, e))?;
                let path = entry.path();
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !path.to_string_lossy().ends_with(TMP_SUFFIX) {
                    continue;
                }
                let age = layout::modified(&path)
                    .and_then(|m| now.duration_since(m).ok())
                    .unwrap_or_default();
                if age > stale_age {
                    tracing::debug!(path = %path.display(), "removing stale temp file");
                    layout::remove_file_if_exists(&path)?;
                } else {
                    live.push(path);
                }
            }
        }
        Ok(live)
    }

    /// Moves the directory back to its original path.
    ///
    /// If a writer has recreated the original directory in the meantime, the
    /// staged entries are moved into it one by one.
    ///
    /// # Errors
    ///
    /// Returns an error if any entry cannot be moved back. Entries that fail
    /// stay under the staged path.
    pub fn restore(self) -> Result<()> {
        match fs::rename(&self.staged, &self.original) {
            Ok(()) => return Ok(()),
            Err(e) if !self.original.exists() => {
                return Err(Error::io_at("restoring", &self.original, e));
            }
            Err(_) => {}
        }
        merge_into(&self.staged, &self.original)?;
        prune_empty(&self.staged)
    }

    /// Permanently deletes the staged tree.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be removed.
    pub fn finish(self) -> Result<()> {
        match fs::remove_dir_all(&self.staged) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io_at("removing", &self.staged, e)),
        }
    }
}

fn deleting_path(dir: &Path) -> PathBuf {
    let mut name = dir.as_os_str().to_owned();
    name.push(DELETING_SUFFIX);
    PathBuf::from(name)
}

fn merge_into(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to).map_err(|e| Error::io_at("creating", to, e))?;
    let entries = fs::read_dir(from).map_err(|e| Error::io_at("listing", from, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io_at("listing", from, e))?;
        let target = to.join(entry.file_name());
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            merge_into(&entry.path(), &target)?;
        } else if !target.exists() {
            fs::rename(entry.path(), &target).map_err(|e| Error::io_at("restoring", &target, e))?;
        }
    }
    Ok(())
}

/// Removes `dir` and its subdirectories if no files are left in them.
fn prune_empty(dir: &Path) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|e| Error::io_at("listing", dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io_at("listing", dir, e))?;
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            prune_empty(&entry.path())?;
        }
    }
    // Fails with a non-empty error when a name collision left a file behind.
    fs::remove_dir(dir).map_err(|e| Error::io_at("removing", dir, e))
}

/// Deletes `dir` unless a writer is active inside it.
///
/// A missing directory counts as deleted.
///
/// # Errors
///
/// Returns [`Error::WriteInProgress`] if a fresh temp marker was found (the
/// directory is restored), or an I/O error if any step fails.
pub fn safe_remove_dir(dir: &Path, stale_age: Duration) -> Result<()> {
    let Some(pending) = PendingDelete::begin(dir)? else {
        return Ok(());
    };
    let live = match pending.live_markers(stale_age, SystemTime::now()) {
        Ok(live) => live,
        Err(e) => {
            pending.restore()?;
            return Err(e);
        }
    };
    if !live.is_empty() {
        tracing::warn!(
            path = %dir.display(),
            active_files = live.len(),
            metric = "strata_safe_delete_aborts_total",
            "active writes detected, restored directory"
        );
        metrics::record_safe_delete_abort();
        pending.restore()?;
        return Err(Error::WriteInProgress {
            path: dir.to_path_buf(),
        });
    }
    pending.finish()
}

/// Whether the hour `key` started more than `threshold` before `now`.
#[must_use]
pub fn is_hour_archivable(key: PartitionKey, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
    key.start() < now - threshold
}

/// Whether all of `date` lies more than `threshold` before `now`.
#[must_use]
pub fn is_date_archivable(date: NaiveDate, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
    end_of_day(date) < now - threshold
}

/// Rolls a date's hourly final artifacts into one daily artifact.
///
/// Runs only when the date is past the archive threshold, no daily artifact
/// exists yet and at least one hourly artifact exists. Buckets are widened to
/// one hour. The hourly directory and the date's intermediates are removed
/// afterwards. The date's processing record is carried over so the dirty
/// check keeps working after the hourly directory is gone.
///
/// Returns `true` if a daily artifact was written.
///
/// # Errors
///
/// Returns an error if an hourly artifact cannot be read or the daily
/// artifact cannot be written. Nothing is deleted in that case.
pub fn consolidate_daily(
    layout: &DataLayout,
    date: NaiveDate,
    now: DateTime<Utc>,
    threshold: chrono::Duration,
) -> Result<bool> {
    if !is_date_archivable(date, now, threshold) || layout.is_archived(date) {
        return Ok(false);
    }
    let hourly_dir = layout.hourly_dir(date);
    let hourly = layout::parquet_files(&hourly_dir)?;
    if hourly.is_empty() {
        return Ok(false);
    }

    let mut rows = Vec::new();
    for path in &hourly {
        rows.extend(codec::read_aggregated(path)?);
    }
    let input_rows = rows.len();
    let rolled = regroup(rows, Some(HOUR_MS));
    let daily = layout.daily_artifact(date);
    codec::write_aggregated(&daily, &rolled)?;

    tracing::info!(
        date = %format_date(date),
        hourly_files = hourly.len(),
        input_rows,
        output_rows = rolled.len(),
        metric = "strata_daily_consolidations_total",
        "consolidated date into daily archive"
    );
    metrics::record_daily_consolidation();

    let meta_path = layout.date_meta(date);
    let meta = fs::read(&meta_path).ok();
    if let Err(e) = fs::remove_dir_all(&hourly_dir) {
        tracing::warn!(path = %hourly_dir.display(), error = %e, "failed to remove hourly directory");
        return Ok(true);
    }
    if let Some(meta) = meta {
        layout::atomic_write(&meta_path, &meta)?;
    }

    let preagg = layout.preagg_dir().join(format_date(date));
    if preagg.is_dir() {
        if let Err(e) = fs::remove_dir_all(&preagg) {
            tracing::warn!(path = %preagg.display(), error = %e, "failed to remove intermediates");
        }
    }
    Ok(true)
}

/// Removes a date's raw and intermediate directories once they hold no data.
///
/// Raw date directories go when none of their hour directories contains a
/// committed file. The intermediate date directory goes when it has no
/// intermediate files. Deletion uses [`safe_remove_dir`], so a date with an
/// in-flight write is left alone.
///
/// # Errors
///
/// Returns an error if a directory cannot be inspected.
pub fn cleanup_empty_date_dirs(
    layout: &DataLayout,
    date: NaiveDate,
    stale_age: Duration,
) -> Result<()> {
    for kind in [RawKind::Events, RawKind::Annotations] {
        let has_data = PartitionKey::hours_of(date).any(|key| {
            layout::parquet_files(&layout.raw_hour_dir(kind, key)).is_ok_and(|f| !f.is_empty())
        });
        let dir = layout.raw_dir(kind).join(format_date(date));
        if !has_data && dir.is_dir() {
            remove_empty(&dir, stale_age);
        }
    }

    let preagg = layout.preagg_dir().join(format_date(date));
    if preagg.is_dir() && layout::parquet_files(&preagg)?.is_empty() {
        remove_empty(&preagg, stale_age);
    }
    Ok(())
}

fn remove_empty(dir: &Path, stale_age: Duration) {
    match safe_remove_dir(dir, stale_age) {
        Ok(()) => tracing::debug!(path = %dir.display(), "removed empty date directory"),
        Err(e) => tracing::debug!(path = %dir.display(), error = %e, "kept date directory"),
    }
}

#[cfg(test)]
mod tests {
    use filetime::{FileTime, set_file_mtime};
    use strata_core::partition::{BUCKET_WIDTH_MS, start_of_day};
    use strata_core::record::{AggregatedRecord, Dimensions, EventType, Measures};

    use super::*;

    const STALE: Duration = Duration::from_secs(60);

    fn write(path: &Path, age: Duration) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"data").unwrap();
        let at = SystemTime::now() - age;
        set_file_mtime(path, FileTime::from_system_time(at)).unwrap();
    }

    #[test]
    fn removes_directory_without_markers() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("events/20250101/10");
        write(&target.join("a.parquet"), Duration::ZERO);

        safe_remove_dir(&target, STALE).unwrap();
        assert!(!target.exists());
        assert!(!deleting_path(&target).exists());
    }

    #[test]
    fn missing_directory_is_already_gone() {
        let dir = tempfile::tempdir().unwrap();
        safe_remove_dir(&dir.path().join("nope"), STALE).unwrap();
    }

    #[test]
    fn live_marker_restores_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("events/20250101/10");
        write(&target.join("a.parquet"), Duration::from_secs(3600));
        write(&target.join(".b.parquet.tmp"), Duration::from_secs(5));

        let err = safe_remove_dir(&target, STALE).unwrap_err();
        assert!(matches!(err, Error::WriteInProgress { .. }));
        assert!(target.join("a.parquet").exists());
        assert!(target.join(".b.parquet.tmp").exists());
        assert!(!deleting_path(&target).exists());
    }

    #[test]
    fn stale_marker_is_cleared_and_delete_proceeds() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("annotations/20250101/10");
        write(&target.join("nested/.old.parquet.tmp"), Duration::from_secs(600));
        write(&target.join("a.parquet"), Duration::ZERO);

        safe_remove_dir(&target, STALE).unwrap();
        assert!(!target.exists());
    }

    #[test]
    fn begin_clears_leftover_staging_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("events/20250101/10");
        write(&target.join("a.parquet"), Duration::ZERO);
        write(&deleting_path(&target).join("old.parquet"), Duration::ZERO);

        let pending = PendingDelete::begin(&target).unwrap().unwrap();
        assert!(!target.exists());
        assert!(pending.staged().join("a.parquet").exists());
        assert!(!pending.staged().join("old.parquet").exists());
        pending.finish().unwrap();
    }

    #[test]
    fn restore_merges_into_recreated_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("events/20250101/10");
        write(&target.join("a.parquet"), Duration::ZERO);

        let pending = PendingDelete::begin(&target).unwrap().unwrap();
        write(&target.join("b.parquet"), Duration::ZERO);
        pending.restore().unwrap();

        assert!(target.join("a.parquet").exists());
        assert!(target.join("b.parquet").exists());
        assert!(!deleting_path(&target).exists());
    }

    #[test]
    fn archivability_thresholds() {
        let key: PartitionKey = "20250101/10".parse().unwrap();
        let threshold = chrono::Duration::hours(72);
        let start = key.start();
        assert!(!is_hour_archivable(key, start + threshold, threshold));
        assert!(is_hour_archivable(key, start + threshold + chrono::Duration::seconds(1), threshold));

        let date = key.date();
        let late = end_of_day(date) + threshold;
        assert!(!is_date_archivable(date, late, threshold));
        assert!(is_date_archivable(date, late + chrono::Duration::seconds(1), threshold));
    }

    fn row(bucket: i64, bytes: i64, source: &str) -> AggregatedRecord {
        AggregatedRecord {
            bucket,
            dims: Dimensions {
                data_source: "X".into(),
                event_type: EventType::Ingress,
                flow_name: None,
                action_name: None,
                cause: None,
                ingress_type: None,
            },
            annotations: strata_core::AnnotationMap::new(),
            source_partition: source.into(),
            measures: Measures {
                event_count: 1,
                total_bytes: bytes,
                total_file_count: 1,
            },
        }
    }

    #[test]
    fn consolidation_rolls_up_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        let date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let ten: PartitionKey = "20250101/10".parse().unwrap();
        let eleven: PartitionKey = "20250101/11".parse().unwrap();
        let t = ten.start_millis();
        codec::write_aggregated(
            &layout.hourly_artifact(ten),
            &[row(t, 10, "20250101/10"), row(t + BUCKET_WIDTH_MS, 5, "20250101/10")],
        )
        .unwrap();
        codec::write_aggregated(
            &layout.hourly_artifact(eleven),
            &[row(eleven.start_millis(), 7, "20250101/10")],
        )
        .unwrap();
        layout::atomic_write(&layout.date_meta(date), br#"{"hour_mtimes":{"10":1}}"#).unwrap();
        write(&layout.preagg_file(ten), Duration::ZERO);

        let threshold = chrono::Duration::hours(72);
        let now = start_of_day(date) + chrono::Duration::days(10);
        assert!(consolidate_daily(&layout, date, now, threshold).unwrap());

        let daily = codec::read_aggregated(&layout.daily_artifact(date)).unwrap();
        assert_eq!(daily.len(), 2);
        assert_eq!(daily[0].bucket, t);
        assert_eq!(daily[0].measures.total_bytes, 15);
        assert_eq!(daily[1].measures.total_bytes, 7);
        assert!(layout::parquet_files(&layout.hourly_dir(date)).unwrap().is_empty());
        assert!(layout.date_meta(date).exists());
        assert!(!layout.preagg_dir().join("20250101").exists());

        // Second run: daily artifact already exists.
        assert!(!consolidate_daily(&layout, date, now, threshold).unwrap());
    }

    #[test]
    fn consolidation_waits_for_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        let key: PartitionKey = "20250101/10".parse().unwrap();
        codec::write_aggregated(&layout.hourly_artifact(key), &[row(key.start_millis(), 1, "x")])
            .unwrap();
        let now = key.start() + chrono::Duration::hours(24);
        assert!(!consolidate_daily(&layout, key.date(), now, chrono::Duration::hours(72)).unwrap());
        assert!(!layout.is_archived(key.date()));
    }

    #[test]
    fn cleanup_removes_only_empty_date_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        let key: PartitionKey = "20250101/10".parse().unwrap();
        fs::create_dir_all(layout.raw_hour_dir(RawKind::Events, key)).unwrap();
        write(
            &layout.raw_hour_dir(RawKind::Annotations, key).join("a.parquet"),
            Duration::ZERO,
        );
        fs::create_dir_all(layout.preagg_dir().join("20250101")).unwrap();

        cleanup_empty_date_dirs(&layout, key.date(), STALE).unwrap();
        assert!(!layout.raw_dir(RawKind::Events).join("20250101").exists());
        assert!(layout.raw_dir(RawKind::Annotations).join("20250101").exists());
        assert!(!layout.preagg_dir().join("20250101").exists());
    }
}
