//! The two-stage compaction engine.
//!
//! A run sweeps aged-off partitions, then walks every date with data and
//! compacts each dirty creation hour:
//!
//! 1. load raw events (quarantining corrupt files and retrying once)
//! 2. resolve annotations for the loaded DIDs
//! 3. Stage 1: aggregate by DID, 5-minute bucket and dimensions
//! 4. write the intermediate (the Stage-1 durability boundary)
//! 5. Stage 2: drop DIDs and write one final artifact per event hour
//! 6. record the newest consumed raw mtime
//! 7. archive: delete raw inputs and the intermediate once the hour is immutable
//!
//! Clean hours past the archive threshold still go through step 7, so raw
//! inputs summarized while the hour was live are dropped once it ages out.
//! After the hours of a date, empty directories are pruned and the date is
//! consolidated to a daily artifact once it is past the archive threshold.
//! Runs are single-flight: a trigger while a run is active is dropped.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, TryLockError};

use chrono::{DateTime, NaiveDate, Utc};

use strata_core::annotations::latest_by_did;
use strata_core::codec;
use strata_core::config::ConfigProvider;
use strata_core::error::Result;
use strata_core::layout::{self, DataLayout, RawKind};
use strata_core::observability::compaction_span;
use strata_core::partition::{HOUR_MS, PartitionKey, format_date};
use strata_core::record::{AggregatedRecord, PreAggregatedRecord};

use crate::aggregate::{self, WriteMode};
use crate::age_off::{self, AgeOffReport};
use crate::archivist;
use crate::config::CompactorConfig;
use crate::date_meta::{DirtyTracker, to_nanos};
use crate::metadata_builder;
use crate::metrics::{self, RunTimer};
use crate::scanner;

/// Summary of one compaction run.
#[derive(Debug, Clone, Default)]
pub struct CompactionReport {
    /// Hours found dirty and attempted.
    pub hours_dirty: u64,
    /// Hours compacted successfully.
    pub hours_compacted: u64,
    /// Dirty hours that failed and will be retried next run.
    pub hours_failed: u64,
    /// Corrupt raw files deleted.
    pub corrupt_files_removed: u64,
    /// Dates consolidated into daily artifacts.
    pub dates_consolidated: u64,
    /// Partitions removed by age-off.
    pub partitions_aged_off: u64,
    /// Whether the metadata index was rebuilt.
    pub metadata_rebuilt: bool,
    /// Errors encountered (the run continues on non-fatal errors).
    pub errors: Vec<String>,
}

impl CompactionReport {
    /// Merges another report into this one.
    pub fn merge(&mut self, other: Self) {
        self.hours_dirty += other.hours_dirty;
        self.hours_compacted += other.hours_compacted;
        self.hours_failed += other.hours_failed;
        self.corrupt_files_removed += other.corrupt_files_removed;
        self.dates_consolidated += other.dates_consolidated;
        self.partitions_aged_off += other.partitions_aged_off;
        self.metadata_rebuilt |= other.metadata_rebuilt;
        self.errors.extend(other.errors);
    }

    /// Returns true if any errors were encountered.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// How a dirty hour is rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Plan {
    /// Only raw events newer than this mtime are read (all when `None`).
    since: Option<i64>,
    /// Merge the fresh Stage-1 rows into the existing intermediate.
    merge_intermediate: bool,
    mode: WriteMode,
}

impl Plan {
    /// `inputs_archived` is true once the hour's raw files may have been
    /// deleted: its date is consolidated, or it is past the archive threshold
    /// and has a processing record. Otherwise every raw file is still on
    /// disk and the hour is rebuilt in full.
    fn choose(inputs_archived: bool, last: Option<i64>, has_intermediate: bool) -> Self {
        match (inputs_archived, last, has_intermediate) {
            // Raw inputs seen so far live on in the intermediate.
            (true, Some(_), true) => Self {
                since: last,
                merge_intermediate: true,
                mode: WriteMode::Replace,
            },
            // Inputs already folded into final artifacts are gone; add the new ones.
            (true, _, false) => Self {
                since: last,
                merge_intermediate: false,
                mode: WriteMode::Accumulate,
            },
            _ => Self {
                since: None,
                merge_intermediate: false,
                mode: WriteMode::Replace,
            },
        }
    }
}

/// What happened to a dirty hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HourOutcome {
    Compacted { corrupt_removed: u64 },
    NoData { corrupt_removed: u64 },
}

/// Compacts raw partitions into final artifacts.
pub struct Compactor {
    config: CompactorConfig,
    layout: DataLayout,
    tracker: DirtyTracker,
    provider: Arc<dyn ConfigProvider>,
    running: Mutex<()>,
}

impl std::fmt::Debug for Compactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compactor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Compactor {
    /// Creates a compactor over `config.data_dir`.
    #[must_use]
    pub fn new(config: CompactorConfig, provider: Arc<dyn ConfigProvider>) -> Self {
        let layout = DataLayout::new(&config.data_dir);
        Self {
            tracker: DirtyTracker::new(layout.clone()),
            layout,
            config,
            provider,
            running: Mutex::new(()),
        }
    }

    /// The compactor's settings.
    #[must_use]
    pub fn config(&self) -> &CompactorConfig {
        &self.config
    }

    /// The data layout being compacted.
    #[must_use]
    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    /// Whether a run is currently in progress.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.running.try_lock(), Err(TryLockError::WouldBlock))
    }

    /// Runs one compaction pass as of `now`.
    ///
    /// Returns `None` without doing anything if another run is in progress.
    pub fn run(&self, now: DateTime<Utc>) -> Option<CompactionReport> {
        let _guard = match self.running.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                tracing::debug!("compaction already running, skipping trigger");
                return None;
            }
        };

        let timer = RunTimer::start();
        let mut report = CompactionReport::default();

        let aged = self.age_off(now);
        report.partitions_aged_off = aged.removed.len() as u64;
        report.errors.extend(aged.errors);

        match self.eligible_dates() {
            Ok(dates) => {
                for date in dates {
                    report.merge(self.compact_date(date, now));
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to list partition dates");
                report.errors.push(format!("listing dates: {e}"));
            }
        }

        if report.hours_compacted > 0 {
            match metadata_builder::rebuild(&self.layout, self.config.metadata_value_limit) {
                Ok(rebuilt) => report.metadata_rebuilt = rebuilt,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to update metadata");
                    report.errors.push(format!("metadata: {e}"));
                }
            }
        }

        timer.finish();
        tracing::info!(
            hours_dirty = report.hours_dirty,
            hours_compacted = report.hours_compacted,
            hours_failed = report.hours_failed,
            dates_consolidated = report.dates_consolidated,
            partitions_aged_off = report.partitions_aged_off,
            errors = report.errors.len(),
            "compaction run complete"
        );
        Some(report)
    }

    /// Starts a run on the blocking thread pool.
    ///
    /// Falls back to a plain thread outside a Tokio runtime. Overlapping
    /// triggers are dropped by the run itself.
    pub fn trigger_async(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let job = move || {
            let _ = this.run(Utc::now());
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            drop(handle.spawn_blocking(job));
        } else if let Err(e) = std::thread::Builder::new()
            .name("strata-compaction".to_string())
            .spawn(job)
        {
            tracing::warn!(error = %e, "failed to spawn compaction thread");
        }
    }

    /// Runs only the age-off sweep.
    pub fn age_off(&self, now: DateTime<Utc>) -> AgeOffReport {
        let report = age_off::age_off(&self.layout, self.provider.age_off_days(), now);
        for error in &report.errors {
            tracing::warn!(error = %error, "age-off error");
        }
        report
    }

    /// Dates with anything to compact, consolidate or clean up.
    ///
    /// # Errors
    ///
    /// Returns an error if a category directory cannot be listed.
    pub fn eligible_dates(&self) -> Result<Vec<NaiveDate>> {
        let mut dates = BTreeSet::new();
        for dir in [
            self.layout.raw_dir(RawKind::Events),
            self.layout.raw_dir(RawKind::Annotations),
            self.layout.preagg_dir(),
            self.layout.aggregated_dir(),
        ] {
            dates.extend(DataLayout::date_dirs(&dir)?);
        }
        Ok(dates.into_iter().collect())
    }

    fn compact_date(&self, date: NaiveDate, now: DateTime<Utc>) -> CompactionReport {
        let mut report = CompactionReport::default();
        let date_str = format_date(date);

        for key in PartitionKey::hours_of(date) {
            let span = compaction_span(&date_str, &key.hour_str());
            let _entered = span.enter();

            let reason = match self.tracker.check(key) {
                Ok(Some(reason)) => reason,
                Ok(None) => {
                    self.archive_clean_hour(key, now);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dirty check failed");
                    metrics::record_hour_skipped("failed");
                    report.errors.push(format!("{key}: {e}"));
                    continue;
                }
            };
            tracing::info!(reason = %reason, "hour is dirty");
            metrics::record_dirty_hour(reason.as_str());
            report.hours_dirty += 1;

            match self.compact_hour(key, now) {
                Ok(HourOutcome::Compacted { corrupt_removed }) => {
                    metrics::record_hour_compacted();
                    report.hours_compacted += 1;
                    report.corrupt_files_removed += corrupt_removed;
                }
                Ok(HourOutcome::NoData { corrupt_removed }) => {
                    metrics::record_hour_skipped("no_data");
                    report.corrupt_files_removed += corrupt_removed;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "compaction failed, will retry next run");
                    metrics::record_hour_skipped("failed");
                    report.hours_failed += 1;
                    report.errors.push(format!("{key}: {e}"));
                }
            }
        }

        if let Err(e) =
            archivist::cleanup_empty_date_dirs(&self.layout, date, self.config.stale_tmp_age())
        {
            tracing::debug!(date = %date_str, error = %e, "date directory cleanup failed");
        }

        match archivist::consolidate_daily(&self.layout, date, now, self.config.archive_threshold())
        {
            Ok(true) => report.dates_consolidated += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(date = %date_str, error = %e, "daily consolidation failed");
                report.errors.push(format!("{date_str}: {e}"));
            }
        }
        report
    }

    fn compact_hour(&self, key: PartitionKey, now: DateTime<Utc>) -> Result<HourOutcome> {
        let archived = self.layout.is_archived(key.date());
        let last = self.tracker.last_processed(key);
        let inputs_archived = archived
            || (last.is_some()
                && archivist::is_hour_archivable(key, now, self.config.archive_threshold()));
        let preagg_path = self.layout.preagg_file(key);
        let mut plan = Plan::choose(inputs_archived, last, preagg_path.is_file());

        let event_files = self
            .tracker
            .raw_files_newer_than(RawKind::Events, key, plan.since)?;
        let annotation_files = self.tracker.raw_files(RawKind::Annotations, key)?;
        let consumed = layout::max_mtime(event_files.iter().chain(&annotation_files))
            .map(to_nanos)
            .max(last);

        tracing::info!(
            event_files = event_files.len(),
            annotation_files = annotation_files.len(),
            archived,
            mode = ?plan.mode,
            "compacting hour"
        );

        let (events, mut corrupt_removed) = load(&event_files, codec::read_events)?;

        let existing = if plan.merge_intermediate {
            match codec::read_preagg(&preagg_path) {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(error = %e, "intermediate unreadable, accumulating new input only");
                    plan.merge_intermediate = false;
                    plan.mode = WriteMode::Accumulate;
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        if events.is_empty() && existing.is_empty() {
            if let Some(consumed) = consumed {
                self.tracker.record(key, consumed)?;
            }
            self.archive_hour(key, archived, now);
            return Ok(HourOutcome::NoData { corrupt_removed });
        }

        let dids: HashSet<&str> = events
            .iter()
            .map(|e| e.did.as_str())
            .chain(existing.iter().map(|r| r.did.as_str()))
            .collect();
        let annotations = match load(&annotation_files, codec::read_annotations) {
            Ok((rows, removed)) => {
                corrupt_removed += removed;
                latest_by_did(&rows, &dids)
            }
            Err(e) => {
                tracing::warn!(error = %e, "loading annotations failed, continuing without");
                HashMap::new()
            }
        };

        let fresh = aggregate::stage1(&events, &annotations);
        let rows = if plan.merge_intermediate {
            let mut existing = existing;
            aggregate::apply_annotations(&mut existing, &annotations);
            aggregate::merge_preagg(existing, fresh)
        } else {
            fresh
        };

        if plan.mode == WriteMode::Replace {
            codec::write_preagg(&preagg_path, &rows)?;
        }
        tracing::info!(input_events = events.len(), preagg_rows = rows.len(), "stage 1 complete");

        let written = self.write_finals(key, &rows, plan.mode)?;
        tracing::info!(artifacts = written, "stage 2 complete");

        if let Some(consumed) = consumed {
            self.tracker.record(key, consumed)?;
        }
        self.archive_hour(key, archived, now);
        Ok(HourOutcome::Compacted { corrupt_removed })
    }

    /// Stage 2: writes the hour's rows into every final artifact they touch.
    fn write_finals(
        &self,
        source: PartitionKey,
        rows: &[PreAggregatedRecord],
        mode: WriteMode,
    ) -> Result<usize> {
        let mut targets: BTreeMap<PathBuf, (Option<i64>, Vec<AggregatedRecord>)> = BTreeMap::new();
        for (event_hour, fresh) in aggregate::stage2(rows, source) {
            let date = event_hour.date();
            let (path, width) = if self.layout.is_archived(date) {
                (self.layout.daily_artifact(date), Some(HOUR_MS))
            } else {
                (self.layout.hourly_artifact(event_hour), None)
            };
            let slot = targets.entry(path).or_insert_with(|| (width, Vec::new()));
            slot.1.extend(fresh);
        }

        let mut merged = Vec::with_capacity(targets.len());
        for (path, (width, fresh)) in targets {
            let existing = read_existing_artifact(&path)?;
            merged.push((path, aggregate::combine(existing, fresh, source, mode, width)));
        }
        for (path, rows) in &merged {
            codec::write_aggregated(path, rows)?;
        }
        Ok(merged.len())
    }

    /// Archives a clean hour that still has raw inputs or an intermediate.
    fn archive_clean_hour(&self, key: PartitionKey, now: DateTime<Utc>) {
        let leftovers = [RawKind::Events, RawKind::Annotations]
            .into_iter()
            .any(|kind| self.layout.raw_hour_dir(kind, key).is_dir())
            || self.layout.preagg_file(key).is_file();
        if leftovers {
            self.archive_hour(key, self.layout.is_archived(key.date()), now);
        }
    }

    fn archive_hour(&self, key: PartitionKey, archived: bool, now: DateTime<Utc>) {
        let threshold = self.config.archive_threshold();
        if !archived && !archivist::is_hour_archivable(key, now, threshold) {
            return;
        }
        let stale = self.config.stale_tmp_age();
        let mut all_removed = true;
        for kind in [RawKind::Events, RawKind::Annotations] {
            let dir = self.layout.raw_hour_dir(kind, key);
            if let Err(e) = archivist::safe_remove_dir(&dir, stale) {
                tracing::warn!(dir = %dir.display(), error = %e, "failed to remove raw directory");
                all_removed = false;
            }
        }
        if all_removed {
            let preagg = self.layout.preagg_file(key);
            if let Err(e) = layout::remove_file_if_exists(&preagg) {
                tracing::warn!(path = %preagg.display(), error = %e, "failed to remove intermediate");
            }
        }
    }
}

/// Reads every file, quarantining corrupt ones and retrying once.
///
/// Returns the rows and the number of files removed.
fn load<T>(files: &[PathBuf], read: fn(&Path) -> Result<Vec<T>>) -> Result<(Vec<T>, u64)> {
    match read_all(files, read) {
        Ok(rows) => Ok((rows, 0)),
        Err(e) if e.is_corrupt() => {
            tracing::warn!(error = %e, files = files.len(), "load failed, scanning for corrupt files");
            let removed = scanner::quarantine(files);
            let remaining: Vec<PathBuf> = files
                .iter()
                .filter(|f| !removed.contains(f))
                .cloned()
                .collect();
            let removed = removed.len() as u64;
            if remaining.is_empty() {
                return Ok((Vec::new(), removed));
            }
            Ok((read_all(&remaining, read)?, removed))
        }
        Err(e) => Err(e),
    }
}

fn read_all<T>(files: &[PathBuf], read: fn(&Path) -> Result<Vec<T>>) -> Result<Vec<T>> {
    let mut rows = Vec::new();
    for file in files {
        rows.extend(read(file)?);
    }
    Ok(rows)
}

fn read_existing_artifact(path: &Path) -> Result<Vec<AggregatedRecord>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }
    match codec::read_aggregated(path) {
        Ok(rows) => Ok(rows),
        Err(e) if e.is_corrupt() => {
            tracing::warn!(path = %path.display(), error = %e, "overwriting unreadable final artifact");
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_full_rebuild_while_live() {
        for (last, has_intermediate) in [(Some(5), true), (Some(5), false), (None, false)] {
            let plan = Plan::choose(false, last, has_intermediate);
            assert_eq!(plan.since, None);
            assert!(!plan.merge_intermediate);
            assert_eq!(plan.mode, WriteMode::Replace);
        }
        assert_eq!(Plan::choose(true, None, true).mode, WriteMode::Replace);
    }

    #[test]
    fn plan_merges_intermediate_for_archived_dates() {
        let plan = Plan::choose(true, Some(5), true);
        assert_eq!(plan.since, Some(5));
        assert!(plan.merge_intermediate);
        assert_eq!(plan.mode, WriteMode::Replace);
    }

    #[test]
    fn plan_accumulates_once_intermediate_is_gone() {
        for last in [Some(5), None] {
            let plan = Plan::choose(true, last, false);
            assert_eq!(plan.since, last);
            assert!(!plan.merge_intermediate);
            assert_eq!(plan.mode, WriteMode::Accumulate);
        }
    }

    #[test]
    fn report_merge_accumulates() {
        let mut a = CompactionReport {
            hours_compacted: 1,
            ..CompactionReport::default()
        };
        a.merge(CompactionReport {
            hours_compacted: 2,
            metadata_rebuilt: true,
            errors: vec!["x".into()],
            ..CompactionReport::default()
        });
        assert_eq!(a.hours_compacted, 3);
        assert!(a.metadata_rebuilt);
        assert!(a.has_errors());
    }
}
