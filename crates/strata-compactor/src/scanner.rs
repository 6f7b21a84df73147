//! Corruption scanner.
//!
//! When a batch of raw files fails to load, [`find_corrupt`] bisects the
//! candidate list to isolate the unreadable files using batched probes, and
//! [`quarantine`] deletes them so the load can be retried without them.

use std::ops::RangeInclusive;
use std::path::PathBuf;

use strata_core::codec;
use strata_core::layout::remove_file_if_exists;

use crate::metrics;

/// Result of a bisection scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Indices of unreadable candidates, ascending.
    pub corrupt: Vec<usize>,
    /// Number of batched probes issued.
    pub probes: usize,
}

/// Finds the unreadable members of `0..len`.
///
/// `probe(range)` must return `true` when every candidate in `range` reads
/// cleanly. The whole range is probed first; a passing probe means the
/// original failure was not caused by corruption and nothing is reported.
/// With a single bad candidate this issues `1 + 2 * ceil(log2(len))` probes.
pub fn find_corrupt<P>(len: usize, mut probe: P) -> ScanOutcome
where
    P: FnMut(RangeInclusive<usize>) -> bool,
{
    let mut outcome = ScanOutcome::default();
    if len == 0 {
        return outcome;
    }
    outcome.probes += 1;
    if probe(0..=len - 1) {
        return outcome;
    }
    bisect(0, len - 1, &mut probe, &mut outcome);
    outcome
}

/// `low..=high` is known to fail.
fn bisect<P>(low: usize, high: usize, probe: &mut P, outcome: &mut ScanOutcome)
where
    P: FnMut(RangeInclusive<usize>) -> bool,
{
    if low == high {
        outcome.corrupt.push(low);
        return;
    }
    let mid = low + (high - low) / 2;

    outcome.probes += 1;
    if !probe(low..=mid) {
        bisect(low, mid, probe, outcome);
    }
    outcome.probes += 1;
    if !probe(mid + 1..=high) {
        bisect(mid + 1, high, probe, outcome);
    }
}

/// Isolates and deletes unreadable Parquet files among `files`.
///
/// Returns the deleted paths. Files that fail to delete are logged and left
/// in place.
pub fn quarantine(files: &[PathBuf]) -> Vec<PathBuf> {
    let outcome = find_corrupt(files.len(), |range| codec::count_rows(&files[range]).is_ok());

    let mut removed = Vec::with_capacity(outcome.corrupt.len());
    for idx in outcome.corrupt {
        let path = &files[idx];
        match remove_file_if_exists(path) {
            Ok(_) => {
                tracing::warn!(
                    path = %path.display(),
                    metric = "strata_corrupt_files_removed_total",
                    "removed corrupt file"
                );
                removed.push(path.clone());
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to remove corrupt file");
            }
        }
    }
    metrics::record_corrupt_files_removed(removed.len() as u64);
    tracing::debug!(
        candidates = files.len(),
        probes = outcome.probes,
        removed = removed.len(),
        "corruption scan complete"
    );
    removed
}
