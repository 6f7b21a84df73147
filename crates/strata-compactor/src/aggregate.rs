//! Stage-1 and Stage-2 aggregation.
//!
//! Stage 1 groups raw events by DID, 5-minute event-time bucket and
//! dimensions, attaching each DID's resolved annotations. Stage 2 drops the
//! DID and re-groups by event hour. All functions here are pure; file I/O
//! lives in [`crate::compactor`].

use std::collections::{BTreeMap, HashMap};

use strata_core::annotations::AnnotationMap;
use strata_core::partition::{BUCKET_WIDTH_MS, PartitionKey, bucket_start};
use strata_core::record::{AggregatedRecord, Dimensions, Event, Measures, PreAggregatedRecord};

/// How Stage-2 rows are combined with an existing final artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Rows previously contributed by the same source partition are replaced.
    Replace,
    /// Rows are summed into whatever the artifact already holds.
    Accumulate,
}

type PreaggKey = (String, i64, Dimensions);
type FinalKey = (i64, Dimensions, AnnotationMap, String);

/// Stage 1: aggregates raw events into DID-keyed 5-minute rows.
///
/// DIDs absent from `annotations` get an empty annotation map.
#[must_use]
pub fn stage1(
    events: &[Event],
    annotations: &HashMap<String, AnnotationMap>,
) -> Vec<PreAggregatedRecord> {
    let mut groups: BTreeMap<PreaggKey, Measures> = BTreeMap::new();
    for event in events {
        let key = (
            event.did.clone(),
            bucket_start(event.event_time, BUCKET_WIDTH_MS),
            Dimensions::of(event),
        );
        *groups.entry(key).or_default() += Measures::of(event);
    }

    groups
        .into_iter()
        .map(|((did, bucket, dims), measures)| PreAggregatedRecord {
            annotations: annotations.get(&did).cloned().unwrap_or_default(),
            did,
            bucket,
            dims,
            measures,
        })
        .collect()
}

/// Merges a fresh Stage-1 result into an existing intermediate.
///
/// Rows with the same `(DID, bucket, dimensions)` are summed. Annotations
/// from `fresh` win per key.
#[must_use]
pub fn merge_preagg(
    existing: Vec<PreAggregatedRecord>,
    fresh: Vec<PreAggregatedRecord>,
) -> Vec<PreAggregatedRecord> {
    let mut groups: BTreeMap<PreaggKey, (AnnotationMap, Measures)> = BTreeMap::new();
    for row in existing.into_iter().chain(fresh) {
        let slot = groups
            .entry((row.did, row.bucket, row.dims))
            .or_default();
        slot.0.merge_last_wins(&row.annotations);
        slot.1 += row.measures;
    }
    groups
        .into_iter()
        .map(|((did, bucket, dims), (annotations, measures))| PreAggregatedRecord {
            did,
            bucket,
            dims,
            annotations,
            measures,
        })
        .collect()
}

/// Overlays newly resolved annotations onto intermediate rows.
pub fn apply_annotations(
    rows: &mut [PreAggregatedRecord],
    annotations: &HashMap<String, AnnotationMap>,
) {
    for row in rows {
        if let Some(latest) = annotations.get(&row.did) {
            row.annotations.merge_last_wins(latest);
        }
    }
}

/// Stage 2: drops DIDs and groups intermediate rows by event hour.
///
/// Every output row is tagged with `source` (the creation-hour partition
/// that produced the intermediate).
#[must_use]
pub fn stage2(
    rows: &[PreAggregatedRecord],
    source: PartitionKey,
) -> BTreeMap<PartitionKey, Vec<AggregatedRecord>> {
    let source = source.to_string();
    let mut by_hour: BTreeMap<PartitionKey, Vec<AggregatedRecord>> = BTreeMap::new();
    for row in rows {
        let Some(event_hour) = PartitionKey::from_millis(row.bucket) else {
            tracing::warn!(bucket = row.bucket, "dropping row with out-of-range bucket");
            continue;
        };
        by_hour.entry(event_hour).or_default().push(AggregatedRecord {
            bucket: row.bucket,
            dims: row.dims.clone(),
            annotations: row.annotations.clone(),
            source_partition: source.clone(),
            measures: row.measures,
        });
    }
    by_hour
        .into_iter()
        .map(|(hour, rows)| (hour, regroup(rows, None)))
        .collect()
}

/// Re-groups final rows, optionally widening buckets to `width_ms`.
///
/// Grouping is by `(bucket, dimensions, annotations, source partition)`.
#[must_use]
pub fn regroup(rows: Vec<AggregatedRecord>, width_ms: Option<i64>) -> Vec<AggregatedRecord> {
    let mut groups: BTreeMap<FinalKey, Measures> = BTreeMap::new();
    for row in rows {
        let bucket = width_ms.map_or(row.bucket, |w| bucket_start(row.bucket, w));
        *groups
            .entry((bucket, row.dims, row.annotations, row.source_partition))
            .or_default() += row.measures;
    }
    groups
        .into_iter()
        .map(|((bucket, dims, annotations, source_partition), measures)| AggregatedRecord {
            bucket,
            dims,
            annotations,
            source_partition,
            measures,
        })
        .collect()
}

/// Combines Stage-2 rows for one source partition with an existing artifact.
#[must_use]
pub fn combine(
    existing: Vec<AggregatedRecord>,
    fresh: Vec<AggregatedRecord>,
    source: PartitionKey,
    mode: WriteMode,
    width_ms: Option<i64>,
) -> Vec<AggregatedRecord> {
    let source = source.to_string();
    let kept = existing
        .into_iter()
        .filter(|row| mode == WriteMode::Accumulate || row.source_partition != source);
    regroup(kept.chain(fresh).collect(), width_ms)
}
