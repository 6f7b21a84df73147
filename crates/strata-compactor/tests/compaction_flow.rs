//! End-to-end compaction runs over a scratch data directory.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, TimeZone, Utc};
use filetime::{FileTime, set_file_mtime};

use strata_compactor::{Compactor, CompactorConfig, ingest};
use strata_core::codec;
use strata_core::layout::{DataLayout, RawKind, parquet_files};
use strata_core::metadata::MetadataIndex;
use strata_core::partition::PartitionKey;
use strata_core::record::{AggregatedRecord, Annotation, Event, EventType};
use strata_core::{Buffer, BufferConfig, PartitionWriter, StaticConfigProvider};

const T_1003: i64 = 1_735_725_780_000; // 2025-01-01T10:03Z
const T_1058: i64 = 1_735_729_080_000; // 2025-01-01T10:58Z
const T_1000: i64 = 1_735_725_600_000;
const T_1055: i64 = 1_735_728_900_000;
const T_2330: i64 = 1_735_774_200_000; // 2025-01-01T23:30Z
const T_2358: i64 = 1_735_775_880_000; // 2025-01-01T23:58Z
const T_0001_NEXT_DAY: i64 = 1_735_776_060_000; // 2025-01-02T00:01Z

struct Fixture {
    _dir: tempfile::TempDir,
    layout: DataLayout,
    writer: PartitionWriter,
    compactor: Compactor,
}

impl Fixture {
    fn new() -> Self {
        Self::with_age_off(0)
    }

    fn with_age_off(days: i64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = CompactorConfig {
            data_dir: dir.path().to_path_buf(),
            ..CompactorConfig::default()
        };
        let layout = DataLayout::new(dir.path());
        let writer = PartitionWriter::new(layout.clone()).unwrap();
        let compactor = Compactor::new(config, Arc::new(StaticConfigProvider::new(days, "")));
        Self {
            _dir: dir,
            layout,
            writer,
            compactor,
        }
    }

    fn finals(&self, key: &str) -> Vec<AggregatedRecord> {
        let key: PartitionKey = key.parse().unwrap();
        codec::read_aggregated(&self.layout.hourly_artifact(key)).unwrap()
    }
}

fn event(did: &str, event_time: i64, bytes: i64) -> Event {
    Event {
        did: did.to_string(),
        data_source: "sensor".to_string(),
        event_type: EventType::Ingress,
        event_time,
        ingest_time: event_time,
        creation_time: event_time,
        bytes,
        file_count: 1,
        flow_name: Some("intake".to_string()),
        action_name: None,
        cause: None,
        ingress_type: None,
    }
}

fn annotation(did: &str, key: &str, value: &str, at: i64) -> Annotation {
    Annotation {
        did: did.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        update_time: at,
        creation_time: at,
    }
}

/// Pushes a file's mtime into the future so it is strictly newer than anything recorded.
fn bump(path: &Path) {
    bump_by(path, 5);
}

fn bump_by(path: &Path, secs: u64) {
    let later = SystemTime::now() + Duration::from_secs(secs);
    set_file_mtime(path, FileTime::from_system_time(later)).unwrap();
}

fn at(hours_after_1003: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(T_1003).unwrap() + chrono::Duration::hours(hours_after_1003)
}

fn total_bytes(rows: &[AggregatedRecord]) -> i64 {
    rows.iter().map(|r| r.measures.total_bytes).sum()
}

fn total_events(rows: &[AggregatedRecord]) -> i64 {
    rows.iter().map(|r| r.measures.event_count).sum()
}

#[test]
fn worked_example_lands_in_two_buckets() {
    let fx = Fixture::new();
    fx.writer
        .write_events(&[event("a", T_1003, 10), event("b", T_1058, 20)])
        .unwrap();

    let report = fx.compactor.run(at(2)).unwrap();
    assert_eq!(report.hours_compacted, 1);
    assert!(!report.has_errors(), "{:?}", report.errors);

    let rows = fx.finals("20250101/10");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].bucket, T_1000);
    assert_eq!(rows[1].bucket, T_1055);
    assert!(rows.iter().all(|r| r.source_partition == "20250101/10"));

    let key: PartitionKey = "20250101/10".parse().unwrap();
    assert!(fx.layout.preagg_file(key).is_file());
    assert!(fx.layout.date_meta(key.date()).is_file());

    assert!(report.metadata_rebuilt);
    let index = MetadataIndex::load(&fx.layout.metadata_file()).unwrap();
    assert_eq!(index.data_sources, vec!["sensor"]);
    assert_eq!(index.flow_names, vec!["intake"]);
}

#[test]
fn second_run_on_unchanged_data_does_no_work() {
    let fx = Fixture::new();
    fx.writer.write_events(&[event("a", T_1003, 10)]).unwrap();

    assert_eq!(fx.compactor.run(at(2)).unwrap().hours_compacted, 1);
    let again = fx.compactor.run(at(2)).unwrap();
    assert_eq!(again.hours_dirty, 0);
    assert_eq!(again.hours_compacted, 0);
    assert!(!again.metadata_rebuilt);
}

#[test]
fn late_annotation_updates_row_without_double_counting() {
    let fx = Fixture::new();
    fx.writer.write_events(&[event("x", T_1003, 10)]).unwrap();
    fx.compactor.run(at(2)).unwrap();
    assert!(fx.finals("20250101/10")[0].annotations.is_empty());

    let files = fx
        .writer
        .write_annotations(&[annotation("x", "env", "prod", T_1003 + 1000)])
        .unwrap();
    bump(&files[0]);

    let report = fx.compactor.run(at(2)).unwrap();
    assert_eq!(report.hours_compacted, 1);

    let rows = fx.finals("20250101/10");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].annotations.get("env"), Some("prod"));
    assert_eq!(rows[0].measures.event_count, 1);
    assert_eq!(rows[0].measures.total_bytes, 10);
}

#[test]
fn creation_hours_share_event_hour_artifacts() {
    let fx = Fixture::new();
    // Created at 11:xx but happened at 10:03: lands in the 10:00 artifact.
    let mut late = event("late", T_1003, 5);
    late.creation_time = T_1003 + 3_600_000;
    fx.writer
        .write_events(&[event("a", T_1003, 10), late])
        .unwrap();

    fx.compactor.run(at(3)).unwrap();
    let rows = fx.finals("20250101/10");
    assert_eq!(total_bytes(&rows), 15);
    let sources: Vec<&str> = rows.iter().map(|r| r.source_partition.as_str()).collect();
    assert!(sources.contains(&"20250101/10"));
    assert!(sources.contains(&"20250101/11"));

    // Recompacting one creation hour leaves the other's rows alone.
    let files = fx.writer.write_events(&[event("b", T_1003, 1)]).unwrap();
    bump(&files[0]);
    let report = fx.compactor.run(at(3)).unwrap();
    assert_eq!(report.hours_compacted, 1);
    assert_eq!(total_bytes(&fx.finals("20250101/10")), 16);
}

#[test]
fn aged_hours_are_archived_and_consolidated() {
    let fx = Fixture::new();
    let key: PartitionKey = "20250101/10".parse().unwrap();
    fx.writer
        .write_events(&[event("a", T_1003, 10), event("b", T_1058, 20)])
        .unwrap();

    let report = fx.compactor.run(at(24 * 5)).unwrap();
    assert_eq!(report.hours_compacted, 1);
    assert_eq!(report.dates_consolidated, 1);

    assert!(!fx.layout.raw_hour_dir(RawKind::Events, key).exists());
    assert!(!fx.layout.preagg_file(key).exists());
    assert!(fx.layout.is_archived(key.date()));
    assert!(parquet_files(&fx.layout.hourly_dir(key.date())).unwrap().is_empty());

    let daily = codec::read_aggregated(&fx.layout.daily_artifact(key.date())).unwrap();
    assert_eq!(daily.len(), 1);
    assert_eq!(daily[0].bucket, T_1000);
    assert_eq!(daily[0].measures.event_count, 2);

    // Consolidating again is a no-op.
    let again = fx.compactor.run(at(24 * 5)).unwrap();
    assert_eq!(again.dates_consolidated, 0);
    assert_eq!(again.hours_dirty, 0);
}

#[test]
fn late_arrivals_accumulate_into_daily_artifact() {
    let fx = Fixture::new();
    let key: PartitionKey = "20250101/10".parse().unwrap();
    fx.writer.write_events(&[event("a", T_1003, 10)]).unwrap();
    fx.compactor.run(at(24 * 5)).unwrap();
    assert!(fx.layout.is_archived(key.date()));

    let files = fx.writer.write_events(&[event("b", T_1058, 7)]).unwrap();
    bump(&files[0]);

    let report = fx.compactor.run(at(24 * 5)).unwrap();
    assert_eq!(report.hours_compacted, 1);
    let daily = codec::read_aggregated(&fx.layout.daily_artifact(key.date())).unwrap();
    assert_eq!(total_events(&daily), 2);
    assert_eq!(total_bytes(&daily), 17);
    assert!(daily.iter().all(|r| r.bucket == T_1000));
    assert!(!fx.layout.raw_hour_dir(RawKind::Events, key).exists());

    let again = fx.compactor.run(at(24 * 5)).unwrap();
    assert_eq!(again.hours_dirty, 0);
    let daily = codec::read_aggregated(&fx.layout.daily_artifact(key.date())).unwrap();
    assert_eq!(total_bytes(&daily), 17);
}

#[test]
fn live_writer_blocks_raw_deletion() {
    let fx = Fixture::new();
    let key: PartitionKey = "20250101/10".parse().unwrap();
    fx.writer.write_events(&[event("a", T_1003, 10)]).unwrap();
    let hour_dir = fx.layout.raw_hour_dir(RawKind::Events, key);
    std::fs::write(hour_dir.join(".inflight.parquet.tmp"), b"partial").unwrap();

    let report = fx.compactor.run(at(24 * 5)).unwrap();
    assert_eq!(report.hours_compacted, 1);
    assert_eq!(report.dates_consolidated, 1);

    assert!(hour_dir.join(".inflight.parquet.tmp").exists());
    assert_eq!(parquet_files(&hour_dir).unwrap().len(), 1);
    assert!(!fx.layout.preagg_file(key).exists());

    // Once the writer is gone the leftover raw hour is dropped without recounting it.
    std::fs::remove_file(hour_dir.join(".inflight.parquet.tmp")).unwrap();
    let again = fx.compactor.run(at(24 * 5)).unwrap();
    assert_eq!(again.hours_dirty, 0);
    assert!(!hour_dir.exists());
    let daily = codec::read_aggregated(&fx.layout.daily_artifact(key.date())).unwrap();
    assert_eq!(total_events(&daily), 1);
}

#[test]
fn hours_compacted_while_live_drop_raw_inputs_once_aged() {
    let fx = Fixture::new();
    let key: PartitionKey = "20250101/10".parse().unwrap();
    fx.writer.write_events(&[event("a", T_1003, 10)]).unwrap();
    fx.writer
        .write_annotations(&[annotation("a", "env", "prod", T_1003 + 1000)])
        .unwrap();

    let live = fx.compactor.run(at(2)).unwrap();
    assert_eq!(live.hours_compacted, 1);
    assert!(fx.layout.raw_hour_dir(RawKind::Events, key).exists());
    assert!(fx.layout.preagg_file(key).exists());

    let aged = fx.compactor.run(at(24 * 5)).unwrap();
    assert_eq!(aged.hours_dirty, 0);
    assert_eq!(aged.dates_consolidated, 1);
    assert!(!fx.layout.raw_hour_dir(RawKind::Events, key).exists());
    assert!(!fx.layout.raw_hour_dir(RawKind::Annotations, key).exists());
    assert!(!fx.layout.preagg_file(key).exists());
    assert!(!fx.layout.preagg_dir().join("20250101").exists());

    let daily = codec::read_aggregated(&fx.layout.daily_artifact(key.date())).unwrap();
    assert_eq!(total_events(&daily), 1);
    assert_eq!(daily[0].annotations.get("env"), Some("prod"));
}

#[test]
fn late_annotation_converges_when_another_day_wrote_the_artifact_first() {
    let fx = Fixture::new();
    let now = Utc.with_ymd_and_hms(2025, 1, 2, 2, 0, 0).unwrap();

    // Created just after midnight, happened at 23:58 the day before.
    let mut early = event("a", T_2358, 5);
    early.creation_time = T_0001_NEXT_DAY;
    fx.writer.write_events(&[early]).unwrap();
    assert_eq!(fx.compactor.run(now).unwrap().hours_compacted, 1);
    assert_eq!(fx.finals("20250101/23")[0].source_partition, "20250102/00");

    let files = fx.writer.write_events(&[event("b", T_2330, 7)]).unwrap();
    bump(&files[0]);
    let report = fx.compactor.run(now).unwrap();
    assert_eq!(report.hours_compacted, 1);
    let key: PartitionKey = "20250101/23".parse().unwrap();
    assert!(fx.layout.preagg_file(key).is_file());

    let files = fx
        .writer
        .write_annotations(&[annotation("b", "env", "prod", T_2330 + 1000)])
        .unwrap();
    bump_by(&files[0], 30);
    let report = fx.compactor.run(now).unwrap();
    assert_eq!(report.hours_compacted, 1);

    let rows = fx.finals("20250101/23");
    assert_eq!(total_events(&rows), 2);
    assert_eq!(total_bytes(&rows), 12);
    let own: Vec<&AggregatedRecord> = rows
        .iter()
        .filter(|r| r.source_partition == "20250101/23")
        .collect();
    assert_eq!(own.len(), 1);
    assert_eq!(own[0].annotations.get("env"), Some("prod"));
    assert_eq!(own[0].measures.event_count, 1);
}

#[test]
fn corrupt_raw_file_is_quarantined() {
    let fx = Fixture::new();
    let key: PartitionKey = "20250101/10".parse().unwrap();
    fx.writer.write_events(&[event("a", T_1003, 10)]).unwrap();
    fx.writer.write_events(&[event("b", T_1003, 20)]).unwrap();
    let junk = fx
        .layout
        .raw_hour_dir(RawKind::Events, key)
        .join("000000_000000_junk.parquet");
    std::fs::write(&junk, b"PAR1 not really").unwrap();

    let report = fx.compactor.run(at(2)).unwrap();
    assert_eq!(report.hours_compacted, 1);
    assert_eq!(report.corrupt_files_removed, 1);
    assert!(!junk.exists());
    assert_eq!(total_bytes(&fx.finals("20250101/10")), 30);
}

#[test]
fn age_off_runs_before_compaction() {
    let fx = Fixture::with_age_off(7);
    fx.writer.write_events(&[event("old", T_1003, 10)]).unwrap();

    let report = fx.compactor.run(at(24 * 30)).unwrap();
    assert!(report.partitions_aged_off >= 1);
    assert_eq!(report.hours_dirty, 0);
    assert!(!fx.layout.raw_dir(RawKind::Events).join("20250101").exists());
}

#[test]
fn idle_compactor_accepts_a_run() {
    let fx = Fixture::new();
    assert!(!fx.compactor.is_running());
    assert!(fx.compactor.run(at(2)).is_some());
}

#[test]
fn buffer_flush_writes_and_triggers_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    let config = CompactorConfig {
        data_dir: dir.path().to_path_buf(),
        ..CompactorConfig::default()
    };
    let compactor = Arc::new(Compactor::new(config, Arc::new(StaticConfigProvider::new(0, ""))));
    let writer = Arc::new(PartitionWriter::new(layout.clone()).unwrap());
    let buffer = Buffer::new(
        BufferConfig {
            flush_count: 2,
            ..BufferConfig::named("events")
        },
        ingest::event_flush_fn(writer, compactor),
    );

    let created = Utc::now() - chrono::Duration::hours(1);
    let key = PartitionKey::from_datetime(created);
    let ms = created.timestamp_millis();
    buffer.add(event("a", ms, 1)).unwrap();
    buffer.add(event("b", ms, 2)).unwrap();
    assert!(buffer.is_empty());

    let artifact = layout.hourly_artifact(key);
    for _ in 0..200 {
        if artifact.is_file() {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    let rows = codec::read_aggregated(&artifact).unwrap();
    assert_eq!(total_bytes(&rows), 3);
}
