//! Contract tests for the ingestion path: buffer to partition writer to layout.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;

use strata_core::codec;
use strata_core::layout::parquet_files;
use strata_core::prelude::*;

fn event(did: &str, creation_time: i64) -> Event {
    Event {
        did: did.to_string(),
        data_source: "sensor".to_string(),
        event_type: EventType::Ingress,
        event_time: creation_time,
        ingest_time: creation_time,
        creation_time,
        bytes: 100,
        file_count: 1,
        flow_name: Some("flow".to_string()),
        action_name: None,
        cause: None,
        ingress_type: None,
    }
}

#[test]
fn buffered_events_land_in_creation_hour_directories() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    let writer = Arc::new(PartitionWriter::new(layout.clone()).unwrap());

    let sink = Arc::clone(&writer);
    let flush_fn: FlushFn<Event> = Arc::new(move |batch| sink.write_events(&batch).map(|_| ()));
    let buffer = Buffer::new(
        BufferConfig {
            flush_count: 3,
            ..BufferConfig::named("events")
        },
        flush_fn,
    );

    // 2025-01-01T10:03Z twice, then 2025-01-01T12:00Z.
    buffer.add(event("a", 1_735_725_780_000)).unwrap();
    buffer.add(event("b", 1_735_725_780_000)).unwrap();
    buffer.add(event("c", 1_735_732_800_000)).unwrap();
    // Partial batch stays buffered until an explicit flush.
    buffer.add(event("d", 1_735_732_800_000)).unwrap();
    assert_eq!(buffer.len(), 1);
    buffer.flush().unwrap();

    let h10 = layout.raw_hour_dir(RawKind::Events, "20250101/10".parse().unwrap());
    let h12 = layout.raw_hour_dir(RawKind::Events, "20250101/12".parse().unwrap());
    let h10_files = parquet_files(&h10).unwrap();
    let h12_files = parquet_files(&h12).unwrap();
    assert_eq!(h10_files.len(), 1);
    assert_eq!(h12_files.len(), 2);

    let total: u64 = codec::count_rows(&h10_files).unwrap() + codec::count_rows(&h12_files).unwrap();
    assert_eq!(total, 4);
}

#[test]
fn raw_partitions_are_discoverable_as_dates() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    let writer = PartitionWriter::new(layout.clone()).unwrap();
    writer.write_events(&[event("a", 1_735_725_780_000)]).unwrap();

    let dates = DataLayout::date_dirs(&layout.raw_dir(RawKind::Events)).unwrap();
    assert_eq!(dates.len(), 1);
    assert_eq!(strata_core::partition::format_date(dates[0]), "20250101");
}
