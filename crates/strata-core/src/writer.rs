//! Raw partition writer.
//!
//! Each flush writes one new file per creation-hour partition. Files are
//! written as `.{name}.tmp` inside the hour directory and renamed into place,
//! so the compactor only ever lists complete files. The `.tmp` marker is also
//! what the archivist looks for before deleting an hour directory.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

use crate::codec;
use crate::error::{Error, Result};
use crate::layout::{DataLayout, RawKind, TMP_SUFFIX};
use crate::partition::PartitionKey;
use crate::record::{Annotation, Event};

/// Writes raw event and annotation batches under their creation-hour directories.
#[derive(Debug)]
pub struct PartitionWriter {
    layout: DataLayout,
    seq: AtomicU64,
}

impl PartitionWriter {
    /// Creates a writer, ensuring the category directories exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn new(layout: DataLayout) -> Result<Self> {
        layout.ensure_dirs()?;
        Ok(Self {
            layout,
            seq: AtomicU64::new(0),
        })
    }

    /// Data layout the writer targets.
    #[must_use]
    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    /// Writes events, one file per creation hour. Returns the files written.
    ///
    /// # Errors
    ///
    /// Returns the first encoding or I/O failure. Files already written for
    /// other partitions in the same call are kept.
    pub fn write_events(&self, events: &[Event]) -> Result<Vec<PathBuf>> {
        let grouped = group_by_partition(events, |e| e.creation_time)?;
        let now = Utc::now();
        let mut written = Vec::with_capacity(grouped.len());
        for (key, rows) in grouped {
            let rows: Vec<Event> = rows.into_iter().cloned().collect();
            let bytes = codec::encode_events(&rows)?;
            written.push(self.write_file(RawKind::Events, key, &bytes, now)?);
        }
        Ok(written)
    }

    /// Writes annotations, one file per partition hour.
    ///
    /// Annotations without a creation time are placed by update time.
    ///
    /// # Errors
    ///
    /// Returns the first encoding or I/O failure.
    pub fn write_annotations(&self, annotations: &[Annotation]) -> Result<Vec<PathBuf>> {
        let grouped = group_by_partition(annotations, Annotation::partition_time)?;
        let now = Utc::now();
        let mut written = Vec::with_capacity(grouped.len());
        for (key, rows) in grouped {
            let rows: Vec<Annotation> = rows.into_iter().cloned().collect();
            let bytes = codec::encode_annotations(&rows)?;
            written.push(self.write_file(RawKind::Annotations, key, &bytes, now)?);
        }
        Ok(written)
    }

    fn write_file(
        &self,
        kind: RawKind,
        key: PartitionKey,
        bytes: &[u8],
        now: DateTime<Utc>,
    ) -> Result<PathBuf> {
        let hour_dir = self.layout.raw_hour_dir(kind, key);
        fs::create_dir_all(&hour_dir).map_err(|e| Error::io_at("creating", &hour_dir, e))?;

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "{}_{:06}_{seq}.parquet",
            now.format("%H%M%S"),
            now.timestamp_subsec_micros()
        );
        let final_path = hour_dir.join(&name);
        let tmp = hour_dir.join(format!(".{name}{TMP_SUFFIX}"));

        write_then_rename(&tmp, &final_path, bytes)?;
        tracing::debug!(
            kind = kind.dir_name(),
            partition = %key,
            path = %final_path.display(),
            "wrote raw partition file"
        );
        Ok(final_path)
    }
}

fn group_by_partition<T>(
    rows: &[T],
    time_of: impl Fn(&T) -> i64,
) -> Result<BTreeMap<PartitionKey, Vec<&T>>> {
    let mut grouped: BTreeMap<PartitionKey, Vec<&T>> = BTreeMap::new();
    for row in rows {
        let ts = time_of(row);
        let key = PartitionKey::from_millis(ts)
            .ok_or_else(|| Error::InvalidInput(format!("timestamp out of range: {ts}")))?;
        grouped.entry(key).or_default().push(row);
    }
    Ok(grouped)
}

fn write_then_rename(tmp: &Path, target: &Path, bytes: &[u8]) -> Result<()> {
    let written = fs::File::create(tmp)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .map_err(|e| Error::io_at("writing", tmp, e));
    if let Err(e) = written {
        let _ = fs::remove_file(tmp);
        return Err(e);
    }
    fs::rename(tmp, target).map_err(|e| {
        let _ = fs::remove_file(tmp);
        Error::io_at("renaming into", target, e)
    })
}
