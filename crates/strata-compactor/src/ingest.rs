//! Flush functions that connect ingestion buffers to the compactor.
//!
//! Each flush writes the batch to its creation-hour partitions and then
//! nudges the compactor. The nudge is fire-and-forget; if a run is already
//! active it is dropped and the next periodic run picks the files up.

use std::sync::Arc;

use strata_core::buffer::FlushFn;
use strata_core::record::{Annotation, Event};
use strata_core::writer::PartitionWriter;

use crate::compactor::Compactor;

/// Flush function for event buffers.
#[must_use]
pub fn event_flush_fn(writer: Arc<PartitionWriter>, compactor: Arc<Compactor>) -> FlushFn<Event> {
    Arc::new(move |batch: Vec<Event>| {
        let files = writer.write_events(&batch)?;
        tracing::debug!(events = batch.len(), files = files.len(), "flushed events");
        compactor.trigger_async();
        Ok(())
    })
}

/// Flush function for annotation buffers.
#[must_use]
pub fn annotation_flush_fn(
    writer: Arc<PartitionWriter>,
    compactor: Arc<Compactor>,
) -> FlushFn<Annotation> {
    Arc::new(move |batch: Vec<Annotation>| {
        let files = writer.write_annotations(&batch)?;
        tracing::debug!(annotations = batch.len(), files = files.len(), "flushed annotations");
        compactor.trigger_async();
        Ok(())
    })
}
