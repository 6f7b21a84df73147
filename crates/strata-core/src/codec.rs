//! Parquet encoding/decoding for every artifact kind.
//!
//! This module defines the canonical Parquet schemas:
//! - raw events (`events/{date}/{hour}/*.parquet`)
//! - raw annotations (`annotations/{date}/{hour}/*.parquet`)
//! - Stage-1 intermediates (`preagg/{date}/{hour}.parquet`)
//! - final artifacts (`aggregated/{date}/{hour}.parquet`, `aggregated/{date}.parquet`)
//!
//! Final artifacts are the contract with the query planner. Keep changes
//! backwards-compatible.

use std::fs::File;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    Array as _, ArrayRef, Int64Array, MapArray, MapBuilder, StringArray, StringBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;

use crate::annotations::AnnotationMap;
use crate::error::{Error, Result};
use crate::layout::atomic_write;
use crate::record::{
    AggregatedRecord, Annotation, Dimensions, Event, EventType, Measures, PreAggregatedRecord,
};

/// Column holding the annotation map.
pub const ANNOTATIONS_COLUMN: &str = "annotations";

// ============================================================================
// Schemas
// ============================================================================

/// Arrow type of the annotation column, `Map<Utf8, Utf8>`.
///
/// Taken from `MapBuilder` so that built arrays always match the schema.
#[must_use]
pub fn annotations_type() -> DataType {
    let mut builder = MapBuilder::new(None, StringBuilder::new(), StringBuilder::new());
    builder.finish().data_type().clone()
}

fn dimension_fields() -> Vec<Field> {
    vec![
        Field::new("data_source", DataType::Utf8, false),
        Field::new("event_type", DataType::Utf8, false),
        Field::new("flow_name", DataType::Utf8, true),
        Field::new("action_name", DataType::Utf8, true),
        Field::new("cause", DataType::Utf8, true),
        Field::new("ingress_type", DataType::Utf8, true),
    ]
}

fn measure_fields() -> Vec<Field> {
    vec![
        Field::new("event_count", DataType::Int64, false),
        Field::new("total_bytes", DataType::Int64, false),
        Field::new("total_file_count", DataType::Int64, false),
    ]
}

/// Raw event schema.
#[must_use]
pub fn events_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("did", DataType::Utf8, false),
        Field::new("data_source", DataType::Utf8, false),
        Field::new("event_type", DataType::Utf8, false),
        Field::new("event_time", DataType::Int64, false),
        Field::new("ingest_time", DataType::Int64, false),
        Field::new("creation_time", DataType::Int64, false),
        Field::new("bytes", DataType::Int64, false),
        Field::new("file_count", DataType::Int64, false),
        Field::new("flow_name", DataType::Utf8, true),
        Field::new("action_name", DataType::Utf8, true),
        Field::new("cause", DataType::Utf8, true),
        Field::new("ingress_type", DataType::Utf8, true),
    ]))
}

/// Raw annotation schema.
#[must_use]
pub fn annotations_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("did", DataType::Utf8, false),
        Field::new("key", DataType::Utf8, false),
        Field::new("value", DataType::Utf8, false),
        Field::new("update_time", DataType::Int64, false),
        Field::new("creation_time", DataType::Int64, false),
    ]))
}

/// Stage-1 intermediate schema.
#[must_use]
pub fn preagg_schema() -> SchemaRef {
    let mut fields = vec![
        Field::new("did", DataType::Utf8, false),
        Field::new("bucket", DataType::Int64, false),
    ];
    fields.extend(dimension_fields());
    fields.push(Field::new(ANNOTATIONS_COLUMN, annotations_type(), true));
    fields.extend(measure_fields());
    Arc::new(Schema::new(fields))
}

/// Final artifact schema (hourly and daily).
#[must_use]
pub fn aggregated_schema() -> SchemaRef {
    let mut fields = vec![Field::new("bucket", DataType::Int64, false)];
    fields.extend(dimension_fields());
    fields.push(Field::new(ANNOTATIONS_COLUMN, annotations_type(), true));
    fields.push(Field::new("source_partition", DataType::Utf8, false));
    fields.extend(measure_fields());
    Arc::new(Schema::new(fields))
}

// ============================================================================
// Writing
// ============================================================================

fn writer_properties() -> WriterProperties {
    let created_by = KeyValue {
        key: "created_by".to_string(),
        value: Some("strata".to_string()),
    };
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata(Some(vec![created_by]))
        .build()
}

fn write_single_batch(schema: SchemaRef, batch: &RecordBatch) -> Result<Bytes> {
    let mut cursor = Cursor::new(Vec::<u8>::new());
    let props = writer_properties();
    let mut writer =
        ArrowWriter::try_new(&mut cursor, schema, Some(props)).map_err(|e| Error::Parquet {
            message: format!("parquet writer init failed: {e}"),
        })?;
    writer.write(batch).map_err(|e| Error::Parquet {
        message: format!("parquet write failed: {e}"),
    })?;
    writer.close().map_err(|e| Error::Parquet {
        message: format!("parquet close failed: {e}"),
    })?;
    Ok(Bytes::from(cursor.into_inner()))
}

fn try_batch(schema: SchemaRef, columns: Vec<ArrayRef>) -> Result<RecordBatch> {
    RecordBatch::try_new(schema, columns).map_err(|e| Error::Parquet {
        message: format!("record batch build failed: {e}"),
    })
}

fn strings<'a>(values: impl Iterator<Item = &'a str>) -> ArrayRef {
    Arc::new(StringArray::from(values.map(Some).collect::<Vec<_>>()))
}

fn optional_strings<'a>(values: impl Iterator<Item = Option<&'a str>>) -> ArrayRef {
    Arc::new(StringArray::from(values.collect::<Vec<_>>()))
}

fn int64s(values: impl Iterator<Item = i64>) -> ArrayRef {
    Arc::new(Int64Array::from(values.collect::<Vec<_>>()))
}

fn dimension_columns(dims: &[&Dimensions]) -> Vec<ArrayRef> {
    vec![
        strings(dims.iter().map(|d| d.data_source.as_str())),
        strings(dims.iter().map(|d| d.event_type.as_str())),
        optional_strings(dims.iter().map(|d| d.flow_name.as_deref())),
        optional_strings(dims.iter().map(|d| d.action_name.as_deref())),
        optional_strings(dims.iter().map(|d| d.cause.as_deref())),
        optional_strings(dims.iter().map(|d| d.ingress_type.as_deref())),
    ]
}

fn measure_columns(measures: &[Measures]) -> Vec<ArrayRef> {
    vec![
        int64s(measures.iter().map(|m| m.event_count)),
        int64s(measures.iter().map(|m| m.total_bytes)),
        int64s(measures.iter().map(|m| m.total_file_count)),
    ]
}

/// Empty maps are stored as null.
fn annotation_column<'a>(maps: impl Iterator<Item = &'a AnnotationMap>) -> Result<ArrayRef> {
    let mut builder = MapBuilder::new(None, StringBuilder::new(), StringBuilder::new());
    for map in maps {
        for (key, value) in map.iter() {
            builder.keys().append_value(key);
            builder.values().append_value(value);
        }
        builder.append(!map.is_empty()).map_err(|e| Error::Parquet {
            message: format!("annotation map build failed: {e}"),
        })?;
    }
    Ok(Arc::new(builder.finish()))
}

/// Encodes raw events.
///
/// # Errors
///
/// Returns an error if the batch cannot be built or the Parquet write fails.
pub fn encode_events(rows: &[Event]) -> Result<Bytes> {
    let schema = events_schema();
    let batch = try_batch(
        schema.clone(),
        vec![
            strings(rows.iter().map(|r| r.did.as_str())),
            strings(rows.iter().map(|r| r.data_source.as_str())),
            strings(rows.iter().map(|r| r.event_type.as_str())),
            int64s(rows.iter().map(|r| r.event_time)),
            int64s(rows.iter().map(|r| r.ingest_time)),
            int64s(rows.iter().map(|r| r.creation_time)),
            int64s(rows.iter().map(|r| r.bytes)),
            int64s(rows.iter().map(|r| r.file_count)),
            optional_strings(rows.iter().map(|r| r.flow_name.as_deref())),
            optional_strings(rows.iter().map(|r| r.action_name.as_deref())),
            optional_strings(rows.iter().map(|r| r.cause.as_deref())),
            optional_strings(rows.iter().map(|r| r.ingress_type.as_deref())),
        ],
    )?;
    write_single_batch(schema, &batch)
}

/// Encodes raw annotations.
///
/// # Errors
///
/// Returns an error if the batch cannot be built or the Parquet write fails.
pub fn encode_annotations(rows: &[Annotation]) -> Result<Bytes> {
    let schema = annotations_schema();
    let batch = try_batch(
        schema.clone(),
        vec![
            strings(rows.iter().map(|r| r.did.as_str())),
            strings(rows.iter().map(|r| r.key.as_str())),
            strings(rows.iter().map(|r| r.value.as_str())),
            int64s(rows.iter().map(|r| r.update_time)),
            int64s(rows.iter().map(|r| r.creation_time)),
        ],
    )?;
    write_single_batch(schema, &batch)
}

/// Builds the Arrow batch for Stage-1 rows.
///
/// # Errors
///
/// Returns an error if the batch cannot be built.
pub fn preagg_batch(rows: &[PreAggregatedRecord]) -> Result<RecordBatch> {
    let dims: Vec<&Dimensions> = rows.iter().map(|r| &r.dims).collect();
    let measures: Vec<Measures> = rows.iter().map(|r| r.measures).collect();

    let mut columns = vec![
        strings(rows.iter().map(|r| r.did.as_str())),
        int64s(rows.iter().map(|r| r.bucket)),
    ];
    columns.extend(dimension_columns(&dims));
    columns.push(annotation_column(rows.iter().map(|r| &r.annotations))?);
    columns.extend(measure_columns(&measures));
    try_batch(preagg_schema(), columns)
}

/// Builds the Arrow batch for final-artifact rows.
///
/// # Errors
///
/// Returns an error if the batch cannot be built.
pub fn aggregated_batch(rows: &[AggregatedRecord]) -> Result<RecordBatch> {
    let dims: Vec<&Dimensions> = rows.iter().map(|r| &r.dims).collect();
    let measures: Vec<Measures> = rows.iter().map(|r| r.measures).collect();

    let mut columns = vec![int64s(rows.iter().map(|r| r.bucket))];
    columns.extend(dimension_columns(&dims));
    columns.push(annotation_column(rows.iter().map(|r| &r.annotations))?);
    columns.push(strings(rows.iter().map(|r| r.source_partition.as_str())));
    columns.extend(measure_columns(&measures));
    try_batch(aggregated_schema(), columns)
}

/// Atomically writes a Stage-1 intermediate file.
///
/// # Errors
///
/// Returns an error if encoding or the temp-then-rename write fails.
pub fn write_preagg(path: &Path, rows: &[PreAggregatedRecord]) -> Result<()> {
    let batch = preagg_batch(rows)?;
    let bytes = write_single_batch(preagg_schema(), &batch)?;
    atomic_write(path, &bytes)
}

/// Atomically writes a final artifact (hourly or daily).
///
/// # Errors
///
/// Returns an error if encoding or the temp-then-rename write fails.
pub fn write_aggregated(path: &Path, rows: &[AggregatedRecord]) -> Result<()> {
    let batch = aggregated_batch(rows)?;
    let bytes = write_single_batch(aggregated_schema(), &batch)?;
    atomic_write(path, &bytes)
}

// ============================================================================
// Reading
// ============================================================================

/// Reads every record batch in `path`.
///
/// Decoder failures are reported as [`Error::Corrupt`]; failing to open the
/// file is an ordinary I/O error.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or decoded.
pub fn read_batches(path: &Path) -> Result<Vec<RecordBatch>> {
    let file = File::open(path).map_err(|e| Error::io_at("opening", path, e))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| Error::corrupt(path, format!("parquet reader init failed: {e}")))?
        .build()
        .map_err(|e| Error::corrupt(path, format!("parquet reader build failed: {e}")))?;

    let mut batches = Vec::new();
    for batch in reader {
        let batch =
            batch.map_err(|e| Error::corrupt(path, format!("parquet read batch failed: {e}")))?;
        batches.push(batch);
    }
    Ok(batches)
}

/// Fully decodes `paths` and returns the total row count.
///
/// # Errors
///
/// Returns the first open or decode failure.
pub fn count_rows(paths: &[PathBuf]) -> Result<u64> {
    let mut rows = 0u64;
    for path in paths {
        for batch in read_batches(path)? {
            rows += batch.num_rows() as u64;
        }
    }
    Ok(rows)
}

struct Columns<'a> {
    batch: &'a RecordBatch,
    path: &'a Path,
}

impl<'a> Columns<'a> {
    fn index(&self, name: &str) -> Result<usize> {
        self.batch
            .schema()
            .index_of(name)
            .map_err(|e| Error::corrupt(self.path, format!("missing column '{name}': {e}")))
    }

    fn string(&self, name: &str) -> Result<&'a StringArray> {
        let idx = self.index(name)?;
        self.batch
            .column(idx)
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| Error::corrupt(self.path, format!("column '{name}' is not StringArray")))
    }

    fn i64(&self, name: &str) -> Result<&'a Int64Array> {
        let idx = self.index(name)?;
        self.batch
            .column(idx)
            .as_any()
            .downcast_ref::<Int64Array>()
            .ok_or_else(|| Error::corrupt(self.path, format!("column '{name}' is not Int64Array")))
    }

    fn map(&self, name: &str) -> Result<&'a MapArray> {
        let idx = self.index(name)?;
        self.batch
            .column(idx)
            .as_any()
            .downcast_ref::<MapArray>()
            .ok_or_else(|| Error::corrupt(self.path, format!("column '{name}' is not MapArray")))
    }

    fn event_type(&self, array: &StringArray, row: usize) -> Result<EventType> {
        array
            .value(row)
            .parse()
            .map_err(|e: Error| Error::corrupt(self.path, e.to_string()))
    }
}

fn opt_string(array: &StringArray, row: usize) -> Option<String> {
    if array.is_null(row) {
        None
    } else {
        Some(array.value(row).to_string())
    }
}

fn annotation_map(array: &MapArray, row: usize) -> AnnotationMap {
    let mut map = AnnotationMap::new();
    if array.is_null(row) {
        return map;
    }
    let entries = array.value(row);
    let keys = entries.column(0).as_any().downcast_ref::<StringArray>();
    let values = entries.column(1).as_any().downcast_ref::<StringArray>();
    if let (Some(keys), Some(values)) = (keys, values) {
        for i in 0..entries.len() {
            if keys.is_null(i) || values.is_null(i) {
                continue;
            }
            map.insert(keys.value(i), values.value(i));
        }
    }
    map
}

struct DimensionColumns<'a> {
    data_source: &'a StringArray,
    event_type: &'a StringArray,
    flow_name: &'a StringArray,
    action_name: &'a StringArray,
    cause: &'a StringArray,
    ingress_type: &'a StringArray,
}

impl<'a> DimensionColumns<'a> {
    fn load(cols: &Columns<'a>) -> Result<Self> {
        Ok(Self {
            data_source: cols.string("data_source")?,
            event_type: cols.string("event_type")?,
            flow_name: cols.string("flow_name")?,
            action_name: cols.string("action_name")?,
            cause: cols.string("cause")?,
            ingress_type: cols.string("ingress_type")?,
        })
    }

    fn row(&self, cols: &Columns<'_>, i: usize) -> Result<Dimensions> {
        Ok(Dimensions {
            data_source: self.data_source.value(i).to_string(),
            event_type: cols.event_type(self.event_type, i)?,
            flow_name: opt_string(self.flow_name, i),
            action_name: opt_string(self.action_name, i),
            cause: opt_string(self.cause, i),
            ingress_type: opt_string(self.ingress_type, i),
        })
    }
}

struct MeasureColumns<'a> {
    event_count: &'a Int64Array,
    total_bytes: &'a Int64Array,
    total_file_count: &'a Int64Array,
}

impl<'a> MeasureColumns<'a> {
    fn load(cols: &Columns<'a>) -> Result<Self> {
        Ok(Self {
            event_count: cols.i64("event_count")?,
            total_bytes: cols.i64("total_bytes")?,
            total_file_count: cols.i64("total_file_count")?,
        })
    }

    fn row(&self, i: usize) -> Measures {
        Measures {
            event_count: self.event_count.value(i),
            total_bytes: self.total_bytes.value(i),
            total_file_count: self.total_file_count.value(i),
        }
    }
}

/// Reads raw events from `path`.
///
/// # Errors
///
/// Returns [`Error::Corrupt`] if the file cannot be decoded as events.
pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    let mut rows = Vec::new();
    for batch in read_batches(path)? {
        let cols = Columns { batch: &batch, path };
        let did = cols.string("did")?;
        let data_source = cols.string("data_source")?;
        let event_type = cols.string("event_type")?;
        let event_time = cols.i64("event_time")?;
        let ingest_time = cols.i64("ingest_time")?;
        let creation_time = cols.i64("creation_time")?;
        let bytes = cols.i64("bytes")?;
        let file_count = cols.i64("file_count")?;
        let flow_name = cols.string("flow_name")?;
        let action_name = cols.string("action_name")?;
        let cause = cols.string("cause")?;
        let ingress_type = cols.string("ingress_type")?;

        for i in 0..batch.num_rows() {
            rows.push(Event {
                did: did.value(i).to_string(),
                data_source: data_source.value(i).to_string(),
                event_type: cols.event_type(event_type, i)?,
                event_time: event_time.value(i),
                ingest_time: ingest_time.value(i),
                creation_time: creation_time.value(i),
                bytes: bytes.value(i),
                file_count: file_count.value(i),
                flow_name: opt_string(flow_name, i),
                action_name: opt_string(action_name, i),
                cause: opt_string(cause, i),
                ingress_type: opt_string(ingress_type, i),
            });
        }
    }
    Ok(rows)
}

/// Reads raw annotations from `path`.
///
/// # Errors
///
/// Returns [`Error::Corrupt`] if the file cannot be decoded as annotations.
pub fn read_annotations(path: &Path) -> Result<Vec<Annotation>> {
    let mut rows = Vec::new();
    for batch in read_batches(path)? {
        let cols = Columns { batch: &batch, path };
        let did = cols.string("did")?;
        let key = cols.string("key")?;
        let value = cols.string("value")?;
        let update_time = cols.i64("update_time")?;
        let creation_time = cols.i64("creation_time")?;

        for i in 0..batch.num_rows() {
            rows.push(Annotation {
                did: did.value(i).to_string(),
                key: key.value(i).to_string(),
                value: value.value(i).to_string(),
                update_time: update_time.value(i),
                creation_time: creation_time.value(i),
            });
        }
    }
    Ok(rows)
}

/// Reads a Stage-1 intermediate file.
///
/// # Errors
///
/// Returns an error if the file cannot be decoded.
pub fn read_preagg(path: &Path) -> Result<Vec<PreAggregatedRecord>> {
    let mut rows = Vec::new();
    for batch in read_batches(path)? {
        let cols = Columns { batch: &batch, path };
        let did = cols.string("did")?;
        let bucket = cols.i64("bucket")?;
        let dims = DimensionColumns::load(&cols)?;
        let annotations = cols.map(ANNOTATIONS_COLUMN)?;
        let measures = MeasureColumns::load(&cols)?;

        for i in 0..batch.num_rows() {
            rows.push(PreAggregatedRecord {
                did: did.value(i).to_string(),
                bucket: bucket.value(i),
                dims: dims.row(&cols, i)?,
                annotations: annotation_map(annotations, i),
                measures: measures.row(i),
            });
        }
    }
    Ok(rows)
}

/// Reads a final artifact (hourly or daily).
///
/// # Errors
///
/// Returns an error if the file cannot be decoded.
pub fn read_aggregated(path: &Path) -> Result<Vec<AggregatedRecord>> {
    let mut rows = Vec::new();
    for batch in read_batches(path)? {
        let cols = Columns { batch: &batch, path };
        let bucket = cols.i64("bucket")?;
        let dims = DimensionColumns::load(&cols)?;
        let annotations = cols.map(ANNOTATIONS_COLUMN)?;
        let source = cols.string("source_partition")?;
        let measures = MeasureColumns::load(&cols)?;

        for i in 0..batch.num_rows() {
            rows.push(AggregatedRecord {
                bucket: bucket.value(i),
                dims: dims.row(&cols, i)?,
                annotations: annotation_map(annotations, i),
                source_partition: source.value(i).to_string(),
                measures: measures.row(i),
            });
        }
    }
    Ok(rows)
}
