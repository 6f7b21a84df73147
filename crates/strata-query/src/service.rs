//! Query execution over final artifacts.
//!
//! Each query resolves its file list, loads those artifacts into an
//! in-memory table named [`sql::TABLE`] and runs one statement against it
//! on a shared, memory-limited engine runtime.
//!
//! Queries share a read lock on the engine, so any number run at once.
//! Compaction never takes this lock. A query sees whichever file set was on
//! disk when it resolved its files.

use std::collections::BTreeSet;
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use arrow::array::{Array, AsArray, Int64Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Int64Type, SchemaRef};
use arrow::record_batch::RecordBatch;
use arrow_json::ArrayWriter;
use datafusion::datasource::MemTable;
use datafusion::execution::runtime_env::{RuntimeEnv, RuntimeEnvBuilder};
use datafusion::prelude::{SessionConfig, SessionContext};
use datafusion::sql::parser::{DFParser, Statement as DFStatement};
use datafusion::sql::sqlparser::ast::Statement as SqlStatement;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::Instrument;

use strata_core::codec;
use strata_core::config::ConfigProvider;
use strata_core::layout::DataLayout;
use strata_core::metadata::MetadataIndex;
use strata_core::observability::query_span;
use strata_core::record::EventType;

use crate::cache::{LookupKey, LookupKind, TtlCache};
use crate::config::QueryConfig;
use crate::error::{QueryError, Result, map_datafusion_error};
use crate::filters::NO_GROUPING;
use crate::metrics::{self, QueryTimer};
use crate::request::{
    AnalyticsRequest, AnalyticsRow, DataStats, EventAnalysisRequest, EventAnalysisRow, SqlResult,
    TimeRange,
};
use crate::{resolve, sql};

const MAX_SQL_LENGTH: usize = 10_000;

/// Analytics query service.
pub struct QueryService {
    config: QueryConfig,
    layout: DataLayout,
    provider: Arc<dyn ConfigProvider>,
    engine: RwLock<Option<Arc<RuntimeEnv>>>,
    cache: TtlCache<LookupKey, Vec<String>>,
}

impl fmt::Debug for QueryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryService")
            .field("config", &self.config)
            .field("cached_lookups", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl QueryService {
    /// Creates a service reading from `config.data_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::BadRequest`] for an invalid config, a storage
    /// error if the spill directory cannot be created, or an execution error
    /// if the engine runtime cannot be built.
    pub fn new(config: QueryConfig, provider: Arc<dyn ConfigProvider>) -> Result<Self> {
        if let Some(message) = config.validate() {
            return Err(QueryError::bad_request(format!("invalid query config: {message}")));
        }
        let mut builder = RuntimeEnvBuilder::new().with_memory_limit(config.memory_limit_bytes, 1.0);
        if let Some(dir) = &config.spill_dir {
            std::fs::create_dir_all(dir)
                .map_err(|e| strata_core::Error::io_at("creating spill dir", dir, e))?;
            builder = builder.with_temp_file_path(dir.clone());
        }
        let runtime = builder.build_arc().map_err(|e| map_datafusion_error(&e))?;

        tracing::info!(
            data_dir = %config.data_dir.display(),
            memory_limit_bytes = config.memory_limit_bytes,
            cache_ttl_secs = config.cache_ttl_secs,
            "query service ready"
        );
        Ok(Self {
            layout: DataLayout::new(&config.data_dir),
            cache: TtlCache::new(config.cache_ttl()),
            engine: RwLock::new(Some(runtime)),
            provider,
            config,
        })
    }

    /// Service configuration.
    #[must_use]
    pub const fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Data directory layout.
    #[must_use]
    pub const fn layout(&self) -> &DataLayout {
        &self.layout
    }

    /// Time-series metrics for a dashboard panel.
    ///
    /// # Errors
    ///
    /// Returns an error if artifacts cannot be read or the query fails.
    pub async fn analytics(&self, req: &AnalyticsRequest) -> Result<Vec<AnalyticsRow>> {
        async {
            let mut timer = QueryTimer::start("analytics");
            let files = self.resolve(&req.range())?;
            if files.is_empty() {
                timer.succeed();
                return Ok(Vec::new());
            }
            let statement = sql::analytics(req, self.config.bucket_width_ms(req.interval_ms));
            tracing::debug!(sql = %statement, files = files.len(), "executing analytics query");
            let (_, batches) = self.execute(files, &statement, None).await?;
            let rows = analytics_rows(&batches)?;
            timer.succeed();
            Ok(rows)
        }
        .instrument(query_span("analytics"))
        .await
    }

    /// Error or filter counts broken down by a dimension or annotation.
    ///
    /// # Errors
    ///
    /// Returns an error if artifacts cannot be read or the query fails.
    pub async fn event_analysis(
        &self,
        req: &EventAnalysisRequest,
        event_type: EventType,
    ) -> Result<Vec<EventAnalysisRow>> {
        async {
            let mut timer = QueryTimer::start("event_analysis");
            let files = self.resolve(&req.range())?;
            if files.is_empty() {
                timer.succeed();
                return Ok(Vec::new());
            }
            let statement =
                sql::event_analysis(req, event_type, self.config.bucket_width_ms(req.interval_ms));
            tracing::debug!(sql = %statement, %event_type, "executing event analysis query");
            let (_, batches) = self.execute(files, &statement, None).await?;
            let rows = event_rows(&batches)?;
            timer.succeed();
            Ok(rows)
        }
        .instrument(query_span("event_analysis"))
        .await
    }

    /// Distinct values of a dimension column.
    ///
    /// Unless `filtered` is set, `data_source` and `flow_name` are answered
    /// from the metadata index when it is available.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::BadRequest`] for an unknown field, or an error
    /// if the fallback scan fails.
    pub async fn distinct_values(
        &self,
        field: &str,
        range: &TimeRange,
        filtered: bool,
    ) -> Result<Vec<String>> {
        let Some(statement) = sql::distinct_values(field, range) else {
            return Err(QueryError::bad_request(format!("unknown field: {field}")));
        };
        if !filtered {
            let indexed = self
                .metadata()
                .and_then(|index| index.field_values(field).map(<[String]>::to_vec));
            if let Some(values) = indexed {
                metrics::record_metadata_hit(LookupKind::DistinctValues.as_str());
                tracing::debug!(field, count = values.len(), "distinct values from metadata");
                return Ok(values);
            }
        }
        self.lookup(LookupKind::DistinctValues, field, range, statement)
            .await
    }

    /// Annotation keys, with [`NO_GROUPING`] always present.
    ///
    /// With `for_group`, the configured grouping key comes first when it
    /// exists in the data; the remaining keys follow in sorted order.
    ///
    /// # Errors
    ///
    /// Returns an error if the fallback scan fails.
    pub async fn annotation_keys(
        &self,
        range: &TimeRange,
        for_group: bool,
        filtered: bool,
    ) -> Result<Vec<String>> {
        if !filtered {
            if let Some(index) = self.metadata() {
                metrics::record_metadata_hit(LookupKind::AnnotationKeys.as_str());
                return Ok(self.order_keys(index.annotation_keys, for_group));
            }
        }
        let keys = self
            .lookup(LookupKind::AnnotationKeys, "", range, sql::annotation_keys(range))
            .await?;
        Ok(self.order_keys(keys, for_group))
    }

    /// Distinct values of one annotation key.
    ///
    /// # Errors
    ///
    /// Returns an error if the fallback scan fails.
    pub async fn annotation_values(
        &self,
        key: &str,
        range: &TimeRange,
        filtered: bool,
    ) -> Result<Vec<String>> {
        if !filtered {
            if let Some(index) = self.metadata() {
                metrics::record_metadata_hit(LookupKind::AnnotationValues.as_str());
                return Ok(index.annotation_values.get(key).cloned().unwrap_or_default());
            }
        }
        self.lookup(
            LookupKind::AnnotationValues,
            key,
            range,
            sql::annotation_values(key, range),
        )
        .await
    }

    /// Distinct values across every annotation key.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan fails.
    pub async fn all_annotation_values(&self, range: &TimeRange) -> Result<Vec<String>> {
        self.lookup(
            LookupKind::AllAnnotationValues,
            "",
            range,
            sql::all_annotation_values(range),
        )
        .await
    }

    /// Sorted union of the values of several annotation keys.
    ///
    /// # Errors
    ///
    /// Returns the first lookup error.
    pub async fn annotation_values_for_keys(
        &self,
        keys: &[String],
        range: &TimeRange,
        filtered: bool,
    ) -> Result<Vec<String>> {
        let mut values = BTreeSet::new();
        for key in keys {
            values.extend(self.annotation_values(key, range, filtered).await?);
        }
        Ok(values.into_iter().collect())
    }

    /// Whether any final artifact exists.
    #[must_use]
    pub fn has_data(&self) -> bool {
        resolve::has_data(&self.layout)
    }

    /// File counts and sizes in the data directory.
    #[must_use]
    pub fn data_stats(&self) -> DataStats {
        resolve::data_stats(&self.layout)
    }

    /// Runs one read-only statement against every final artifact.
    ///
    /// The artifacts are exposed as table [`sql::TABLE`]. Results are capped
    /// at the configured row limit.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::BadRequest`] unless `statement` is a single
    /// `SELECT` or CTE, or an error if execution fails.
    pub async fn execute_sql(&self, statement: &str) -> Result<SqlResult> {
        async {
            let mut timer = QueryTimer::start("sql");
            let statement = statement.trim();
            validate_query(statement)?;
            let files = self.layout.all_final_artifacts()?;
            tracing::info!(query_len = statement.len(), files = files.len(), "executing SQL query");

            let (schema, batches) = self
                .execute(files, statement, Some(self.config.max_sql_rows))
                .await?;
            let result = SqlResult {
                columns: schema.fields().iter().map(|f| f.name().clone()).collect(),
                rows: batches_to_json(&batches)?,
            };
            timer.succeed();
            Ok(result)
        }
        .instrument(query_span("sql"))
        .await
    }

    /// Drops every cached lookup.
    pub fn invalidate_cache(&self) {
        self.cache.clear();
    }

    /// Waits for in-flight queries, then rejects new ones.
    pub async fn close(&self) {
        let mut engine = self.engine.write().await;
        *engine = None;
        self.cache.clear();
        tracing::info!("query service closed");
    }

    fn metadata(&self) -> Option<MetadataIndex> {
        MetadataIndex::load(&self.layout.metadata_file())
    }

    fn order_keys(&self, keys: Vec<String>, for_group: bool) -> Vec<String> {
        let mut remaining: BTreeSet<String> = keys.into_iter().collect();
        let mut ordered = Vec::with_capacity(remaining.len() + 1);
        if for_group {
            let preferred = self.provider.group_annotation_key();
            if !preferred.is_empty() && remaining.remove(&preferred) {
                ordered.push(preferred);
            }
        }
        ordered.push(NO_GROUPING.to_string());
        ordered.extend(remaining.into_iter().filter(|k| k != NO_GROUPING));
        ordered
    }

    async fn lookup(
        &self,
        kind: LookupKind,
        subject: &str,
        range: &TimeRange,
        statement: String,
    ) -> Result<Vec<String>> {
        async {
            let (from, to) = range.date_key();
            let key = LookupKey {
                kind,
                subject: subject.to_string(),
                from,
                to,
            };
            if let Some(values) = self.cache.get(&key) {
                metrics::record_cache_hit(kind.as_str());
                tracing::debug!(subject, "lookup cache hit");
                return Ok(values);
            }
            metrics::record_cache_miss(kind.as_str());

            let mut timer = QueryTimer::start(kind.as_str());
            let files = self.resolve(range)?;
            let values = if files.is_empty() {
                Vec::new()
            } else {
                let (_, batches) = self.execute(files, &statement, None).await?;
                distinct_strings(&batches)?
            };
            timer.succeed();
            tracing::debug!(subject, count = values.len(), "lookup cached");
            self.cache.insert(key, values.clone());
            Ok(values)
        }
        .instrument(query_span(kind.as_str()))
        .await
    }

    /// Resolves `range` to artifact files, rejecting ranges past `max_range_days`.
    fn resolve(&self, range: &TimeRange) -> Result<Vec<PathBuf>> {
        check_range(range, self.config.max_range_days)?;
        Ok(resolve::files_for_range(&self.layout, range)?)
    }

    async fn execute(
        &self,
        files: Vec<PathBuf>,
        statement: &str,
        limit: Option<usize>,
    ) -> Result<(SchemaRef, Vec<RecordBatch>)> {
        let engine = self.engine.read().await;
        let Some(runtime) = engine.as_ref().map(Arc::clone) else {
            return Err(QueryError::execution("query service is closed"));
        };

        let table = load_table(files).await?;
        let ctx = SessionContext::new_with_config_rt(SessionConfig::new(), runtime);
        ctx.register_table(sql::TABLE, table)
            .map_err(|e| map_datafusion_error(&e))?;

        let mut df = ctx
            .sql(statement)
            .await
            .map_err(|e| map_datafusion_error(&e))?;
        if let Some(limit) = limit {
            df = df.limit(0, Some(limit)).map_err(|e| map_datafusion_error(&e))?;
        }
        let schema: SchemaRef = Arc::new(df.schema().as_arrow().clone());
        let batches = timeout(self.config.query_timeout(), df.collect())
            .await
            .map_err(|_| QueryError::execution("query timed out"))?
            .map_err(|e| map_datafusion_error(&e))?;
        Ok((schema, batches))
    }
}

fn check_range(range: &TimeRange, max_days: u32) -> Result<()> {
    let days = range.span_days();
    if days > i64::from(max_days) {
        return Err(QueryError::bad_request(format!(
            "time range spans {days} days, the limit is {max_days}"
        )));
    }
    Ok(())
}

fn validate_query(statement: &str) -> Result<()> {
    if statement.is_empty() {
        return Err(QueryError::bad_request("sql cannot be empty"));
    }
    if statement.len() > MAX_SQL_LENGTH {
        return Err(QueryError::bad_request(format!(
            "sql exceeds max length ({MAX_SQL_LENGTH} bytes)"
        )));
    }
    let statements = DFParser::parse_sql(statement)
        .map_err(|err| QueryError::bad_request(format!("failed to parse SQL: {err}")))?;
    let mut iter = statements.iter();
    let Some(first) = iter.next() else {
        return Err(QueryError::bad_request("sql must contain a statement"));
    };
    if iter.next().is_some() {
        return Err(QueryError::bad_request(
            "only single-statement queries are supported",
        ));
    }
    match first {
        DFStatement::Statement(inner) if matches!(inner.as_ref(), SqlStatement::Query(_)) => Ok(()),
        _ => Err(QueryError::bad_request(
            "only SELECT/CTE queries are supported",
        )),
    }
}

async fn load_table(files: Vec<PathBuf>) -> Result<Arc<MemTable>> {
    let batches = tokio::task::spawn_blocking(move || read_artifacts(&files))
        .await
        .map_err(|e| QueryError::execution(format!("artifact read task failed: {e}")))??;
    let schema = batches
        .first()
        .map_or_else(codec::aggregated_schema, RecordBatch::schema);
    let table = MemTable::try_new(schema, vec![batches]).map_err(|e| map_datafusion_error(&e))?;
    Ok(Arc::new(table))
}

fn read_artifacts(files: &[PathBuf]) -> strata_core::Result<Vec<RecordBatch>> {
    let mut batches = Vec::new();
    for path in files {
        match codec::read_batches(path) {
            Ok(read) => batches.extend(read),
            // Consolidation removed it after resolution.
            Err(_) if matches!(std::fs::metadata(path), Err(e) if e.kind() == ErrorKind::NotFound) => {
                tracing::debug!(path = %path.display(), "artifact vanished before read");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(batches)
}

fn column(batch: &RecordBatch, index: usize, to: &DataType) -> Result<arrow::array::ArrayRef> {
    let array = batch
        .columns()
        .get(index)
        .ok_or_else(|| QueryError::execution(format!("result is missing column {index}")))?;
    cast(array, to).map_err(|e| QueryError::execution(format!("unexpected result column type: {e}")))
}

fn strings(batch: &RecordBatch, index: usize) -> Result<StringArray> {
    Ok(column(batch, index, &DataType::Utf8)?.as_string::<i32>().clone())
}

fn ints(batch: &RecordBatch, index: usize) -> Result<Int64Array> {
    Ok(column(batch, index, &DataType::Int64)?
        .as_primitive::<Int64Type>()
        .clone())
}

fn str_at(array: &StringArray, row: usize) -> String {
    if array.is_null(row) {
        String::new()
    } else {
        array.value(row).to_string()
    }
}

fn int_at(array: &Int64Array, row: usize) -> i64 {
    if array.is_null(row) { 0 } else { array.value(row) }
}

fn analytics_rows(batches: &[RecordBatch]) -> Result<Vec<AnalyticsRow>> {
    let mut rows = Vec::new();
    for batch in batches {
        let time = ints(batch, 0)?;
        let series = strings(batch, 1)?;
        let annotation = strings(batch, 2)?;
        let measures = (3..9).map(|i| ints(batch, i)).collect::<Result<Vec<_>>>()?;
        for row in 0..batch.num_rows() {
            rows.push(AnalyticsRow {
                time: int_at(&time, row),
                data_source: str_at(&series, row),
                annotation_value: str_at(&annotation, row),
                ingress_bytes: int_at(&measures[0], row),
                ingress_files: int_at(&measures[1], row),
                egress_bytes: int_at(&measures[2], row),
                egress_files: int_at(&measures[3], row),
                error_files: int_at(&measures[4], row),
                filter_files: int_at(&measures[5], row),
            });
        }
    }
    Ok(rows)
}

fn event_rows(batches: &[RecordBatch]) -> Result<Vec<EventAnalysisRow>> {
    let mut rows = Vec::new();
    for batch in batches {
        let time = ints(batch, 0)?;
        let group = strings(batch, 1)?;
        let count = ints(batch, 2)?;
        for row in 0..batch.num_rows() {
            rows.push(EventAnalysisRow {
                time: int_at(&time, row),
                group_value: str_at(&group, row),
                count: int_at(&count, row),
            });
        }
    }
    Ok(rows)
}

/// Sorted non-empty values of the first column.
fn distinct_strings(batches: &[RecordBatch]) -> Result<Vec<String>> {
    let mut values = BTreeSet::new();
    for batch in batches {
        let column = strings(batch, 0)?;
        values.extend(
            column
                .iter()
                .flatten()
                .filter(|v| !v.is_empty())
                .map(str::to_string),
        );
    }
    Ok(values.into_iter().collect())
}

fn batches_to_json(batches: &[RecordBatch]) -> Result<Vec<serde_json::Map<String, serde_json::Value>>> {
    let mut writer = ArrayWriter::new(Vec::new());
    let refs: Vec<&RecordBatch> = batches.iter().collect();
    writer
        .write_batches(&refs)
        .map_err(|e| QueryError::execution(format!("failed to write JSON: {e}")))?;
    writer
        .finish()
        .map_err(|e| QueryError::execution(format!("failed to finalize JSON: {e}")))?;
    let payload = writer.into_inner();
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_slice(&payload)
        .map_err(|e| QueryError::execution(format!("failed to decode JSON rows: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_query_accepts_select_and_cte() {
        assert!(validate_query("SELECT 1").is_ok());
        assert!(validate_query("WITH t AS (SELECT 1 AS x) SELECT x FROM t").is_ok());
    }

    #[test]
    fn validate_query_rejects_writes_and_batches() {
        assert!(validate_query("").unwrap_err().is_bad_request());
        assert!(validate_query("DROP TABLE aggregated").unwrap_err().is_bad_request());
        assert!(validate_query("SELECT 1; SELECT 2").unwrap_err().is_bad_request());
        assert!(validate_query(&"x".repeat(MAX_SQL_LENGTH + 1)).unwrap_err().is_bad_request());
    }

    #[test]
    fn check_range_rejects_spans_past_the_limit() {
        use chrono::{TimeZone, Utc};

        let from = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let week = TimeRange::new(from, from + chrono::Duration::days(6));
        assert_eq!(week.span_days(), 7);
        assert!(check_range(&week, 7).is_ok());
        assert!(check_range(&week, 6).unwrap_err().is_bad_request());

        let centuries = TimeRange::new(from, Utc.with_ymd_and_hms(2525, 1, 1, 0, 0, 0).unwrap());
        assert!(check_range(&centuries, 400).unwrap_err().is_bad_request());
    }

    #[test]
    fn empty_result_encodes_to_no_rows() {
        assert!(batches_to_json(&[]).unwrap().is_empty());
    }
}
