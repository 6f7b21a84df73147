//! Query metrics.
//!
//! Recording is a no-op until the host process installs a recorder.

use std::time::Instant;

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Query duration in seconds, by kind.
pub const QUERY_DURATION: &str = "strata_query_duration_seconds";

/// Queries that failed, by kind.
pub const QUERY_ERRORS: &str = "strata_query_errors_total";

/// Lookup cache hits, by kind.
pub const CACHE_HITS: &str = "strata_query_cache_hits_total";

/// Lookup cache misses, by kind.
pub const CACHE_MISSES: &str = "strata_query_cache_misses_total";

/// Lookups answered from the metadata index, by kind.
pub const METADATA_HITS: &str = "strata_query_metadata_hits_total";

/// Registers all query metric descriptions.
pub fn register_metrics() {
    describe_histogram!(QUERY_DURATION, "Duration of analytics queries in seconds");
    describe_counter!(QUERY_ERRORS, "Total failed queries");
    describe_counter!(CACHE_HITS, "Total lookup cache hits");
    describe_counter!(CACHE_MISSES, "Total lookup cache misses");
    describe_counter!(METADATA_HITS, "Total lookups answered from the metadata index");
}

/// Records a cache hit.
pub fn record_cache_hit(kind: &'static str) {
    counter!(CACHE_HITS, "kind" => kind).increment(1);
}

/// Records a cache miss.
pub fn record_cache_miss(kind: &'static str) {
    counter!(CACHE_MISSES, "kind" => kind).increment(1);
}

/// Records a metadata fast-path answer.
pub fn record_metadata_hit(kind: &'static str) {
    counter!(METADATA_HITS, "kind" => kind).increment(1);
}

/// Times one query; records on drop, counting an error unless [`QueryTimer::succeed`] ran.
#[derive(Debug)]
pub struct QueryTimer {
    kind: &'static str,
    start: Instant,
    ok: bool,
}

impl QueryTimer {
    /// Starts timing a query of `kind`.
    #[must_use]
    pub fn start(kind: &'static str) -> Self {
        Self {
            kind,
            start: Instant::now(),
            ok: false,
        }
    }

    /// Marks the query successful.
    pub fn succeed(&mut self) {
        self.ok = true;
    }
}

impl Drop for QueryTimer {
    fn drop(&mut self) {
        histogram!(QUERY_DURATION, "kind" => self.kind).record(self.start.elapsed().as_secs_f64());
        if !self.ok {
            counter!(QUERY_ERRORS, "kind" => self.kind).increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_a_noop() {
        register_metrics();
        record_cache_hit("distinct_values");
        record_cache_miss("distinct_values");
        record_metadata_hit("annotation_keys");
        let mut timer = QueryTimer::start("analytics");
        timer.succeed();
    }
}
