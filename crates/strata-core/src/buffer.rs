//! Count- and time-triggered ingestion buffer.
//!
//! A [`Buffer`] accumulates items under a mutex and hands a detached batch to
//! its flush function when either the configured count is reached (inside
//! the triggering `add`) or the periodic timer fires. Handoff is at-most-once:
//! a failed flush is reported but the batch is not re-buffered.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Flush callback invoked with a detached batch.
pub type FlushFn<T> = Arc<dyn Fn(Vec<T>) -> Result<()> + Send + Sync>;

/// Buffer tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferConfig {
    /// Name used in logs.
    pub name: String,
    /// Flush as soon as this many items are buffered.
    pub flush_count: usize,
    /// Periodic flush interval.
    #[serde(with = "duration_secs")]
    pub flush_interval: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            name: "buffer".to_string(),
            flush_count: 10_000,
            flush_interval: Duration::from_secs(60),
        }
    }
}

impl BufferConfig {
    /// Default config with a log name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Thread-safe accumulator with count and time flush triggers.
pub struct Buffer<T> {
    config: BufferConfig,
    items: Mutex<Vec<T>>,
    flush_fn: FlushFn<T>,
}

impl<T> fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("config", &self.config)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<T> Buffer<T> {
    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.items.lock().map_or(0, |items| items.len())
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + 'static> Buffer<T> {
    /// Creates a buffer that hands batches to `flush_fn`.
    pub fn new(config: BufferConfig, flush_fn: FlushFn<T>) -> Self {
        Self {
            config,
            items: Mutex::new(Vec::new()),
            flush_fn,
        }
    }

    /// Buffer configuration.
    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<T>>> {
        self.items.lock().map_err(|_| Error::Internal {
            message: format!("buffer '{}' lock poisoned", self.config.name),
        })
    }

    /// Appends one item, flushing if the count threshold is reached.
    ///
    /// # Errors
    ///
    /// Returns the flush function's error if this call triggered a flush.
    pub fn add(&self, item: T) -> Result<()> {
        let drained = {
            let mut items = self.lock()?;
            items.push(item);
            self.drain_if_full(&mut items)
        };
        self.deliver(drained)
    }

    /// Appends several items, flushing if the count threshold is reached.
    ///
    /// # Errors
    ///
    /// Returns the flush function's error if this call triggered a flush.
    pub fn add_batch(&self, batch: impl IntoIterator<Item = T>) -> Result<()> {
        let drained = {
            let mut items = self.lock()?;
            items.extend(batch);
            self.drain_if_full(&mut items)
        };
        self.deliver(drained)
    }

    fn drain_if_full(&self, items: &mut Vec<T>) -> Option<Vec<T>> {
        if items.len() >= self.config.flush_count {
            Some(std::mem::take(items))
        } else {
            None
        }
    }

    fn deliver(&self, drained: Option<Vec<T>>) -> Result<()> {
        match drained {
            Some(batch) if !batch.is_empty() => {
                let count = batch.len();
                let result = (self.flush_fn)(batch);
                match &result {
                    Ok(()) => tracing::debug!(buffer = %self.config.name, count, "flushed"),
                    Err(e) => tracing::warn!(
                        buffer = %self.config.name,
                        count,
                        error = %e,
                        "flush failed; batch dropped"
                    ),
                }
                result
            }
            _ => Ok(()),
        }
    }

    /// Flushes whatever is buffered. An empty buffer is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the flush function's error.
    pub fn flush(&self) -> Result<()> {
        let drained = std::mem::take(&mut *self.lock()?);
        self.deliver(Some(drained))
    }

    /// Spawns the periodic flush loop.
    ///
    /// The loop flushes every `flush_interval` and once more when `cancel`
    /// fires. Flushes run on the blocking pool.
    pub fn start_periodic_flush(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(buffer.config.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        buffer.flush_blocking().await;
                        tracing::debug!(buffer = %buffer.config.name, "periodic flush stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        buffer.flush_blocking().await;
                    }
                }
            }
        })
    }

    async fn flush_blocking(self: &Arc<Self>) {
        let buffer = Arc::clone(self);
        // Errors are already logged by `deliver`.
        if let Err(e) = tokio::task::spawn_blocking(move || buffer.flush()).await {
            tracing::error!(buffer = %self.config.name, error = %e, "flush task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    type Batches = Arc<Mutex<Vec<Vec<u32>>>>;

    fn recording(flush_count: usize) -> (Buffer<u32>, Batches) {
        let batches: Batches = Arc::default();
        let sink = Arc::clone(&batches);
        let flush_fn: FlushFn<u32> = Arc::new(move |batch| {
            sink.lock().unwrap().push(batch);
            Ok(())
        });
        let config = BufferConfig {
            name: "test".into(),
            flush_count,
            flush_interval: Duration::from_millis(50),
        };
        (Buffer::new(config, flush_fn), batches)
    }

    #[test]
    fn flushes_when_count_reached() {
        let (buffer, batches) = recording(3);
        buffer.add(1).unwrap();
        buffer.add(2).unwrap();
        assert!(batches.lock().unwrap().is_empty());
        buffer.add(3).unwrap();
        assert_eq!(*batches.lock().unwrap(), vec![vec![1, 2, 3]]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn empty_flush_is_noop() {
        let (buffer, batches) = recording(3);
        buffer.flush().unwrap();
        assert!(batches.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_flush_is_reported_and_not_rebuffered() {
        let flush_fn: FlushFn<u32> = Arc::new(|_| Err(Error::io("disk full")));
        let buffer = Buffer::new(
            BufferConfig {
                flush_count: 2,
                ..BufferConfig::named("failing")
            },
            flush_fn,
        );
        buffer.add(1).unwrap();
        assert!(buffer.add(2).is_err());
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn timer_and_shutdown_flush_partial_batches() {
        let (buffer, batches) = recording(100);
        let buffer = Arc::new(buffer);
        let cancel = CancellationToken::new();
        let handle = buffer.start_periodic_flush(cancel.clone());

        buffer.add(1).unwrap();
        for _ in 0..100 {
            if !batches.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        buffer.add(2).unwrap();
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(*batches.lock().unwrap(), vec![vec![1], vec![2]]);
    }

    #[test]
    fn debug_reports_buffered_len() {
        let (buffer, _) = recording(10);
        buffer.add(7).unwrap();
        let rendered = format!("{buffer:?}");
        assert!(rendered.contains("len: 1"), "{rendered}");
    }

    proptest! {
        #[test]
        fn every_item_is_flushed_exactly_once(
            flush_count in 1usize..20,
            chunks in proptest::collection::vec(proptest::collection::vec(0u32..1000, 0..10), 0..30),
        ) {
            let (buffer, batches) = recording(flush_count);
            let mut expected = Vec::new();
            for chunk in chunks {
                expected.extend(chunk.iter().copied());
                if chunk.len() == 1 {
                    buffer.add(chunk[0]).unwrap();
                } else {
                    buffer.add_batch(chunk).unwrap();
                }
            }
            let count_flushes = batches.lock().unwrap().len();
            buffer.flush().unwrap();

            let batches = batches.lock().unwrap();
            for batch in batches.iter().take(count_flushes) {
                prop_assert!(batch.len() >= flush_count);
            }
            let flushed: Vec<u32> = batches.iter().flatten().copied().collect();
            prop_assert_eq!(flushed, expected);
        }
    }
}
