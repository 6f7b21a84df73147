//! In-process TTL cache for lookup results.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

/// What a cached lookup answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupKind {
    /// Distinct values of a dimension column.
    DistinctValues,
    /// Annotation keys.
    AnnotationKeys,
    /// Values of one annotation key.
    AnnotationValues,
    /// Values across all annotation keys.
    AllAnnotationValues,
}

impl LookupKind {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DistinctValues => "distinct_values",
            Self::AnnotationKeys => "annotation_keys",
            Self::AnnotationValues => "annotation_values",
            Self::AllAnnotationValues => "all_annotation_values",
        }
    }
}

/// Cache key: lookup kind, the dimension or annotation key, and the date span.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LookupKey {
    /// Lookup kind.
    pub kind: LookupKind,
    /// Field or annotation key; empty when the lookup has none.
    pub subject: String,
    /// First date (`YYYYMMDD`).
    pub from: String,
    /// Last date (`YYYYMMDD`).
    pub to: String,
}

/// Map with per-entry expiry.
///
/// Expired entries are dropped lazily on lookup and on insert.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, (Instant, V)>>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Entry lifetime.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns a live entry.
    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|(expires, _)| now < *expires)
            .map(|(_, value)| value.clone())
    }

    /// Stores `value` for one TTL.
    pub fn insert(&self, key: K, value: V) {
        self.insert_at(key, value, Instant::now());
    }

    fn insert_at(&self, key: K, value: V, now: Instant) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, (expires, _)| now < *expires);
        entries.insert(key, (now + self.ttl, value));
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of stored entries, including expired ones not yet evicted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(subject: &str) -> LookupKey {
        LookupKey {
            kind: LookupKind::AnnotationValues,
            subject: subject.to_string(),
            from: "20250101".to_string(),
            to: "20250101".to_string(),
        }
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = TtlCache::new(Duration::from_secs(30));
        let now = Instant::now();
        cache.insert_at(key("env"), vec!["prod".to_string()], now);

        assert_eq!(
            cache.get_at(&key("env"), now + Duration::from_secs(29)),
            Some(vec!["prod".to_string()])
        );
        assert_eq!(cache.get_at(&key("env"), now + Duration::from_secs(30)), None);
        assert_eq!(cache.get_at(&key("region"), now), None);
    }

    #[test]
    fn insert_evicts_expired_entries() {
        let cache = TtlCache::new(Duration::from_secs(1));
        let now = Instant::now();
        cache.insert_at(key("a"), 1, now);
        cache.insert_at(key("b"), 2, now + Duration::from_secs(5));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn keys_differ_by_kind() {
        let cache = TtlCache::new(Duration::from_secs(30));
        cache.insert(key("env"), 1);
        let other = LookupKey {
            kind: LookupKind::DistinctValues,
            ..key("env")
        };
        assert_eq!(cache.get(&other), None);
        assert_eq!(cache.get(&key("env")), Some(1));
    }
}
