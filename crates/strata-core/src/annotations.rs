//! Key/value annotation maps.
//!
//! An [`AnnotationMap`] holds at most one value per key and compares by
//! content, so two rows with the same annotations group together regardless
//! of the order in which the annotations arrived.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::record::Annotation;

/// Ordered association of annotation keys to values.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnnotationMap(BTreeMap<String, String>);

impl AnnotationMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Value for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Overlays `newer` onto `self`: keys present in `newer` win.
    pub fn merge_last_wins(&mut self, newer: &Self) {
        for (key, value) in &newer.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no annotations are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for AnnotationMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// Resolves raw annotations to one map per DID, last write wins per key.
///
/// Only DIDs in `dids` are kept. "Last" is decided by `update_time`; among
/// equal update times the annotation appearing later in `annotations` wins.
#[must_use]
pub fn latest_by_did(
    annotations: &[Annotation],
    dids: &HashSet<&str>,
) -> HashMap<String, AnnotationMap> {
    let mut latest: HashMap<(&str, &str), (i64, &str)> = HashMap::new();
    for annotation in annotations {
        if !dids.contains(annotation.did.as_str()) {
            continue;
        }
        let slot = (annotation.did.as_str(), annotation.key.as_str());
        let candidate = (annotation.update_time, annotation.value.as_str());
        match latest.get(&slot) {
            Some((seen, _)) if *seen > candidate.0 => {}
            _ => {
                latest.insert(slot, candidate);
            }
        }
    }

    let mut by_did: HashMap<String, AnnotationMap> = HashMap::new();
    for ((did, key), (_, value)) in latest {
        by_did.entry(did.to_string()).or_default().insert(key, value);
    }
    by_did
}
