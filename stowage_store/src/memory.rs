//! In-memory [`Store`] backend.
//!
//! Holds every series, raw bucket and the catalog in process memory behind
//! short mutex sections. Clones share the same underlying state, so one
//! instance can be handed to the pipeline while another observes the results
//! -- the arrangement every aggregation test in this workspace relies on.

use std::{collections::BTreeMap, sync::Arc, sync::Mutex, time::Duration};

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;

use crate::{Error, Point, Store};
use async_trait::async_trait;

#[derive(Debug)]
struct Bucket {
    values: Vec<f64>,
    expires_at: Instant,
}

fn bucket_ttl(level: i64) -> Duration {
    // Buckets self-clean at twice their retention window.
    Duration::from_secs(u64::try_from(level).unwrap_or(0).saturating_mul(2))
}

#[derive(Debug, Default)]
struct Inner {
    series: Mutex<FxHashMap<String, BTreeMap<i64, Vec<f64>>>>,
    buckets: Mutex<FxHashMap<(String, i64), Bucket>>,
    catalog: Mutex<FxHashSet<String>>,
}

/// An in-memory store.
///
/// Cheap to clone; all clones operate on the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create a new, empty [`MemoryStore`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every point stored for `key`, in timestamp order.
    #[must_use]
    pub fn points(&self, key: &str) -> Vec<Point> {
        let series = self.inner.series.lock().expect("series lock poisoned");
        series.get(key).map_or_else(Vec::new, |points| {
            points
                .iter()
                .flat_map(|(&timestamp, values)| {
                    values.iter().map(move |&value| Point { timestamp, value })
                })
                .collect()
        })
    }

    /// Number of raw samples currently buffered for (`key`, `level`).
    #[must_use]
    pub fn raw_depth(&self, key: &str, level: i64) -> usize {
        let buckets = self.inner.buckets.lock().expect("buckets lock poisoned");
        buckets
            .get(&(key.to_owned(), level))
            .filter(|bucket| bucket.expires_at > Instant::now())
            .map_or(0, |bucket| bucket.values.len())
    }

    /// The catalog of registered metric names, sorted.
    #[must_use]
    pub fn catalog(&self) -> Vec<String> {
        let catalog = self.inner.catalog.lock().expect("catalog lock poisoned");
        let mut keys: Vec<String> = catalog.iter().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn append_point(&self, timestamp: i64, key: &str, value: f64) -> Result<(), Error> {
        let mut series = self.inner.series.lock().expect("series lock poisoned");
        let slot = series.entry(key.to_owned()).or_default().entry(timestamp).or_default();
        // Same (timestamp, value) pair is idempotent; distinct values at one
        // timestamp all survive.
        if !slot.contains(&value) {
            slot.push(value);
        }
        Ok(())
    }

    async fn push_raw(&self, key: &str, level: i64, values: &[f64]) -> Result<(), Error> {
        let now = Instant::now();
        let mut buckets = self.inner.buckets.lock().expect("buckets lock poisoned");
        let bucket = buckets
            .entry((key.to_owned(), level))
            .or_insert_with(|| Bucket {
                values: Vec::new(),
                expires_at: now + bucket_ttl(level),
            });
        if bucket.expires_at <= now {
            bucket.values.clear();
        }
        bucket.values.extend_from_slice(values);
        bucket.expires_at = now + bucket_ttl(level);
        Ok(())
    }

    async fn drain_raw(&self, key: &str, level: i64) -> Result<Vec<f64>, Error> {
        let mut buckets = self.inner.buckets.lock().expect("buckets lock poisoned");
        let drained = buckets
            .remove(&(key.to_owned(), level))
            .filter(|bucket| bucket.expires_at > Instant::now())
            .map_or_else(Vec::new, |bucket| bucket.values);
        Ok(drained)
    }

    async fn register_keys(&self, keys: &[String]) -> Result<(), Error> {
        let mut catalog = self.inner.catalog.lock().expect("catalog lock poisoned");
        catalog.extend(keys.iter().cloned());
        Ok(())
    }

    async fn range(&self, key: &str, from: i64, to: i64) -> Vec<Point> {
        let series = self.inner.series.lock().expect("series lock poisoned");
        series.get(key).map_or_else(Vec::new, |points| {
            points
                .range(from..=to)
                .flat_map(|(&timestamp, values)| {
                    values.iter().map(move |&value| Point { timestamp, value })
                })
                .collect()
        })
    }
}
