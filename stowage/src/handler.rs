//! Metric handlers and the shared aggregation pipeline.
//!
//! Measurements arrive through [`Handler::handle`] and accumulate in an
//! in-memory buffer. An external scheduler calls [`Handler::flush`] once per
//! flush interval, driving two phases:
//!
//! 1. **Fine-grain flush**: the buffer is swapped for an empty one in a
//!    single atomic exchange, the snapshot is carved into batches and each
//!    batch is dispatched to the worker pool, which writes the finest-grain
//!    points and pushes raw samples into the per-(key, level) buckets of
//!    every coarser retention.
//! 2. **Coarse rollup**: each coarser retention that has come due drains its
//!    raw buckets -- one atomic drain per key -- and writes the derived
//!    statistics at that level. When the coarsest level fires, the set of
//!    keys tracked since its previous firing refreshes the durable catalog
//!    and is cleared.
//!
//! A sample lands in exactly one buffer generation and a bucket is drained
//! exactly once per due rollup; batch dispatch order never affects the
//! stored result.
//!
//! ## Metrics
//!
//! `events_received`: Measurements accepted by `handle`, labelled by kind
//! `events_rejected`: Measurements refused by `handle`, labelled by kind

use std::{
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use stowage_pool::WorkerPool;
use stowage_store::Store;
use tracing::{debug, warn};

use crate::config::Retentions;

pub mod counter;
pub mod gauge;
pub(crate) mod stats;
pub mod timer;

pub use counter::Counter;
pub use gauge::Gauge;
pub use timer::Timer;

/// Entries per fine-grain flush task.
const FLUSH_CHUNK: usize = 50;
/// Keys per rollup task.
const RETAIN_CHUNK: usize = 400;

/// Errors produced by [`Handler`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The measurement carried no value where one is required.
    #[error("measurement for {key} carries no value")]
    MissingValue {
        /// The metric key.
        key: String,
    },
    /// The measurement value failed to parse as a finite float.
    #[error("malformed value {value:?} for {key}")]
    MalformedValue {
        /// The metric key.
        key: String,
        /// The offending value string.
        value: String,
    },
    /// The sample rate was not a positive, finite fraction.
    #[error("malformed sample rate {rate:?} for {key}")]
    MalformedRate {
        /// The metric key.
        key: String,
        /// The offending rate string.
        rate: String,
    },
}

/// A derived observation for one key: an optional statistic suffix and the
/// value to persist under it.
pub type StatPoint = (Option<&'static str>, f64);

/// Type-specific aggregation behavior injected into [`Handler`].
///
/// Implementations are pure: they fold measurements into per-key
/// accumulation state and derive the points to persist. Storage I/O and
/// dispatch stay in [`Handler`], so batch interleaving can never affect what
/// an implementation computes.
pub trait Aggregate: Send + Sync + 'static {
    /// Per-key accumulation state.
    type Acc: Send + 'static;

    /// Key namespace, `counters` and friends.
    fn prefix() -> &'static str;

    /// Whether `handle` rejects a measurement without a value.
    fn requires_value() -> bool {
        true
    }

    /// Whether values are divided by the sample-rate fraction.
    fn corrects_for_rate() -> bool {
        true
    }

    /// Accumulation state prior to the first measurement.
    fn empty() -> Self::Acc;

    /// Fold one corrected measurement into the accumulation state.
    fn accumulate(acc: &mut Self::Acc, value: f64);

    /// The points persisted at the finest grain for one key's state.
    fn fine_points(acc: &Self::Acc) -> Vec<StatPoint>;

    /// The raw samples pushed into each coarser retention's bucket.
    fn raw_samples(acc: &Self::Acc) -> Vec<f64>;

    /// The points persisted for a due rollup. `values` is the non-empty
    /// drain of one (key, level) bucket.
    fn rollup_points(values: &[f64]) -> Vec<StatPoint>;
}

/// Operational counters for one handler, exported for health introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Statistics {
    /// The handler kind, `counters` and friends.
    pub kind: &'static str,
    /// Configured worker count of the pool this handler dispatches to.
    pub pool_size: usize,
    /// Tasks queued on that pool and not yet picked up.
    pub queue_depth: usize,
    /// Measurements received by `handle`.
    pub received: u64,
    /// Measurements rejected by `handle`.
    pub rejected: u64,
    /// Flush ticks driven so far.
    pub flush_cycles: u64,
    /// Keys in the current accumulation buffer.
    pub active_keys: usize,
    /// Keys tracked since the coarsest retention last fired.
    pub tracked_targets: usize,
}

fn unix_now() -> i64 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock predates the unix epoch")
        .as_secs();
    i64::try_from(secs).expect("timestamp fits i64")
}

fn parse_value(key: &str, raw: &str) -> Result<f64, Error> {
    let malformed = || Error::MalformedValue {
        key: key.to_owned(),
        value: raw.to_owned(),
    };
    let value: f64 = raw.parse().map_err(|_| malformed())?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(malformed())
    }
}

fn parse_rate(key: &str, raw: &str) -> Result<f64, Error> {
    let malformed = || Error::MalformedRate {
        key: key.to_owned(),
        rate: raw.to_owned(),
    };
    let fraction = raw.strip_prefix('@').unwrap_or(raw);
    let rate: f64 = fraction.parse().map_err(|_| malformed())?;
    if rate.is_finite() && rate > 0.0 {
        Ok(rate)
    } else {
        Err(malformed())
    }
}

#[allow(missing_debug_implementations)]
/// The aggregation orchestrator shared by every metric type.
///
/// Owns the accumulation buffer and target registry for its lifetime; no
/// other component mutates them. Snapshots handed to pool tasks are moved,
/// never aliased, so concurrent `handle` calls cannot observe in-flight
/// batches.
pub struct Handler<A: Aggregate> {
    store: Arc<dyn Store>,
    pool: Arc<WorkerPool>,
    retentions: Retentions,
    active: Mutex<FxHashMap<String, A::Acc>>,
    targets: Mutex<FxHashSet<String>>,
    /// Per level, the tick of its last rollup dispatch; index 0 unused.
    last_flush: Mutex<Vec<i64>>,
    /// Per level, whether a rollup dispatch is still in flight.
    gates: Vec<Arc<AtomicBool>>,
    received: AtomicU64,
    rejected: AtomicU64,
    flush_cycles: AtomicU64,
}

impl<A: Aggregate> Handler<A> {
    /// Create a new [`Handler`] dispatching onto `pool` and writing through
    /// `store`. Every coarse retention is considered freshly rolled up as of
    /// now.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, pool: Arc<WorkerPool>, retentions: Retentions) -> Self {
        Self::anchored_at(store, pool, retentions, unix_now())
    }

    /// As [`Handler::new`], with the rollup schedule anchored at `epoch`.
    pub(crate) fn anchored_at(
        store: Arc<dyn Store>,
        pool: Arc<WorkerPool>,
        retentions: Retentions,
        epoch: i64,
    ) -> Self {
        let levels = retentions.levels().len();
        Self {
            store,
            pool,
            retentions,
            active: Mutex::new(FxHashMap::default()),
            targets: Mutex::new(FxHashSet::default()),
            last_flush: Mutex::new(vec![epoch; levels]),
            gates: (0..levels).map(|_| Arc::new(AtomicBool::new(false))).collect(),
            received: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            flush_cycles: AtomicU64::new(0),
        }
    }

    /// Fold one measurement into the current window.
    ///
    /// `value` and `sample_rate` arrive as the raw wire strings; a rate of
    /// `@0.5` doubles the effective value.
    ///
    /// # Errors
    ///
    /// Returns an error for a missing value (where the metric type requires
    /// one), a value that does not parse as a finite float, or a sample rate
    /// that is not a positive finite fraction. Nothing is accumulated in any
    /// of these cases.
    pub fn handle(
        &self,
        key: &str,
        value: Option<&str>,
        sample_rate: Option<&str>,
    ) -> Result<(), Error> {
        metrics::counter!("events_received", "kind" => A::prefix()).increment(1);
        self.received.fetch_add(1, Ordering::Relaxed);
        match self.accumulate(key, value, sample_rate) {
            Ok(()) => Ok(()),
            Err(err) => {
                metrics::counter!("events_rejected", "kind" => A::prefix()).increment(1);
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    fn accumulate(
        &self,
        key: &str,
        value: Option<&str>,
        sample_rate: Option<&str>,
    ) -> Result<(), Error> {
        let Some(raw) = value else {
            if A::requires_value() {
                return Err(Error::MissingValue {
                    key: key.to_owned(),
                });
            }
            return Ok(());
        };
        let mut value = parse_value(key, raw)?;
        if A::corrects_for_rate() {
            if let Some(rate) = sample_rate {
                value /= parse_rate(key, rate)?;
            }
        }
        let key = format!("{}:{key}", A::prefix());
        let mut active = self.active.lock().expect("active buffer lock poisoned");
        let slot = active.entry(key).or_insert_with(A::empty);
        A::accumulate(slot, value);
        Ok(())
    }

    /// Run both pipeline phases against the current wall clock.
    pub fn flush(&self) {
        self.flush_at(unix_now());
    }

    /// Run both pipeline phases against the tick timestamp `flush_start`.
    ///
    /// Never blocks: all store interaction happens inside pool tasks.
    pub fn flush_at(&self, flush_start: i64) {
        self.flush_cycles.fetch_add(1, Ordering::Relaxed);
        self.flush_targets(flush_start);
        self.retain_targets(flush_start);
    }

    /// Operational counters for health export.
    #[must_use]
    pub fn statistics(&self) -> Statistics {
        Statistics {
            kind: A::prefix(),
            pool_size: self.pool.size(),
            queue_depth: self.pool.queue_depth(),
            received: self.received.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            flush_cycles: self.flush_cycles.load(Ordering::Relaxed),
            active_keys: self.active.lock().expect("active buffer lock poisoned").len(),
            tracked_targets: self.targets.lock().expect("targets lock poisoned").len(),
        }
    }

    fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Err(err) = self.pool.submit(task) {
            warn!(%err, "worker pool rejected task");
        }
    }

    /// Phase one: swap out the accumulation buffer and dispatch its contents.
    fn flush_targets(&self, flush_start: i64) {
        let snapshot = {
            let mut active = self.active.lock().expect("active buffer lock poisoned");
            std::mem::take(&mut *active)
        };
        if snapshot.is_empty() {
            return;
        }

        let window = flush_start - flush_start % self.retentions.interval();
        let keys: Vec<String> = snapshot.keys().cloned().collect();
        let total = keys.len();

        self.targets
            .lock()
            .expect("targets lock poisoned")
            .extend(keys.iter().cloned());

        // Catalog registration rides the pool like every other store call.
        let store = Arc::clone(&self.store);
        self.submit(async move {
            if let Err(err) = store.register_keys(&keys).await {
                warn!(%err, "catalog registration failed");
            }
        });

        let coarse: Vec<i64> = self.retentions.coarse().to_vec();
        let mut entries: Vec<(String, A::Acc)> = snapshot.into_iter().collect();
        while !entries.is_empty() {
            let tail = entries.split_off(FLUSH_CHUNK.min(entries.len()));
            let batch = std::mem::replace(&mut entries, tail);
            let store = Arc::clone(&self.store);
            let coarse = coarse.clone();
            self.submit(async move {
                for (key, acc) in batch {
                    for (suffix, value) in A::fine_points(&acc) {
                        let point_key = match suffix {
                            Some(stat) => format!("{key}:{stat}"),
                            None => key.clone(),
                        };
                        if let Err(err) = store.append_point(window, &point_key, value).await {
                            warn!(key = %point_key, %err, "fine-grain write failed");
                        }
                    }
                    let raw = A::raw_samples(&acc);
                    for &level in &coarse {
                        if let Err(err) = store.push_raw(&key, level, &raw).await {
                            warn!(%key, level, %err, "raw sample push failed");
                        }
                    }
                }
            });
        }
        debug!(kind = A::prefix(), keys = total, window, "dispatched fine-grain flush");
    }

    /// Phase two: dispatch a rollup for every coarse retention that has come
    /// due.
    fn retain_targets(&self, flush_start: i64) {
        let interval = self.retentions.interval();
        let levels = self.retentions.levels();
        let coarsest = levels.len() - 1;

        for (idx, &level) in levels.iter().enumerate().skip(1) {
            let due = {
                let last_flush = self.last_flush.lock().expect("last-flush lock poisoned");
                flush_start + interval > last_flush[idx] + level
            };
            if !due {
                continue;
            }

            let gate = Arc::clone(&self.gates[idx]);
            if gate.swap(true, Ordering::AcqRel) {
                // The previous dispatch for this level has not finished;
                // last_flush stays put so the level comes due again next
                // tick. Drains for one level are never concurrent.
                warn!(kind = A::prefix(), level, "rollup still in flight, deferring");
                continue;
            }

            let window = flush_start - flush_start % level;
            let mut keys: Vec<String> = {
                let mut targets = self.targets.lock().expect("targets lock poisoned");
                if idx == coarsest {
                    targets.drain().collect()
                } else {
                    targets.iter().cloned().collect()
                }
            };
            let total = keys.len();

            if idx == coarsest && !keys.is_empty() {
                let store = Arc::clone(&self.store);
                let catalog_keys = keys.clone();
                self.submit(async move {
                    if let Err(err) = store.register_keys(&catalog_keys).await {
                        warn!(%err, "catalog registration failed");
                    }
                });
            }

            let batches = total.div_ceil(RETAIN_CHUNK);
            if batches == 0 {
                gate.store(false, Ordering::Release);
            } else {
                let remaining = Arc::new(AtomicUsize::new(batches));
                while !keys.is_empty() {
                    let tail = keys.split_off(RETAIN_CHUNK.min(keys.len()));
                    let batch = std::mem::replace(&mut keys, tail);
                    let store = Arc::clone(&self.store);
                    let gate = Arc::clone(&gate);
                    let remaining = Arc::clone(&remaining);
                    self.submit(async move {
                        for key in batch {
                            match store.drain_raw(&key, level).await {
                                Ok(values) if values.is_empty() => {}
                                Ok(values) => {
                                    for (suffix, value) in A::rollup_points(&values) {
                                        let point_key = match suffix {
                                            Some(stat) => format!("{key}:{stat}:{level}"),
                                            None => format!("{key}:{level}"),
                                        };
                                        if let Err(err) =
                                            store.append_point(window, &point_key, value).await
                                        {
                                            warn!(key = %point_key, %err, "rollup write failed");
                                        }
                                    }
                                }
                                Err(err) => {
                                    warn!(%key, level, %err, "raw sample drain failed");
                                }
                            }
                        }
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            gate.store(false, Ordering::Release);
                        }
                    });
                }
            }

            self.last_flush.lock().expect("last-flush lock poisoned")[idx] = flush_start;
            debug!(kind = A::prefix(), level, window, keys = total, "dispatched rollup");
        }
    }
}

#[allow(missing_debug_implementations)]
/// The three handlers a daemon runs, one per metric type.
pub struct HandlerSet {
    /// Counter measurements, `|c` on the wire.
    pub counters: Handler<Counter>,
    /// Gauge measurements, `|g` on the wire.
    pub gauges: Handler<Gauge>,
    /// Timer measurements, `|ms` on the wire.
    pub timers: Handler<Timer>,
}

impl HandlerSet {
    /// Create the full handler set sharing one store and one pool.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, pool: Arc<WorkerPool>, retentions: Retentions) -> Self {
        Self {
            counters: Handler::new(Arc::clone(&store), Arc::clone(&pool), retentions.clone()),
            gauges: Handler::new(Arc::clone(&store), Arc::clone(&pool), retentions.clone()),
            timers: Handler::new(store, pool, retentions),
        }
    }

    /// Flush every handler against one wall-clock stamp.
    pub fn flush(&self) {
        self.flush_at(unix_now());
    }

    /// Flush every handler against `flush_start`.
    pub fn flush_at(&self, flush_start: i64) {
        self.counters.flush_at(flush_start);
        self.gauges.flush_at(flush_start);
        self.timers.flush_at(flush_start);
    }

    /// Operational counters for every handler.
    #[must_use]
    pub fn statistics(&self) -> [Statistics; 3] {
        [
            self.counters.statistics(),
            self.gauges.statistics(),
            self.timers.statistics(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use stowage_store::{Error as StoreError, MemoryStore, Point};

    use super::*;

    fn retentions(levels: &[i64]) -> Retentions {
        Retentions::new(levels.to_vec()).expect("valid schedule")
    }

    fn rig<A: Aggregate>(levels: &[i64], workers: usize) -> (MemoryStore, Arc<WorkerPool>, Handler<A>) {
        let store = MemoryStore::new();
        let pool = Arc::new(WorkerPool::new(
            NonZeroUsize::new(workers).expect("workers must be non-zero"),
        ));
        let handler = Handler::anchored_at(
            Arc::new(store.clone()),
            Arc::clone(&pool),
            retentions(levels),
            0,
        );
        (store, pool, handler)
    }

    fn values_of(points: &[Point]) -> Vec<f64> {
        points.iter().map(|point| point.value).collect()
    }

    #[tokio::test]
    async fn counter_window_sums_rate_corrected_values() {
        let (store, pool, handler) = rig::<Counter>(&[10, 60], 4);

        handler.handle("foo", Some("5"), Some("@0.5")).expect("accepted");
        handler.handle("foo", Some("3"), None).expect("accepted");
        handler.handle("foo", Some("2"), Some("@0.1")).expect("accepted");

        handler.flush_at(27);
        pool.until_idle().await;

        let points = store.points("counters:foo");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].timestamp, 20);
        assert!((points[0].value - 33.0).abs() < 1e-9);

        // The sum also lands in each coarse bucket, once.
        assert_eq!(store.raw_depth("counters:foo", 60), 1);
    }

    #[tokio::test]
    async fn samples_land_in_exactly_one_window() {
        let (store, pool, handler) = rig::<Counter>(&[10, 60], 1);

        handler.handle("foo", Some("7"), None).expect("accepted");
        handler.flush_at(10);
        // A second tick with no input writes nothing new.
        handler.flush_at(20);
        pool.until_idle().await;

        assert_eq!(store.points("counters:foo").len(), 1);

        handler.handle("foo", Some("9"), None).expect("accepted");
        handler.flush_at(30);
        pool.until_idle().await;

        let points = store.points("counters:foo");
        assert_eq!(values_of(&points), vec![7.0, 9.0]);
    }

    #[tokio::test]
    async fn six_ticks_roll_into_the_minute_window() {
        let (store, pool, handler) = rig::<Counter>(&[10, 60, 300], 1);

        for tick in 1..=6 {
            handler.handle("foo", Some("5"), Some("@0.5")).expect("accepted");
            handler.flush_at(tick * 10);
        }
        pool.until_idle().await;

        // Six finest-grain points of 10 apiece.
        let fine = store.points("counters:foo");
        assert_eq!(values_of(&fine), vec![10.0; 6]);
        assert_eq!(
            fine.iter().map(|p| p.timestamp).collect::<Vec<i64>>(),
            vec![10, 20, 30, 40, 50, 60]
        );

        // At t=60 the 60s level came due and drained all six raw values.
        let rolled = store.points("counters:foo:60");
        assert_eq!(rolled.len(), 1);
        assert_eq!(rolled[0].timestamp, 60);
        assert!((rolled[0].value - 60.0).abs() < 1e-9);

        // The 300s level has not fired; its bucket still holds the samples.
        assert!(store.points("counters:foo:300").is_empty());
        assert_eq!(store.raw_depth("counters:foo", 300), 6);
    }

    #[tokio::test]
    async fn gauge_last_write_wins_and_rolls_up_the_mean() {
        let (store, pool, handler) = rig::<Gauge>(&[10, 60], 1);

        handler.handle("load", Some("4"), None).expect("accepted");
        handler.handle("load", Some("10"), None).expect("accepted");
        handler.flush_at(10);

        handler.handle("load", Some("20"), None).expect("accepted");
        handler.flush_at(20);

        // Nothing new, but the tick at t=60 brings the 60s level due.
        handler.flush_at(60);
        pool.until_idle().await;

        let fine = store.points("gauges:load");
        assert_eq!(values_of(&fine), vec![10.0, 20.0]);

        let rolled = store.points("gauges:load:60");
        assert_eq!(rolled.len(), 1);
        assert_eq!(rolled[0].timestamp, 60);
        assert!((rolled[0].value - 15.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn timer_fine_statistics_cover_the_fixed_set() {
        let (store, pool, handler) = rig::<Timer>(&[10, 60], 1);

        for value in ["1", "2", "3", "4", "5", "6", "7", "8", "9", "10"] {
            handler.handle("glork", Some(value), None).expect("accepted");
        }
        handler.flush_at(10);
        pool.until_idle().await;

        let stat = |name: &str| {
            let points = store.points(&format!("timers:glork:{name}"));
            assert_eq!(points.len(), 1, "exactly one {name} point");
            assert_eq!(points[0].timestamp, 10);
            points[0].value
        };

        assert!((stat("mean") - 5.5).abs() < 1e-9);
        assert!((stat("count") - 10.0).abs() < 1e-9);
        assert!((stat("min") - 1.0).abs() < 1e-9);
        assert!((stat("max") - 10.0).abs() < 1e-9);
        assert!((stat("upper_90") - 9.0).abs() < 1e-9);
        // Sample standard deviation over 1..=10.
        assert!((stat("stddev") - 3.027_650_354_097_491_6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn single_timer_sample_has_no_stddev() {
        let (store, pool, handler) = rig::<Timer>(&[10, 60], 1);

        handler.handle("lonely", Some("42"), None).expect("accepted");
        handler.flush_at(10);
        pool.until_idle().await;

        assert!(store.points("timers:lonely:stddev").is_empty());
        assert_eq!(values_of(&store.points("timers:lonely:count")), vec![1.0]);
        assert_eq!(values_of(&store.points("timers:lonely:mean")), vec![42.0]);
    }

    #[tokio::test]
    async fn rollup_batches_cover_every_target() {
        let (store, pool, handler) = rig::<Counter>(&[10, 60], 4);

        for n in 0..120 {
            handler
                .handle(&format!("bulk.{n}"), Some("1"), None)
                .expect("accepted");
        }
        handler.flush_at(10);
        pool.until_idle().await;

        handler.flush_at(60);
        pool.until_idle().await;

        for n in 0..120 {
            let fine = store.points(&format!("counters:bulk.{n}"));
            assert_eq!(values_of(&fine), vec![1.0], "fine point for bulk.{n}");
            let rolled = store.points(&format!("counters:bulk.{n}:60"));
            assert_eq!(values_of(&rolled), vec![1.0], "rollup point for bulk.{n}");
        }
    }

    #[tokio::test]
    async fn busy_rollup_level_defers_without_advancing_the_schedule() {
        let (store, pool, handler) = rig::<Counter>(&[10, 60], 1);

        handler.handle("foo", Some("5"), None).expect("accepted");
        handler.flush_at(10);
        pool.until_idle().await;

        // Wedge the 60s level as if a prior dispatch were still running.
        handler.gates[1].store(true, Ordering::Release);
        handler.flush_at(60);
        pool.until_idle().await;
        assert!(store.points("counters:foo:60").is_empty());
        assert_eq!(store.raw_depth("counters:foo", 60), 1);

        // Once clear the level comes due again on the next tick and drains
        // the samples it deferred.
        handler.gates[1].store(false, Ordering::Release);
        handler.flush_at(70);
        pool.until_idle().await;

        let rolled = store.points("counters:foo:60");
        assert_eq!(rolled.len(), 1);
        assert_eq!(rolled[0].timestamp, 60);
        assert!((rolled[0].value - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn coarsest_rollup_clears_the_target_registry() {
        let (store, pool, handler) = rig::<Counter>(&[10, 60], 1);

        handler.handle("foo", Some("1"), None).expect("accepted");
        handler.flush_at(10);
        pool.until_idle().await;

        assert_eq!(handler.statistics().tracked_targets, 1);
        assert_eq!(store.catalog(), vec!["counters:foo".to_owned()]);

        handler.flush_at(60);
        pool.until_idle().await;
        assert_eq!(handler.statistics().tracked_targets, 0);
    }

    #[derive(Debug, Clone)]
    struct FlakyStore {
        inner: MemoryStore,
    }

    #[async_trait::async_trait]
    impl stowage_store::Store for FlakyStore {
        async fn append_point(
            &self,
            timestamp: i64,
            key: &str,
            value: f64,
        ) -> Result<(), StoreError> {
            if key.contains("broken") {
                return Err(StoreError::Backend("injected failure".to_owned()));
            }
            self.inner.append_point(timestamp, key, value).await
        }

        async fn push_raw(&self, key: &str, level: i64, values: &[f64]) -> Result<(), StoreError> {
            self.inner.push_raw(key, level, values).await
        }

        async fn drain_raw(&self, key: &str, level: i64) -> Result<Vec<f64>, StoreError> {
            self.inner.drain_raw(key, level).await
        }

        async fn register_keys(&self, keys: &[String]) -> Result<(), StoreError> {
            self.inner.register_keys(keys).await
        }

        async fn range(&self, key: &str, from: i64, to: i64) -> Vec<Point> {
            self.inner.range(key, from, to).await
        }
    }

    #[tokio::test]
    async fn failed_writes_do_not_poison_sibling_keys() {
        let inner = MemoryStore::new();
        let pool = Arc::new(WorkerPool::new(NonZeroUsize::new(2).expect("non-zero")));
        let handler: Handler<Counter> = Handler::anchored_at(
            Arc::new(FlakyStore {
                inner: inner.clone(),
            }),
            Arc::clone(&pool),
            retentions(&[10, 60]),
            0,
        );

        handler.handle("good", Some("1"), None).expect("accepted");
        handler.handle("broken", Some("1"), None).expect("accepted");
        handler.flush_at(10);
        pool.until_idle().await;

        assert_eq!(values_of(&inner.points("counters:good")), vec![1.0]);
        assert!(inner.points("counters:broken").is_empty());
        // The failed write cost only its own point; the raw push survived.
        assert_eq!(inner.raw_depth("counters:broken", 60), 1);
    }

    #[tokio::test]
    async fn malformed_measurements_are_rejected_untouched() {
        let (_store, _pool, handler) = rig::<Counter>(&[10, 60], 1);

        assert!(matches!(
            handler.handle("foo", Some("abc"), None),
            Err(Error::MalformedValue { .. })
        ));
        assert!(matches!(
            handler.handle("foo", None, None),
            Err(Error::MissingValue { .. })
        ));
        assert!(matches!(
            handler.handle("foo", Some("1"), Some("@0")),
            Err(Error::MalformedRate { .. })
        ));
        assert!(matches!(
            handler.handle("foo", Some("1"), Some("@nope")),
            Err(Error::MalformedRate { .. })
        ));
        assert!(matches!(
            handler.handle("foo", Some("inf"), None),
            Err(Error::MalformedValue { .. })
        ));

        let stats = handler.statistics();
        assert_eq!(stats.received, 5);
        assert_eq!(stats.rejected, 5);
        assert_eq!(stats.active_keys, 0);
    }

    #[tokio::test]
    async fn timers_tolerate_missing_values() {
        let (_store, _pool, handler) = rig::<Timer>(&[10, 60], 1);

        handler.handle("glork", None, None).expect("no-op");
        assert_eq!(handler.statistics().active_keys, 0);
        assert_eq!(handler.statistics().rejected, 0);

        assert!(matches!(
            handler.handle("glork", Some("wat"), None),
            Err(Error::MalformedValue { .. })
        ));
    }

    #[tokio::test]
    async fn handler_set_flushes_every_kind() {
        let store = MemoryStore::new();
        let pool = Arc::new(WorkerPool::new(NonZeroUsize::new(2).expect("non-zero")));
        let set = HandlerSet::new(
            Arc::new(store.clone()),
            Arc::clone(&pool),
            retentions(&[10, 60]),
        );

        set.counters.handle("a", Some("1"), None).expect("accepted");
        set.gauges.handle("b", Some("2"), None).expect("accepted");
        set.timers.handle("c", Some("3"), None).expect("accepted");

        set.flush();
        pool.until_idle().await;

        assert_eq!(store.points("counters:a").len(), 1);
        assert_eq!(store.points("gauges:b").len(), 1);
        assert_eq!(store.points("timers:c:mean").len(), 1);

        let [counters, gauges, timers] = set.statistics();
        assert_eq!(counters.kind, "counters");
        assert_eq!(gauges.kind, "gauges");
        assert_eq!(timers.kind, "timers");
        assert!([counters, gauges, timers]
            .iter()
            .all(|stats| stats.flush_cycles == 1 && stats.received == 1));
    }
}
