//! Storage client for the stowage daemon.
//!
//! The aggregation pipeline talks to its backing time-series store through
//! the [`Store`] trait: append a time-indexed point, push raw samples into a
//! per-(key, level) bucket, atomically drain such a bucket, and register keys
//! in the durable catalog of known metric names. Two backends are provided:
//! an in-memory store suitable for a single process and for tests, and a
//! Redis adapter carrying the daemon's persisted layout.
//!
//! Write failures propagate to the caller -- the pipeline logs them and the
//! affected window contribution is lost, consistent with the at-most-once
//! semantics of the transport upstream. The read helper [`Store::range`] is
//! the intentional exception: it degrades to an empty result on backend
//! error rather than propagating.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use async_trait::async_trait;

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// A single time-indexed observation read back from a series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    /// Unix timestamp of the window the value belongs to.
    pub timestamp: i64,
    /// The stored value.
    pub value: f64,
}

/// Errors produced by [`Store`] implementations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The backend rejected or failed an operation.
    #[error("storage backend error: {0}")]
    Backend(String),
    /// Wrapper around [`::redis::RedisError`].
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// The backing time-series and accumulation store.
///
/// Keys arrive fully namespaced (`counters:foo`, `timers:bar:upper_90`).
/// Raw sample buckets are addressed by (key, retention level) and have list
/// semantics: repeated pushes of equal values are all retained.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist one time-indexed value for `key`.
    ///
    /// Writes at the same timestamp with different values must remain
    /// distinguishable; re-writing the same (timestamp, value) pair is
    /// idempotent.
    async fn append_point(&self, timestamp: i64, key: &str, value: f64) -> Result<(), Error>;

    /// Append `values` to the raw bucket for (`key`, `level`) and refresh the
    /// bucket's expiry to `2 x level` seconds.
    ///
    /// The expiry is a self-cleaning safeguard: if a rollup is skipped the
    /// bucket does not grow without bound.
    async fn push_raw(&self, key: &str, level: i64, values: &[f64]) -> Result<(), Error>;

    /// Atomically remove and return everything buffered for (`key`, `level`).
    ///
    /// Pushes concurrent with the drain belong to the next cycle: they are
    /// neither lost nor returned twice. Draining an empty or expired bucket
    /// returns an empty vector.
    async fn drain_raw(&self, key: &str, level: i64) -> Result<Vec<f64>, Error>;

    /// Add `keys` to the durable catalog of known metric names. Idempotent.
    async fn register_keys(&self, keys: &[String]) -> Result<(), Error>;

    /// Read the points stored for `key` in `[from, to]`, inclusive.
    ///
    /// Degrades to an empty result on backend error.
    async fn range(&self, key: &str, from: i64, to: i64) -> Vec<Point>;
}
