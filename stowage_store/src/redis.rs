//! Redis-backed [`Store`] adapter.
//!
//! Persisted layout:
//!
//! * one sorted set per metric key, member `"<timestamp>:<value>"` scored by
//!   timestamp, so identical timestamps with different values remain
//!   distinguishable;
//! * one list per raw bucket named `acc-<key>:<level>`, expiring at
//!   `2 x level` seconds with the expiry refreshed on every push;
//! * the catalog as the set `datapoints`.
//!
//! The atomic drain is a Lua script reading and deleting the bucket in one
//! invocation; pushes landing after the script belong to the next cycle.

use std::sync::Arc;

use async_trait::async_trait;
use redis::{AsyncCommands, Client, Script, aio::MultiplexedConnection};
use serde::Deserialize;
use tracing::warn;

use crate::{Error, Point, Store};

const CATALOG_KEY: &str = "datapoints";

const DRAIN_SCRIPT: &str = r"
local values = redis.call('LRANGE', KEYS[1], 0, -1)
redis.call('DEL', KEYS[1])
return values
";

fn default_url() -> String {
    "redis://127.0.0.1:6379".to_owned()
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration of [`RedisStore`].
pub struct Config {
    /// Connection URL, `redis://127.0.0.1:6379` by default.
    #[serde(default = "default_url")]
    pub url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: default_url(),
        }
    }
}

#[allow(missing_debug_implementations)]
/// A Redis-backed store.
///
/// Cheap to clone; clones share the underlying multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    drain_script: Arc<Script>,
}

impl RedisStore {
    /// Connect to the Redis instance named by `config`.
    ///
    /// # Errors
    ///
    /// Function will return an error if the URL does not parse or the
    /// connection cannot be established.
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        let client = Client::open(config.url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            drain_script: Arc::new(Script::new(DRAIN_SCRIPT)),
        })
    }

    fn bucket_key(key: &str, level: i64) -> String {
        format!("acc-{key}:{level}")
    }
}

fn parse_member(member: &str) -> Option<Point> {
    let (timestamp, value) = member.split_once(':')?;
    Some(Point {
        timestamp: timestamp.parse().ok()?,
        value: value.parse().ok()?,
    })
}

#[async_trait]
impl Store for RedisStore {
    async fn append_point(&self, timestamp: i64, key: &str, value: f64) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let member = format!("{timestamp}:{value}");
        let () = conn.zadd(key, member, timestamp).await?;
        Ok(())
    }

    async fn push_raw(&self, key: &str, level: i64, values: &[f64]) -> Result<(), Error> {
        if values.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let bucket = Self::bucket_key(key, level);
        let () = redis::pipe()
            .rpush(&bucket, values)
            .ignore()
            .expire(&bucket, level.saturating_mul(2))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn drain_raw(&self, key: &str, level: i64) -> Result<Vec<f64>, Error> {
        let mut conn = self.conn.clone();
        let bucket = Self::bucket_key(key, level);
        let values: Vec<f64> = self
            .drain_script
            .key(bucket)
            .invoke_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn register_keys(&self, keys: &[String]) -> Result<(), Error> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let () = conn.sadd(CATALOG_KEY, keys).await?;
        Ok(())
    }

    async fn range(&self, key: &str, from: i64, to: i64) -> Vec<Point> {
        let mut conn = self.conn.clone();
        let members: Result<Vec<String>, _> = conn.zrangebyscore(key, from, to).await;
        match members {
            Ok(members) => members
                .iter()
                .map(String::as_str)
                .filter_map(parse_member)
                .collect(),
            Err(err) => {
                warn!(%key, %err, "range read failed, degrading to empty");
                Vec::new()
            }
        }
    }
}
