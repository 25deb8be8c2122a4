use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::warn;

use crate::error::Result;

use super::Store;

/// Namespace prefix for every key this exporter writes to redis.
const KEY_PREFIX: &str = "age:last_updated:";

/// Redis-backed implementation of [`Store`], allowing multiple replicas to
/// share last-updated timestamps. Values are unix epoch seconds stored as
/// decimal ASCII.
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Connects to the given redis URL (`redis://` or `rediss://`) and
    /// verifies connectivity with a PING.
    pub async fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_tokio_connection().await?;

        let _: () = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(Self { conn })
    }

    fn full_key(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get_last_updated(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(Self::full_key(key)).await?;

        let Some(value) = value else {
            return Ok(None);
        };

        // An unparseable value degrades to "fetch all" rather than failing
        // the cycle.
        match value.parse::<i64>() {
            Ok(epoch) => Ok(Utc.timestamp_opt(epoch, 0).single()),
            Err(_) => {
                warn!(key, value, "ignoring unparseable stored timestamp");
                Ok(None)
            }
        }
    }

    async fn set_last_updated(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(Self::full_key(key), at.timestamp().to_string())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // The multiplexed connection closes when the last clone is dropped.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_key_layout() {
        assert_eq!(
            RedisStore::full_key("group/app:pipelines"),
            "age:last_updated:group/app:pipelines"
        );
    }
}
