//! Redis-backed TAT store.
//!
//! All processes pointed at the same Redis share limits. Each evaluation is a
//! single `EVALSHA` of [`GCRA_SCRIPT`]; Redis runs scripts atomically, which
//! is what makes concurrent admissions for one key safe.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{RedisError, Script};
use tracing::{info, trace};

use super::backend::{StoreError, TatStore};
use super::gcra::GCRA_SCRIPT;
use crate::config::RedisConfig;

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Operation(err.to_string())
        }
    }
}

/// A TAT store backed by a shared Redis connection manager.
///
/// The manager multiplexes every call over one reconnecting connection, so
/// cloning it per call costs no connection setup.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    script: Script,
}

impl RedisStore {
    /// Connect to Redis and verify the connection with a `PING`.
    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url.as_str())?;
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(Duration::from_millis(config.connect_timeout_ms))
            .set_response_timeout(Duration::from_millis(config.response_timeout_ms));

        let ping_timeout = Duration::from_millis(config.startup_ping_timeout_ms);
        let store = tokio::time::timeout(ping_timeout, async {
            let conn = client.get_connection_manager_with_config(manager_config).await?;
            let store = Self::from_connection(conn);
            store.ping().await?;
            Ok::<_, StoreError>(store)
        })
        .await
        .map_err(|_| StoreError::Timeout(ping_timeout))??;

        let info = client.get_connection_info();
        info!(
            address = %info.addr,
            db = info.redis.db,
            "Redis connected"
        );

        Ok(store)
    }

    /// Wrap an already established connection manager.
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            script: Script::new(GCRA_SCRIPT),
        }
    }
}

#[async_trait]
impl TatStore for RedisStore {
    async fn evaluate(
        &self,
        key: &str,
        burst: u32,
        period_ns: u64,
        now_ns: u64,
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let reply: i64 = self
            .script
            .key(key)
            .arg(burst)
            .arg(period_ns)
            .arg(now_ns)
            .invoke_async(&mut conn)
            .await?;

        trace!(key = %key, reply = reply, "Evaluated GCRA script");
        Ok(reply)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
