use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{CounterStore, StoreError};
use crate::config::RedisConfig;

/// Redis-backed counter store.
///
/// Wraps a multiplexed `ConnectionManager` (cheap to clone, reconnects on
/// command failure) and bounds every command with the configured read/write
/// timeouts.
pub struct RedisCounterStore {
    conn: ConnectionManager,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl RedisCounterStore {
    /// Dials the server and verifies connectivity with a PING. A failure
    /// here is fatal at startup.
    pub async fn connect(cfg: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(cfg.url.as_str())
            .with_context(|| format!("invalid redis url {}", cfg.url))?;

        let mut conn = tokio::time::timeout(cfg.dial_timeout, client.get_connection_manager())
            .await
            .map_err(|_| anyhow::anyhow!("dial timed out after {:?}", cfg.dial_timeout))?
            .context("opening redis connection")?;

        let pong: String = tokio::time::timeout(cfg.dial_timeout, redis::cmd("PING").query_async(&mut conn))
            .await
            .map_err(|_| anyhow::anyhow!("ping timed out after {:?}", cfg.dial_timeout))?
            .context("pinging redis")?;
        if pong != "PONG" {
            anyhow::bail!("unexpected ping reply: {pong}");
        }

        tracing::info!(url = %cfg.url, "redis counter store connected");

        Ok(Self {
            conn,
            read_timeout: cfg.read_timeout,
            write_timeout: cfg.write_timeout,
        })
    }

    async fn run<T, F>(&self, op: &'static str, timeout: Duration, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout { op, timeout }),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: f64 = self
            .run("INCRBYFLOAT", self.write_timeout, async move {
                conn.incr(key, delta).await
            })
            .await?;
        Ok(())
    }

    async fn scan(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(Vec<String>, u64), StoreError> {
        let mut conn = self.conn.clone();
        let (next_cursor, keys): (u64, Vec<String>) = self
            .run("SCAN", self.read_timeout, async move {
                redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(count)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok((keys, next_cursor))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        self.run("GET", self.read_timeout, async move { conn.get(key).await })
            .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.run("SET", self.write_timeout, async move {
            conn.set(key, value).await
        })
        .await
    }

    async fn del(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: usize = self
            .run("DEL", self.write_timeout, async move {
                conn.del(keys).await
            })
            .await?;
        Ok(())
    }
}
