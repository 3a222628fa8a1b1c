//! Optional write-through persistence for the Request Cache.
//!
//! The Request Cache (see `dex_proxy_core::request_cache`) is authoritative
//! in memory; this crate only mirrors its mutations so that a restart can
//! reload the cache without replaying already-submitted requests. Losing
//! this store loses nothing that chain/exchange polling can't eventually
//! rediscover.

pub mod errors;

use std::time::Duration;

use anyhow::Context;
use bb8_redis::{
    bb8,
    redis::{AsyncCommands, RedisResult},
    RedisConnectionManager,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{trace, warn};

pub use errors::RedisErrorSink;

pub type RedisPool = bb8::Pool<RedisConnectionManager>;

/// A small `bb8`-pooled wrapper that knows how to serialize/deserialize one
/// record type under a fixed key prefix (`client_request_id` for the
/// Request Cache).
#[derive(Clone)]
pub struct RedisStore {
    pool: RedisPool,
    key_prefix: String,
}

impl RedisStore {
    pub async fn connect(
        redis_url: String,
        min_size: u32,
        max_size: u32,
        key_prefix: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let manager = RedisConnectionManager::new(redis_url).context("invalid redis url")?;

        let pool = bb8::Pool::builder()
            .error_sink(RedisErrorSink.boxed_clone())
            .min_idle(Some(min_size))
            .max_size(max_size)
            .connection_timeout(Duration::from_secs(5))
            .build(manager)
            .await
            .context("failed to build redis pool")?;

        Ok(Self {
            pool,
            key_prefix: key_prefix.into(),
        })
    }

    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }

    fn key(&self, id: &str) -> String {
        format!("{}:{}", self.key_prefix, id)
    }

    /// At-least-once write-through. Callers must not assume this completed
    /// before returning a response to the client; the in-memory cache is
    /// authoritative.
    pub async fn put<T: Serialize + Sync>(&self, id: &str, value: &T) -> anyhow::Result<()> {
        let encoded = serde_json::to_vec(value).context("serializing record for redis")?;

        let mut conn = self.pool.get().await.context("redis pool exhausted")?;

        let _: RedisResult<()> = conn.set(self.key(id), encoded).await.map_err(|err| {
            warn!(?err, %id, "failed to write-through to redis");
            err
        });

        Ok(())
    }

    pub async fn get<T: DeserializeOwned>(&self, id: &str) -> anyhow::Result<Option<T>> {
        let mut conn = self.pool.get().await.context("redis pool exhausted")?;

        let raw: Option<Vec<u8>> = conn.get(self.key(id)).await.context("redis GET failed")?;

        match raw {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).context("decoding cached record")?,
            )),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, id: &str) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await.context("redis pool exhausted")?;
        let _: RedisResult<()> = conn.del(self.key(id)).await;
        Ok(())
    }

    /// Startup reload: scan every key under our prefix and decode it. Used
    /// to reconstruct the Request Cache (spec §4.3, §6 "Persisted state").
    pub async fn scan_all<T: DeserializeOwned>(&self) -> anyhow::Result<Vec<T>> {
        let mut conn = self.pool.get().await.context("redis pool exhausted")?;

        let pattern = format!("{}:*", self.key_prefix);
        let mut cursor: u64 = 0;
        let mut out = Vec::new();

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = bb8_redis::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut *conn)
                .await
                .context("redis SCAN failed")?;

            for key in keys {
                let raw: Option<Vec<u8>> = conn.get(&key).await.context("redis GET failed")?;
                if let Some(bytes) = raw {
                    match serde_json::from_slice::<T>(&bytes) {
                        Ok(value) => out.push(value),
                        Err(err) => warn!(?err, %key, "dropping unreadable persisted record"),
                    }
                }
            }

            trace!(cursor = next_cursor, found = out.len(), "redis scan page");

            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }

        Ok(out)
    }
}
