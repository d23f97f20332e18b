use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult, Script};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::{ttl_secs, window_start, CounterStore, MarkerOutcome, StoreError};

/// Prune, count, and conditionally record a marker in one round trip.
///
/// KEYS[1] window key
/// ARGV[1] window start (inclusive), ARGV[2] now, ARGV[3] limit,
/// ARGV[4] member, ARGV[5] ttl seconds
static ADMIT_MARKER: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
local count = redis.call('ZCOUNT', KEYS[1], ARGV[1], '+inf')
if count >= tonumber(ARGV[3]) then
  return {count, 0}
end
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[4])
redis.call('EXPIRE', KEYS[1], ARGV[5])
return {count + 1, 1}
"#,
    )
});

/// A [`CounterStore`] backed by Redis.
///
/// The connection is established on first use and then shared through a
/// [`ConnectionManager`], which reconnects on its own after failures. Every
/// command is bounded by the configured timeout.
pub struct RedisCounterStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    timeout: Duration,
    connect_timeout: Duration,
}

impl RedisCounterStore {
    pub fn new(url: &str, timeout: Duration, connect_timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            timeout,
            connect_timeout,
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let connect = ConnectionManager::new(self.client.clone());
                match tokio::time::timeout(self.connect_timeout, connect).await {
                    Ok(Ok(manager)) => {
                        info!("connected to redis counter store");
                        Ok(manager)
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "failed to connect to redis counter store");
                        Err(StoreError::Redis(e))
                    }
                    Err(_) => {
                        warn!(timeout = ?self.connect_timeout, "timed out connecting to redis counter store");
                        Err(StoreError::Timeout(self.connect_timeout))
                    }
                }
            })
            .await?;
        Ok(manager.clone())
    }

    async fn run<T>(&self, command: impl Future<Output = RedisResult<T>>) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, command).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: i64 = self.run(conn.zadd(key, member, score)).await?;
        Ok(())
    }

    async fn zcount(&self, key: &str, min_score: i64) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        self.run(conn.zcount(key, min_score, "+inf")).await
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        self.run(conn.zcard(key)).await
    }

    async fn zremrangebyscore(&self, key: &str, max_score: i64) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let max = format!("({}", max_score);
        self.run(conn.zrembyscore(key, "-inf", max)).await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: bool = self.run(conn.expire(key, ttl_secs as i64)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        self.run(conn.get(key)).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = self.run(conn.set_ex(key, value, ttl_secs)).await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        self.run(conn.del(keys)).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        let mut keys: Vec<String> = self.run(conn.keys(pattern)).await?;
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: String = self
            .run(redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn admit_marker(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: u64,
        limit: u64,
        member: &str,
    ) -> Result<MarkerOutcome, StoreError> {
        let mut conn = self.connection().await?;
        let window_start = window_start(now_ms, window_ms);
        let mut invocation = ADMIT_MARKER.key(key);
        invocation
            .arg(window_start)
            .arg(now_ms)
            .arg(limit)
            .arg(member)
            .arg(ttl_secs(window_ms));
        let (count, inserted): (u64, i64) =
            self.run(invocation.invoke_async(&mut conn)).await?;
        Ok(MarkerOutcome {
            count,
            inserted: inserted == 1,
        })
    }
}
