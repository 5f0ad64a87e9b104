//! Redis implementation of the control plane cache contract.

use std::time::Duration;

use async_trait::async_trait;
use fleet_control::cache::{Cache, CacheOp};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};

#[derive(Debug, Clone)]
pub struct RedisCacheConfig {
    /// Redis connection URL
    pub url: String,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

impl RedisCacheConfig {
    pub fn with_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

/// Redis expiries have a one second resolution.
fn expiry_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

pub struct RedisCache {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisCache {
    pub async fn connect(config: &RedisCacheConfig) -> anyhow::Result<Self> {
        let client = Client::open(config.url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        log::info!("Connected to redis at {}", config.url);
        Ok(Self { client, conn })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.conn().get(key).await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let _: () = self.conn().set_ex(key, value, expiry_secs(ttl)).await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(expiry_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.conn().exists(key).await?)
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        let _: () = self.conn().del(key).await?;
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> anyhow::Result<()> {
        let _: () = self.conn().zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> anyhow::Result<()> {
        let _: () = self.conn().zrem(key, member).await?;
        Ok(())
    }

    async fn zrange(&self, key: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.conn().zrange(key, 0, -1).await?)
    }

    async fn zcard(&self, key: &str) -> anyhow::Result<usize> {
        Ok(self.conn().zcard(key).await?)
    }

    async fn atomic(&self, ops: Vec<CacheOp>) -> anyhow::Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                CacheOp::SetEx { key, value, ttl } => {
                    pipe.set_ex(key, value, expiry_secs(*ttl)).ignore();
                }
                CacheOp::Del { key } => {
                    pipe.del(key).ignore();
                }
                CacheOp::ZAdd { key, member, score } => {
                    pipe.zadd(key, member, *score).ignore();
                }
                CacheOp::ZRem { key, member } => {
                    pipe.zrem(key, member).ignore();
                }
            }
        }
        let mut conn = self.conn();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let _: () = self.conn().rpush(key, value).await?;
        Ok(())
    }

    async fn lpush(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let _: () = self.conn().lpush(key, value).await?;
        Ok(())
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> anyhow::Result<Option<String>> {
        // BLPOP parks the whole connection, keep it off the shared one
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let popped: Option<(String, String)> = conn.blpop(key, timeout.as_secs_f64()).await?;
        Ok(popped.map(|(_, value)| value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = RedisCacheConfig::default();
        assert_eq!(config.url, "redis://127.0.0.1:6379");
    }

    #[test]
    fn config_with_url() {
        let config = RedisCacheConfig::with_url("redis://cache:6380/2");
        assert_eq!(config.url, "redis://cache:6380/2");
    }

    #[test]
    fn expiry_rounds_up_to_a_second() {
        assert_eq!(expiry_secs(Duration::from_millis(10)), 1);
        assert_eq!(expiry_secs(Duration::from_secs(60)), 60);
    }
}
