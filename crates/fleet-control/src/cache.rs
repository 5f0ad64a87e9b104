//! Contract of the external cache, which doubles as crawler registry storage
//! and as the blocking work queue feeding the dispatcher.

use std::time::Duration;

use async_trait::async_trait;

/// One write of an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheOp {
    SetEx {
        key: String,
        value: String,
        ttl: Duration,
    },
    Del {
        key: String,
    },
    ZAdd {
        key: String,
        member: String,
        score: f64,
    },
    ZRem {
        key: String,
        member: String,
    },
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;

    /// Sets `key` only if absent, returns whether it was set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool>;

    async fn exists(&self, key: &str) -> anyhow::Result<bool>;

    async fn del(&self, key: &str) -> anyhow::Result<()>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> anyhow::Result<()>;

    async fn zrem(&self, key: &str, member: &str) -> anyhow::Result<()>;

    /// All members ordered by ascending score.
    async fn zrange(&self, key: &str) -> anyhow::Result<Vec<String>>;

    async fn zcard(&self, key: &str) -> anyhow::Result<usize>;

    /// Applies every op or none of them.
    async fn atomic(&self, ops: Vec<CacheOp>) -> anyhow::Result<()>;

    async fn rpush(&self, key: &str, value: &str) -> anyhow::Result<()>;

    async fn lpush(&self, key: &str, value: &str) -> anyhow::Result<()>;

    /// Pops the list head, waiting up to `timeout` for one to show up.
    async fn blpop(&self, key: &str, timeout: Duration) -> anyhow::Result<Option<String>>;
}
