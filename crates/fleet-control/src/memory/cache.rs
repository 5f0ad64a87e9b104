use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use crate::cache::{Cache, CacheOp};
use crate::host_lock::deadline_after;

#[derive(Debug, Default)]
struct Inner {
    values: HashMap<String, (String, Option<Instant>)>,
    zsets: HashMap<String, HashMap<String, f64>>,
    lists: HashMap<String, VecDeque<String>>,
}

impl Inner {
    fn live_value(&mut self, key: &str) -> Option<&String> {
        let expired = matches!(
            self.values.get(key),
            Some((_, Some(deadline))) if *deadline <= Instant::now()
        );
        if expired {
            self.values.remove(key);
        }
        self.values.get(key).map(|(v, _)| v)
    }

    fn apply(&mut self, op: CacheOp) {
        match op {
            CacheOp::SetEx { key, value, ttl } => {
                let expires = deadline_after(Instant::now(), ttl);
                self.values.insert(key, (value, Some(expires)));
            }
            CacheOp::Del { key } => {
                self.values.remove(&key);
                self.zsets.remove(&key);
                self.lists.remove(&key);
            }
            CacheOp::ZAdd { key, member, score } => {
                self.zsets.entry(key).or_default().insert(member, score);
            }
            CacheOp::ZRem { key, member } => {
                if let Some(zset) = self.zsets.get_mut(&key) {
                    zset.remove(&member);
                    if zset.is_empty() {
                        self.zsets.remove(&key);
                    }
                }
            }
        }
    }
}

/// In-process cache with the same semantics as the external one, expiry
/// follows tokio's clock.
#[derive(Debug, Default)]
pub struct MemoryCache {
    inner: Mutex<Inner>,
    pushed: Notify,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn list_len(&self, key: &str) -> usize {
        self.inner().lists.get(key).map(VecDeque::len).unwrap_or(0)
    }

    fn pop_front(&self, key: &str) -> Option<String> {
        self.inner().lists.get_mut(key).and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.inner().live_value(key).cloned())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        self.inner().apply(CacheOp::SetEx {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        });
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool> {
        let mut inner = self.inner();
        if inner.live_value(key).is_some() {
            return Ok(false);
        }
        inner.apply(CacheOp::SetEx {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        });
        Ok(true)
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let mut inner = self.inner();
        Ok(inner.live_value(key).is_some()
            || inner.zsets.contains_key(key)
            || inner.lists.get(key).map_or(false, |l| !l.is_empty()))
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        self.inner().apply(CacheOp::Del {
            key: key.to_string(),
        });
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> anyhow::Result<()> {
        self.inner().apply(CacheOp::ZAdd {
            key: key.to_string(),
            member: member.to_string(),
            score,
        });
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> anyhow::Result<()> {
        self.inner().apply(CacheOp::ZRem {
            key: key.to_string(),
            member: member.to_string(),
        });
        Ok(())
    }

    async fn zrange(&self, key: &str) -> anyhow::Result<Vec<String>> {
        let inner = self.inner();
        let mut members: Vec<(&String, &f64)> = inner
            .zsets
            .get(key)
            .map(|zset| zset.iter().collect())
            .unwrap_or_default();
        members.sort_by(|(m1, s1), (m2, s2)| s1.total_cmp(s2).then_with(|| m1.cmp(m2)));
        Ok(members.into_iter().map(|(m, _)| m.clone()).collect())
    }

    async fn zcard(&self, key: &str) -> anyhow::Result<usize> {
        Ok(self.inner().zsets.get(key).map(HashMap::len).unwrap_or(0))
    }

    async fn atomic(&self, ops: Vec<CacheOp>) -> anyhow::Result<()> {
        let mut inner = self.inner();
        for op in ops {
            inner.apply(op);
        }
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.inner()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn lpush(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.inner()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> anyhow::Result<Option<String>> {
        let deadline = deadline_after(Instant::now(), timeout);
        loop {
            let pushed = self.pushed.notified();
            tokio::pin!(pushed);
            pushed.as_mut().enable();

            if let Some(value) = self.pop_front(key) {
                return Ok(Some(value));
            }
            if timeout_at(deadline, pushed).await.is_err() {
                return Ok(None);
            }
        }
    }
}
