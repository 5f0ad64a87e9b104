use std::sync::Arc;
use std::time::Duration;

use fleet_proto::Request;

use crate::cache::Cache;
use crate::error::Result;
use crate::ns::keys;

/// The work queue shared by every control plane instance.
///
/// A dedupe marker guards each request while it sits in the queue, so the
/// retry sweep and a node's error report can't enqueue the same request twice.
#[derive(Clone)]
pub struct RequestQueue {
    cache: Arc<dyn Cache>,
    dedupe_ttl: Duration,
}

impl RequestQueue {
    pub fn new(cache: Arc<dyn Cache>, dedupe_ttl: Duration) -> Self {
        Self { cache, dedupe_ttl }
    }

    /// Appends `req` at the tail, returns false if it is already queued.
    pub async fn publish(&self, req: &Request) -> Result<bool> {
        let fresh = self
            .cache
            .set_nx_ex(&keys::dedupe(&req.id), "1", self.dedupe_ttl)
            .await?;
        if !fresh {
            log::debug!("Request {} is already queued", req.id);
            return Ok(false);
        }

        let body = serde_json::to_string(req).map_err(anyhow::Error::from)?;
        if let Err(e) = self.cache.rpush(keys::WORK_QUEUE, &body).await {
            self.cache.del(&keys::dedupe(&req.id)).await?;
            return Err(e.into());
        }
        Ok(true)
    }

    /// Puts a raw message back at the head.
    pub async fn push_front(&self, raw: &str) -> Result<()> {
        self.cache.lpush(keys::WORK_QUEUE, raw).await?;
        Ok(())
    }

    /// Waits up to `timeout` for the head of the queue.
    pub async fn pop(&self, timeout: Duration) -> Result<Option<String>> {
        Ok(self.cache.blpop(keys::WORK_QUEUE, timeout).await?)
    }

    /// Drops the dedupe marker of a request that left the queue.
    pub async fn forget(&self, request_id: &str) -> Result<()> {
        self.cache.del(&keys::dedupe(request_id)).await?;
        Ok(())
    }
}
