mod queue;

use std::sync::Arc;

use fleet_proto::{Request, RequestStatus};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use url::Url;

pub use queue::RequestQueue;

use crate::config::DispatchConfig;
use crate::error::{Error, Result};
use crate::host_lock::HostLocker;
use crate::node::{Node, NodeRegistry, Session};
use crate::repo::RequestRepo;

/// Target host of a request url.
pub(crate) fn host_of(url: &str) -> Result<String> {
    let parsed =
        Url::parse(url).map_err(|e| Error::InvalidArgument(format!("Invalid url {url}: {e}")))?;
    parsed
        .host_str()
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidArgument(format!("No host in url {url}")))
}

/// What one turn of the dispatch loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Nothing was queued
    Idle,
    /// The message couldn't be used and is gone
    Dropped,
    /// The host was at its limit, the message went back to the head
    Deferred,
    Sent { request_id: String, node_id: String },
}

/// Moves queued requests onto nodes.
pub struct Dispatcher {
    nodes: Arc<NodeRegistry>,
    locker: HostLocker,
    queue: RequestQueue,
    repo: Arc<dyn RequestRepo>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        nodes: Arc<NodeRegistry>,
        locker: HostLocker,
        queue: RequestQueue,
        repo: Arc<dyn RequestRepo>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            nodes,
            locker,
            queue,
            repo,
            config,
        }
    }

    /// Re-publishes requests sent back for another attempt, returns how many
    /// were actually enqueued.
    pub async fn retry_sweep(&self) -> Result<usize> {
        let mut published = 0;
        for req in self.repo.list_retryable(self.config.retry_batch).await? {
            if self.queue.publish(&req).await? {
                published += 1;
            }
        }
        if published > 0 {
            log::info!("Re-published {published} request(s) for retry");
        }
        Ok(published)
    }

    /// Pops one request and hands it to the most idle node.
    pub async fn dispatch_next(&self) -> Result<Step> {
        let Some(raw) = self.queue.pop(self.config.pop_timeout()).await? else {
            return Ok(Step::Idle);
        };
        let req: Request = match serde_json::from_str(&raw) {
            Ok(req) => req,
            Err(e) => {
                log::warn!("Dropping malformed queued request: {e}");
                return Ok(Step::Dropped);
            }
        };
        let host = match host_of(&req.url) {
            Ok(host) => host,
            Err(e) => {
                log::warn!("Dropping request {}: {e}", req.id);
                self.queue.forget(&req.id).await?;
                self.repo.set_status(&req.id, RequestStatus::Done).await?;
                return Ok(Step::Dropped);
            }
        };

        let session = match self.nodes.next_node(self.config.node_wait()).await {
            Ok(session) => session,
            Err(e) => {
                self.queue.push_front(&raw).await?;
                return Err(e);
            }
        };

        if !self.locker.lock(&host, &req.id, req.options.max_ttl()) {
            self.queue.push_front(&raw).await?;
            self.queue.forget(&req.id).await?;
            return Ok(Step::Deferred);
        }

        let request_id = req.id.clone();
        let sent = match self.hand_over(&session, req).await {
            Ok(node) => node,
            Err(e) => {
                self.locker.unlock(&host, &request_id);
                if let Err(e) = self
                    .repo
                    .set_status(&request_id, RequestStatus::Queued)
                    .await
                {
                    log::warn!("Couldn't reset status of request {request_id}: {e}");
                }
                self.queue.push_front(&raw).await?;
                return Err(e);
            }
        };
        log::debug!("Request {request_id} sent to node {}", sent.id());
        Ok(Step::Sent {
            request_id,
            node_id: sent.id().to_string(),
        })
    }

    /// Marks `req` dispatched and sends it over `session`. The caller owns the
    /// host slot and gives it back on error.
    async fn hand_over(&self, session: &Session, req: Request) -> Result<Arc<Node>> {
        self.queue.forget(&req.id).await?;
        self.repo
            .set_status(&req.id, RequestStatus::Dispatched)
            .await?;
        self.nodes.dispatch(session, req)
    }

    pub fn spawn(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            while !token.is_cancelled() {
                match dispatcher.dispatch_next().await {
                    Ok(Step::Deferred) => sleep(dispatcher.config.lock_retry()).await,
                    Ok(_) => {}
                    Err(e @ Error::DeadlineExceeded(_)) => log::debug!("{e}"),
                    Err(e) => {
                        log::error!("Dispatch failed: {e}");
                        sleep(dispatcher.config.lock_retry()).await;
                    }
                }
            }
        })
    }

    pub fn spawn_retry_sweep(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            loop {
                match timeout(dispatcher.config.retry_sweep(), token.cancelled()).await {
                    Ok(()) => break,
                    Err(_) => {
                        if let Err(e) = dispatcher.retry_sweep().await {
                            log::error!("Retry sweep failed: {e}");
                        }
                    }
                }
            }
        })
    }
}
