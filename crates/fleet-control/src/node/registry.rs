use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use fleet_proto::{
    Command, CommandError, HeartbeatPing, HeartbeatPong, Inbound, JoinPing, JoinPong, NodeStatus,
    Outbound, ParseFailure, Request, RequestStatus,
};
use futures::{Stream, StreamExt};
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::broker::{publish_json, Broker};
use crate::config::NodeConfig;
use crate::dispatch::{host_of, RequestQueue};
use crate::error::{Error, Result};
use crate::host_lock::{deadline_after, HostLocker};
use crate::node::frames::{FrameSink, Frames};
use crate::node::session::{Node, NodeSnapshot, Session};
use crate::ns::topics;
use crate::repo::{RequestError, RequestRepo};

/// Live node sessions and the protocol spoken over them.
pub struct NodeRegistry {
    sessions: DashMap<String, Arc<Session>>,
    repo: Arc<dyn RequestRepo>,
    broker: Arc<dyn Broker>,
    queue: RequestQueue,
    locker: HostLocker,
    config: NodeConfig,
}

impl NodeRegistry {
    pub fn new(
        repo: Arc<dyn RequestRepo>,
        broker: Arc<dyn Broker>,
        queue: RequestQueue,
        locker: HostLocker,
        config: NodeConfig,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            repo,
            broker,
            queue,
            locker,
            config,
        }
    }

    /// Serves one node stream until it ends. Returns the error that closed
    /// the session, if any. Only protocol violations close it: a report on an
    /// unknown request (`DataLoss`) or a collaborator failure is logged and
    /// the session keeps going.
    pub async fn serve<St, Si>(&self, inbound: St, sink: Si) -> Result<()>
    where
        St: Stream<Item = io::Result<Vec<u8>>> + Send,
        Si: FrameSink,
    {
        let session = Session::open(self.config.outbound_buffer, sink);
        self.sessions
            .insert(session.id().to_string(), session.clone());
        log::debug!("Session {} connected", session.id());

        let frames = Frames::new(inbound);
        futures::pin_mut!(frames);
        let res = loop {
            let frame = match frames.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            };
            match self.handle(&session, frame).await {
                Ok(()) => {}
                Err(e @ Error::InvalidArgument(_)) => break Err(e),
                Err(e) => log::error!("Session {}: {e}", session.id()),
            }
        };

        self.sessions.remove(session.id());
        if let Some(node) = session.node() {
            node.set_status(NodeStatus::Offline);
            log::info!("Node {} at {} left", node.id(), node.host());
        }
        if let Err(e) = &res {
            log::warn!("Closing session {}: {e}", session.id());
        }
        res
    }

    async fn handle(&self, session: &Session, frame: Inbound) -> Result<()> {
        match frame {
            Inbound::JoinPing(ping) => self.join(session, ping),
            frame if session.node().is_none() => Err(Error::InvalidArgument(format!(
                "Got {} before joinPing",
                frame.kind()
            ))),
            Inbound::HeartbeatPing(ping) => self.heartbeat(session, ping),
            Inbound::CommandError(report) => self.command_error(session, report).await,
            Inbound::CommandRequest(cmd) => self.command_request(cmd.request).await,
            Inbound::Item(item) => publish_json(self.broker.as_ref(), topics::ITEM, &item).await,
        }
    }

    fn join(&self, session: &Session, ping: JoinPing) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut desc = ping.node;
        if desc.host.is_empty() {
            return Err(Error::InvalidArgument("joinPing without a host".into()));
        }
        if desc.max_concurrency < 0 {
            return Err(Error::InvalidArgument(format!(
                "Negative max concurrency {}",
                desc.max_concurrency
            )));
        }
        if desc.id.is_empty() {
            desc.id = Uuid::new_v4().to_string();
        }

        // A reconnecting node supersedes its previous session
        for other in self.sessions.iter() {
            if other.key() == session.id() {
                continue;
            }
            if let Some(stale) = other.node().filter(|n| n.id() == desc.id) {
                stale.set_status(NodeStatus::Offline);
            }
        }

        let node = Arc::new(Node::new(desc));
        session.attach(node.clone());
        session.send(Outbound::JoinPong(JoinPong {
            node_id: node.id().to_string(),
            timestamp: now,
            network_delay_ms: (now - ping.timestamp).max(0),
            heartbeat_interval_ms: self.config.heartbeat_interval_ms,
        }));
        session.mark_initialized();
        log::info!(
            "Node {} joined from {} with concurrency {}",
            node.id(),
            node.host(),
            node.max_concurrency()
        );
        Ok(())
    }

    fn heartbeat(&self, session: &Session, ping: HeartbeatPing) -> Result<()> {
        let node = session
            .node()
            .ok_or_else(|| Error::InvalidArgument("heartbeatPing before joinPing".into()))?;
        node.heartbeat(ping.idle_concurrency, ping.max_concurrency);
        let now = Utc::now().timestamp_millis();
        session.send(Outbound::HeartbeatPong(HeartbeatPong {
            network_delay_ms: (now - ping.timestamp).max(0),
        }));
        Ok(())
    }

    /// Settles a node's report. Unknown requests are `DataLoss`, which `serve`
    /// logs without closing the session.
    async fn command_error(&self, session: &Session, report: CommandError) -> Result<()> {
        let Some(mut req) = self.repo.get(&report.request_id).await? else {
            return Err(Error::DataLoss(format!(
                "Node reported on unknown request {}",
                report.request_id
            )));
        };
        if let Ok(host) = host_of(&req.url) {
            self.locker.unlock(&host, &req.id);
        }

        if report.succeeded {
            req.status = RequestStatus::Done;
            self.repo.update(&req).await?;
            return Ok(());
        }

        let node_id = session.node().map(|n| n.id().to_string());
        self.repo
            .record_error(&RequestError {
                request_id: req.id.clone(),
                tracing_id: req.tracing_id.clone(),
                node_id,
                message: report.message.clone(),
                duration_ms: report.duration_ms,
                created_utc: Utc::now(),
            })
            .await?;
        let failure = ParseFailure {
            tracing_id: req.tracing_id.clone(),
            request_id: req.id.clone(),
            message: report.message,
        };
        if let Err(e) = publish_json(self.broker.as_ref(), topics::ERROR, &failure).await {
            log::warn!("Couldn't publish failure of request {}: {e}", req.id);
        }

        if !req.has_retry_budget() {
            req.status = RequestStatus::Done;
            self.repo.update(&req).await?;
            log::warn!(
                "Request {} gave up after {} retries",
                req.id,
                req.retry_count
            );
            return Ok(());
        }

        req.retry_count += 1;
        req.status = RequestStatus::Queued;
        self.repo.update(&req).await?;
        // The retry sweep picks it up if this fails
        if let Err(e) = self.queue.publish(&req).await {
            log::warn!("Couldn't requeue request {}: {e}", req.id);
        }
        Ok(())
    }

    async fn command_request(&self, mut req: Request) -> Result<()> {
        if let Err(e) = host_of(&req.url) {
            log::warn!("Dropping sub-request of {:?}: {e}", req.parent_id);
            return Ok(());
        }
        let max_depth = req.options.max_request_depth;
        if max_depth > 0 && req.depth > max_depth {
            log::debug!(
                "Dropping sub-request {} at depth {} beyond {max_depth}",
                req.url,
                req.depth
            );
            return Ok(());
        }
        if req.id.is_empty() {
            req.id = Uuid::new_v4().to_string();
        }
        req.status = RequestStatus::Queued;
        req.retry_count = 0;

        self.repo.insert(&req).await?;
        self.queue.publish(&req).await?;
        Ok(())
    }

    /// The online session with the most idle concurrency, if any has some.
    pub fn pick(&self) -> Option<Arc<Session>> {
        self.sessions
            .iter()
            .filter_map(|entry| {
                let node = entry.value().node()?;
                let idle = node.idle_concurrency();
                (node.is_online() && idle > 0).then(|| (idle, entry.value().clone()))
            })
            .max_by_key(|(idle, _)| *idle)
            .map(|(_, session)| session)
    }

    /// Polls for a session with spare capacity until `wait` elapses.
    pub async fn next_node(&self, wait: Duration) -> Result<Arc<Session>> {
        let deadline = deadline_after(Instant::now(), wait);
        loop {
            if let Some(session) = self.pick() {
                return Ok(session);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::DeadlineExceeded(format!(
                    "No node with idle concurrency within {wait:?}"
                )));
            }
            sleep(self.config.poll_interval().min(deadline - now)).await;
        }
    }

    /// Sends `request` to the node behind `session`.
    pub fn dispatch(&self, session: &Session, request: Request) -> Result<Arc<Node>> {
        let node = session
            .node()
            .ok_or_else(|| Error::Unavailable(format!("Session {} has no node", session.id())))?;
        let request_id = request.id.clone();
        if !session.send(Outbound::Command(Command { request })) {
            return Err(Error::Unavailable(format!(
                "Node {} didn't take request {request_id}",
                node.id()
            )));
        }
        node.reserve();
        Ok(node)
    }

    /// Waits for the most idle node and sends `request` to it.
    pub async fn send(&self, request: Request, wait: Duration) -> Result<Arc<Node>> {
        let session = self.next_node(wait).await?;
        self.dispatch(&session, request)
    }

    pub fn node(&self, node_id: &str) -> Option<Arc<Node>> {
        self.sessions
            .iter()
            .filter_map(|entry| entry.value().node())
            .find(|node| node.id() == node_id && node.is_online())
    }

    pub fn nodes(&self) -> Vec<NodeSnapshot> {
        self.sessions
            .iter()
            .filter_map(|entry| entry.value().node())
            .map(|node| node.snapshot())
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
