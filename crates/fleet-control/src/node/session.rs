use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, TimeZone, Utc};
use fleet_proto::{NodeDescriptor, NodeStatus, Outbound};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::node::frames::FrameSink;

/// A joined worker, alive as long as its session.
#[derive(Debug)]
pub struct Node {
    id: String,
    host: String,
    max_concurrency: AtomicI64,
    idle_concurrency: AtomicI64,
    status: Mutex<NodeStatus>,
    online_utc: DateTime<Utc>,
    last_heartbeat_ms: AtomicI64,
}

/// Point in time view of a [`Node`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    pub id: String,
    pub host: String,
    pub max_concurrency: i64,
    pub idle_concurrency: i64,
    pub status: NodeStatus,
    pub online_utc: DateTime<Utc>,
    pub last_heartbeat_utc: DateTime<Utc>,
}

impl Node {
    pub(crate) fn new(desc: NodeDescriptor) -> Self {
        let now = Utc::now();
        Self {
            id: desc.id,
            host: desc.host,
            max_concurrency: AtomicI64::new(desc.max_concurrency),
            idle_concurrency: AtomicI64::new(desc.max_concurrency),
            status: Mutex::new(NodeStatus::Online),
            online_utc: now,
            last_heartbeat_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn idle_concurrency(&self) -> i64 {
        self.idle_concurrency.load(Ordering::SeqCst)
    }

    pub fn max_concurrency(&self) -> i64 {
        self.max_concurrency.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_status(&self, status: NodeStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub fn is_online(&self) -> bool {
        self.status() == NodeStatus::Online
    }

    pub fn last_heartbeat_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_heartbeat_ms.load(Ordering::SeqCst))
            .single()
            .unwrap_or(self.online_utc)
    }

    /// The node's own report is authoritative and overwrites whatever was
    /// reserved since the last heartbeat.
    pub(crate) fn heartbeat(&self, idle: i64, max: i64) {
        self.idle_concurrency.store(idle, Ordering::SeqCst);
        self.max_concurrency.store(max, Ordering::SeqCst);
        self.last_heartbeat_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    /// Optimistically takes one idle slot ahead of the next heartbeat.
    pub(crate) fn reserve(&self) {
        self.idle_concurrency.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id.clone(),
            host: self.host.clone(),
            max_concurrency: self.max_concurrency(),
            idle_concurrency: self.idle_concurrency(),
            status: self.status(),
            online_utc: self.online_utc,
            last_heartbeat_utc: self.last_heartbeat_utc(),
        }
    }
}

/// One node connection.
///
/// Outbound frames go through a bounded buffer drained by a dedicated writer
/// task, which holds everything back until the join handshake is done.
#[derive(Debug)]
pub struct Session {
    id: String,
    node: RwLock<Option<Arc<Node>>>,
    outbound: mpsc::Sender<Outbound>,
    initialized: watch::Sender<bool>,
    dropped: AtomicUsize,
}

impl Session {
    pub(crate) fn open<Si: FrameSink>(buffer: usize, sink: Si) -> Arc<Self> {
        let (outbound, rx) = mpsc::channel(buffer.max(1));
        let (initialized, ready) = watch::channel(false);
        let session = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            node: RwLock::new(None),
            outbound,
            initialized,
            dropped: AtomicUsize::new(0),
        });
        tokio::spawn(write_frames(session.id.clone(), rx, ready, sink));
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn node(&self) -> Option<Arc<Node>> {
        self.node
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn attach(&self, node: Arc<Node>) {
        *self.node.write().unwrap_or_else(PoisonError::into_inner) = Some(node);
    }

    pub fn is_initialized(&self) -> bool {
        *self.initialized.borrow()
    }

    pub(crate) fn mark_initialized(&self) {
        self.initialized.send_replace(true);
    }

    /// Number of outbound frames lost to a full buffer.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Queues a frame without waiting, returns false if it was dropped.
    pub(crate) fn send(&self, frame: Outbound) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                log::warn!(
                    "Outbound buffer of session {} is full, dropping {frame:?}",
                    self.id
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Session {} is closed, dropping frame", self.id);
                false
            }
        }
    }
}

async fn write_frames<Si: FrameSink>(
    session_id: String,
    rx: mpsc::Receiver<Outbound>,
    mut ready: watch::Receiver<bool>,
    mut sink: Si,
) {
    if ready.wait_for(|initialized| *initialized).await.is_err() {
        return;
    }

    let mut frames = ReceiverStream::new(rx);
    while let Some(frame) = frames.next().await {
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Session {session_id}: {e}");
                continue;
            }
        };
        if let Err(e) = sink.send(bytes).await {
            log::warn!("Session {session_id} stopped writing: {e}");
            break;
        }
    }
}
