use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use crate::broker::{Broker, Message, MessageHandler};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    Requeued { delay: Duration, backoff: bool },
}

#[derive(Debug)]
pub struct MemoryMessage {
    id: String,
    body: Vec<u8>,
    attempts: u16,
    auto_response: AtomicBool,
    touches: AtomicUsize,
    outcome: Mutex<Option<Outcome>>,
}

impl MemoryMessage {
    pub fn new(body: Vec<u8>, attempts: u16) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            body,
            attempts,
            auto_response: AtomicBool::new(true),
            touches: AtomicUsize::new(0),
            outcome: Mutex::new(None),
        }
    }

    pub fn outcome(&self) -> Option<Outcome> {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn touches(&self) -> usize {
        self.touches.load(Ordering::SeqCst)
    }

    pub fn auto_response(&self) -> bool {
        self.auto_response.load(Ordering::SeqCst)
    }

    fn respond(&self, outcome: Outcome) -> anyhow::Result<()> {
        let mut current = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = *current {
            anyhow::bail!("Message {} already responded with {previous:?}", self.id);
        }
        *current = Some(outcome);
        Ok(())
    }
}

#[async_trait]
impl Message for MemoryMessage {
    fn id(&self) -> &str {
        &self.id
    }

    fn body(&self) -> &[u8] {
        &self.body
    }

    fn attempts(&self) -> u16 {
        self.attempts
    }

    fn disable_auto_response(&self) {
        self.auto_response.store(false, Ordering::SeqCst);
    }

    async fn touch(&self) -> anyhow::Result<()> {
        self.touches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn finish(&self) -> anyhow::Result<()> {
        self.respond(Outcome::Finished)
    }

    async fn requeue(&self, delay: Duration) -> anyhow::Result<()> {
        self.respond(Outcome::Requeued {
            delay,
            backoff: true,
        })
    }

    async fn requeue_without_backoff(&self, delay: Duration) -> anyhow::Result<()> {
        self.respond(Outcome::Requeued {
            delay,
            backoff: false,
        })
    }
}

struct Subscription {
    handler: Arc<dyn MessageHandler>,
    max_in_flight: watch::Receiver<usize>,
}

/// Broker that records what is published and lets callers hand messages to
/// subscribers explicitly.
#[derive(Default)]
pub struct MemoryBroker {
    published: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn published(&self) -> MutexGuard<'_, HashMap<String, Vec<Vec<u8>>>> {
        self.published.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<String, Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Bodies published on `topic`, oldest first.
    pub fn messages(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published().get(topic).cloned().unwrap_or_default()
    }

    pub fn decoded<T>(&self, topic: &str) -> Vec<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.messages(topic)
            .iter()
            .filter_map(|body| serde_json::from_slice(body).ok())
            .collect()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions().contains_key(topic)
    }

    /// In-flight limit the consumer of `topic` currently runs with.
    pub fn max_in_flight(&self, topic: &str) -> Option<usize> {
        self.subscriptions()
            .get(topic)
            .map(|s| *s.max_in_flight.borrow())
    }

    /// Delivers one message to the subscriber of `topic`.
    pub async fn deliver(
        &self,
        topic: &str,
        body: Vec<u8>,
        attempts: u16,
    ) -> Option<(Arc<MemoryMessage>, Result<()>)> {
        let handler = self.subscriptions().get(topic).map(|s| s.handler.clone())?;
        let msg = Arc::new(MemoryMessage::new(body, attempts));
        let res = handler.handle_message(msg.clone()).await;
        Some((msg, res))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, body: Vec<u8>) -> anyhow::Result<()> {
        self.published()
            .entry(topic.to_string())
            .or_default()
            .push(body);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        _channel: &str,
        handler: Arc<dyn MessageHandler>,
        max_in_flight: watch::Receiver<usize>,
    ) -> anyhow::Result<()> {
        self.subscriptions().insert(
            topic.to_string(),
            Subscription {
                handler,
                max_in_flight,
            },
        );
        Ok(())
    }
}
