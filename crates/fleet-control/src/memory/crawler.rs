use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_proto::{Crawler, ParseOutput, ParseTask};
use futures::{stream, StreamExt};

use crate::crawler::{Connector, CrawlerClient, ParseStream};

type Script = dyn Fn(&ParseTask) -> anyhow::Result<Vec<ParseOutput>> + Send + Sync;

/// Crawler client answering every parse call with the outputs of a script.
pub struct ScriptedClient {
    script: Arc<Script>,
    latency: Duration,
    calls: AtomicUsize,
    closed: AtomicBool,
}

impl ScriptedClient {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CrawlerClient for ScriptedClient {
    async fn parse(&self, task: &ParseTask) -> anyhow::Result<ParseStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let outputs = (self.script)(task)?;
        Ok(stream::iter(outputs.into_iter().map(Ok)).boxed())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out [`ScriptedClient`]s and keeps them around for inspection.
pub struct ScriptedConnector {
    script: Arc<Script>,
    latency: Duration,
    clients: std::sync::Mutex<Vec<Arc<ScriptedClient>>>,
}

impl ScriptedConnector {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&ParseTask) -> anyhow::Result<Vec<ParseOutput>> + Send + Sync + 'static,
    {
        Self {
            script: Arc::new(script),
            latency: Duration::ZERO,
            clients: Default::default(),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn clients(&self) -> Vec<Arc<ScriptedClient>> {
        self.clients
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _crawler: &Crawler) -> anyhow::Result<Arc<dyn CrawlerClient>> {
        let client = Arc::new(ScriptedClient {
            script: self.script.clone(),
            latency: self.latency,
            calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        self.clients
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(client.clone());
        Ok(client)
    }
}
