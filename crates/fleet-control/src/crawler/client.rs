use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_proto::{Crawler, ParseOutput, ParseTask};
use futures::stream::BoxStream;

pub type ParseStream = BoxStream<'static, anyhow::Result<ParseOutput>>;

/// Client side of a crawler's parse RPC.
#[async_trait]
pub trait CrawlerClient: Send + Sync {
    async fn parse(&self, task: &ParseTask) -> anyhow::Result<ParseStream>;

    async fn close(&self);
}

/// Opens clients to registered crawlers.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, crawler: &Crawler) -> anyhow::Result<Arc<dyn CrawlerClient>>;
}

/// A live crawler and the client pooled for it.
#[derive(Clone)]
pub struct CrawlerHandle {
    pub crawler: Crawler,
    pub client: Arc<dyn CrawlerClient>,
}

impl fmt::Debug for CrawlerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrawlerHandle")
            .field("crawler", &self.crawler)
            .finish()
    }
}
