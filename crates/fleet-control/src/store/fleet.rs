use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use fleet_proto::{ParseOutput, ParseTask};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::config::StoreConfig;
use crate::crawler::CrawlerRegistry;
use crate::error::{Error, Result};
use crate::ns::topics;
use crate::store::handler::{Concurrency, ParseSummary, StoreHandler};

/// Keeps one [`StoreHandler`] per store that has ever registered a crawler,
/// armed while the store has live crawlers.
pub struct StoreFleet {
    handlers: DashMap<String, Arc<StoreHandler>>,
    crawlers: Arc<CrawlerRegistry>,
    broker: Arc<dyn Broker>,
    config: StoreConfig,
    token: CancellationToken,
}

impl StoreFleet {
    /// Handler loops stop with `token`.
    pub fn new(
        crawlers: Arc<CrawlerRegistry>,
        broker: Arc<dyn Broker>,
        config: StoreConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            handlers: DashMap::new(),
            crawlers,
            broker,
            config,
            token,
        }
    }

    pub fn handler(&self, store_id: &str) -> Option<Arc<StoreHandler>> {
        self.handlers.get(store_id).map(|h| h.value().clone())
    }

    async fn ensure(&self, store_id: &str) -> Result<Arc<StoreHandler>> {
        if let Some(handler) = self.handler(store_id) {
            return Ok(handler);
        }

        let handler = Arc::new(StoreHandler::new(
            store_id,
            self.config.clone(),
            self.crawlers.clone(),
            self.broker.clone(),
        ));
        self.broker
            .subscribe(
                &topics::store_request(store_id),
                topics::STORE_CHANNEL,
                handler.clone(),
                handler.in_flight_limit(),
            )
            .await?;
        handler.spawn_feedback(self.token.child_token());
        handler.spawn_reclaim(self.token.child_token());
        self.handlers
            .insert(store_id.to_string(), handler.clone());
        log::info!("Store {store_id} joined the fleet");
        Ok(handler)
    }

    /// Aligns handlers with the crawlers currently registered.
    pub async fn reconcile(&self) -> Result<()> {
        let store_ids = self.crawlers.store_ids().await?;
        for store_id in &store_ids {
            if let Err(e) = self.reconcile_store(store_id).await {
                log::error!("Couldn't reconcile store {store_id}: {e}");
            }
        }

        let listed: HashSet<&String> = store_ids.iter().collect();
        let gone: Vec<Arc<StoreHandler>> = self
            .handlers
            .iter()
            .filter(|h| !listed.contains(h.key()))
            .map(|h| h.value().clone())
            .collect();
        for handler in gone {
            handler.disarm();
        }
        Ok(())
    }

    async fn reconcile_store(&self, store_id: &str) -> Result<()> {
        self.crawlers.clean(store_id).await?;
        let handler = self.ensure(store_id).await?;
        if self.crawlers.count(store_id).await? > 0 {
            handler.arm();
        } else {
            handler.disarm();
        }
        Ok(())
    }

    /// Runs `task` on the direct lane of `store_id`.
    pub async fn parse<F>(
        &self,
        store_id: &str,
        deadline: Instant,
        task: &ParseTask,
        callback: F,
    ) -> Result<ParseSummary>
    where
        F: FnMut(ParseOutput) + Send,
    {
        let handler = self
            .handler(store_id)
            .ok_or_else(|| Error::Unavailable(format!("Unknown store {store_id}")))?;
        handler.parse(deadline, task, callback).await
    }

    pub fn concurrency(&self) -> Vec<(String, Concurrency)> {
        let mut all: Vec<_> = self
            .handlers
            .iter()
            .map(|h| (h.key().clone(), h.value().concurrency()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn spawn(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let fleet = self.clone();
        tokio::spawn(async move {
            loop {
                match timeout(fleet.config.reconcile_interval(), token.cancelled()).await {
                    Ok(()) => break,
                    Err(_) => {
                        if let Err(e) = fleet.reconcile().await {
                            log::error!("Store reconciliation failed: {e}");
                        }
                    }
                }
            }
        })
    }
}
