use std::sync::Arc;

use fleet_proto::{Request, RequestStatus};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::cache::Cache;
use crate::config::ControlConfig;
use crate::crawler::{Connector, CrawlerRegistry};
use crate::dispatch::{host_of, Dispatcher, RequestQueue};
use crate::error::Result;
use crate::host_lock::HostLocker;
use crate::node::NodeRegistry;
use crate::repo::RequestRepo;
use crate::store::StoreFleet;

/// Every control plane component, wired over the given collaborators.
pub struct ControlPlane {
    config: ControlConfig,
    repo: Arc<dyn RequestRepo>,
    locker: HostLocker,
    queue: RequestQueue,
    nodes: Arc<NodeRegistry>,
    crawlers: Arc<CrawlerRegistry>,
    fleet: Arc<StoreFleet>,
    dispatcher: Arc<Dispatcher>,
    stores_token: CancellationToken,
}

impl ControlPlane {
    pub fn new(
        config: ControlConfig,
        cache: Arc<dyn Cache>,
        broker: Arc<dyn Broker>,
        repo: Arc<dyn RequestRepo>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;

        let locker = HostLocker::new(&config.host_lock);
        let queue = RequestQueue::new(cache.clone(), config.dispatch.dedupe_ttl());
        let nodes = Arc::new(NodeRegistry::new(
            repo.clone(),
            broker.clone(),
            queue.clone(),
            locker.clone(),
            config.node.clone(),
        ));
        let crawlers = Arc::new(CrawlerRegistry::new(cache, connector, &config.registry));
        let stores_token = CancellationToken::new();
        let fleet = Arc::new(StoreFleet::new(
            crawlers.clone(),
            broker,
            config.store.clone(),
            stores_token.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            nodes.clone(),
            locker.clone(),
            queue.clone(),
            repo.clone(),
            config.dispatch.clone(),
        ));

        Ok(Self {
            config,
            repo,
            locker,
            queue,
            nodes,
            crawlers,
            fleet,
            dispatcher,
            stores_token,
        })
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn host_locker(&self) -> &HostLocker {
        &self.locker
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.nodes
    }

    pub fn crawlers(&self) -> &Arc<CrawlerRegistry> {
        &self.crawlers
    }

    pub fn fleet(&self) -> &Arc<StoreFleet> {
        &self.fleet
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Persists a new request and queues it for dispatch.
    pub async fn submit(&self, mut req: Request) -> Result<()> {
        host_of(&req.url)?;
        req.status = RequestStatus::Queued;
        req.retry_count = 0;
        self.repo.insert(&req).await?;
        self.queue.publish(&req).await?;
        Ok(())
    }

    /// Runs every background loop until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        if let Err(e) = self.fleet.reconcile().await {
            log::error!("Initial store reconciliation failed: {e}");
        }

        let loops = vec![
            self.locker
                .spawn_sweeper(self.config.host_lock.sweep_interval(), token.clone()),
            self.crawlers
                .spawn_watcher(self.config.registry.watch_interval(), token.clone()),
            self.fleet.spawn(token.clone()),
            self.dispatcher.spawn_retry_sweep(token.clone()),
            self.dispatcher.spawn(token.clone()),
        ];
        log::info!("Control plane running");

        for res in join_all(loops).await {
            if let Err(e) = res {
                log::error!("Control loop crashed: {e}");
            }
        }
        self.stores_token.cancel();
        log::info!("Control plane stopped");
    }
}
