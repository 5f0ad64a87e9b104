use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use fleet_proto::Crawler;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::cache::{Cache, CacheOp};
use crate::config::RegistryConfig;
use crate::crawler::client::{Connector, CrawlerHandle};
use crate::error::{Error, Result};
use crate::ns::keys;

/// Which crawlers exist, which store each one serves and whether they are
/// still alive.
///
/// Detail records live in the cache with a TTL while the per-store and
/// global indexes are sorted sets without expiry, `clean` reconciles the two.
pub struct CrawlerRegistry {
    cache: Arc<dyn Cache>,
    connector: Arc<dyn Connector>,
    handles: DashMap<String, Arc<CrawlerHandle>>,
    ttl: Duration,
}

impl CrawlerRegistry {
    pub fn new(cache: Arc<dyn Cache>, connector: Arc<dyn Connector>, config: &RegistryConfig) -> Self {
        Self {
            cache,
            connector,
            handles: DashMap::new(),
            ttl: config.crawler_ttl(),
        }
    }

    pub async fn register(
        &self,
        node_id: &str,
        store_id: &str,
        version: &str,
        serve_addr: &str,
        allowed_domains: Vec<String>,
    ) -> Result<Crawler> {
        if store_id.is_empty() || serve_addr.is_empty() {
            return Err(Error::InvalidArgument(
                "Crawler registration needs a store id and a serve address".into(),
            ));
        }
        let mut crawler = Crawler::new(node_id, store_id, version, serve_addr);
        crawler.allowed_domains = allowed_domains;
        if let Some(known) = self.get(&crawler.id).await? {
            crawler.online_utc = known.online_utc;
        }
        self.cache(&crawler, self.ttl).await?;
        log::info!(
            "Crawler {} v{} registered for store {store_id} at {serve_addr}",
            crawler.id,
            crawler.version
        );
        Ok(crawler)
    }

    /// Extends the life of a registered crawler.
    pub async fn heartbeat(&self, crawler_id: &str) -> Result<Crawler> {
        let mut crawler = self.get(crawler_id).await?.ok_or_else(|| {
            Error::InvalidArgument(format!("Unknown crawler {crawler_id}, register again"))
        })?;
        crawler.last_heartbeat_utc = Utc::now();
        self.cache(&crawler, self.ttl).await?;
        Ok(crawler)
    }

    /// Writes the detail record and both index entries in one transaction.
    pub async fn cache(&self, crawler: &Crawler, ttl: Duration) -> Result<()> {
        let detail = serde_json::to_string(crawler).map_err(anyhow::Error::from)?;
        let score = crawler.last_heartbeat_utc.timestamp_millis() as f64;
        self.cache
            .atomic(vec![
                CacheOp::SetEx {
                    key: keys::crawler(&crawler.id),
                    value: detail,
                    ttl,
                },
                CacheOp::ZAdd {
                    key: keys::store_crawlers(&crawler.store_id),
                    member: crawler.id.clone(),
                    score,
                },
                CacheOp::ZAdd {
                    key: keys::STORES.to_string(),
                    member: crawler.store_id.clone(),
                    score,
                },
            ])
            .await?;
        Ok(())
    }

    pub async fn delete(&self, crawler: &Crawler) -> Result<()> {
        self.cache
            .atomic(vec![
                CacheOp::Del {
                    key: keys::crawler(&crawler.id),
                },
                CacheOp::ZRem {
                    key: keys::store_crawlers(&crawler.store_id),
                    member: crawler.id.clone(),
                },
            ])
            .await?;
        self.forget_store_if_empty(&crawler.store_id).await?;
        self.evict(&crawler.id).await;
        log::info!("Crawler {} of store {} deleted", crawler.id, crawler.store_id);
        Ok(())
    }

    /// Drops index entries of `store_id` whose detail record expired, returns
    /// how many were dropped.
    pub async fn clean(&self, store_id: &str) -> Result<usize> {
        let index = keys::store_crawlers(store_id);
        let mut removed = 0;
        for crawler_id in self.cache.zrange(&index).await? {
            if !self.cache.exists(&keys::crawler(&crawler_id)).await? {
                self.cache.zrem(&index, &crawler_id).await?;
                self.evict(&crawler_id).await;
                removed += 1;
            }
        }
        if removed > 0 {
            log::info!("Cleaned {removed} expired crawler(s) of store {store_id}");
        }
        self.forget_store_if_empty(store_id).await?;
        Ok(removed)
    }

    async fn forget_store_if_empty(&self, store_id: &str) -> Result<()> {
        // A registration landing in between re-adds the store on its next heartbeat
        if self.cache.zcard(&keys::store_crawlers(store_id)).await? == 0 {
            self.cache.zrem(keys::STORES, store_id).await?;
        }
        Ok(())
    }

    /// The detail record of a live crawler.
    pub async fn get(&self, crawler_id: &str) -> Result<Option<Crawler>> {
        match self.cache.get(&keys::crawler(crawler_id)).await? {
            Some(detail) => {
                let crawler = serde_json::from_str(&detail).map_err(anyhow::Error::from)?;
                Ok(Some(crawler))
            }
            None => Ok(None),
        }
    }

    /// A connected handle to a live crawler. A locally pooled handle is only
    /// trusted while the detail record still exists.
    pub async fn get_by_id(&self, crawler_id: &str) -> Result<Option<Arc<CrawlerHandle>>> {
        let pooled = self.handles.get(crawler_id).map(|h| h.value().clone());
        if let Some(handle) = pooled {
            if self.cache.exists(&keys::crawler(crawler_id)).await? {
                return Ok(Some(handle));
            }
            self.evict(crawler_id).await;
            return Ok(None);
        }

        let Some(crawler) = self.get(crawler_id).await? else {
            return Ok(None);
        };
        let client = self.connector.connect(&crawler).await.map_err(|e| {
            Error::Unavailable(format!("Couldn't connect to crawler {crawler_id}: {e}"))
        })?;
        let handle = Arc::new(CrawlerHandle { crawler, client });
        let pooled = self
            .handles
            .entry(crawler_id.to_string())
            .or_insert_with(|| handle.clone())
            .value()
            .clone();
        if !Arc::ptr_eq(&pooled, &handle) {
            handle.client.close().await;
        }
        Ok(Some(pooled))
    }

    pub async fn list_by_store(&self, store_id: &str) -> Result<Vec<Crawler>> {
        let mut crawlers = vec![];
        for crawler_id in self.cache.zrange(&keys::store_crawlers(store_id)).await? {
            if let Some(crawler) = self.get(&crawler_id).await? {
                crawlers.push(crawler);
            }
        }
        Ok(crawlers)
    }

    pub async fn count(&self, store_id: &str) -> Result<usize> {
        Ok(self.list_by_store(store_id).await?.len())
    }

    pub async fn store_ids(&self) -> Result<Vec<String>> {
        Ok(self.cache.zrange(keys::STORES).await?)
    }

    /// The most recently refreshed live crawler serving `store_id`.
    pub async fn pick(&self, store_id: &str) -> Result<Arc<CrawlerHandle>> {
        let mut crawlers = self.list_by_store(store_id).await?;
        crawlers.sort_by_key(|c| std::cmp::Reverse(c.last_heartbeat_utc));
        for crawler in crawlers {
            match self.get_by_id(&crawler.id).await {
                Ok(Some(handle)) => return Ok(handle),
                Ok(None) => continue,
                Err(e) => log::warn!("Skipping crawler {} of store {store_id}: {e}", crawler.id),
            }
        }
        Err(Error::Unavailable(format!(
            "No crawler reachable for store {store_id}"
        )))
    }

    /// Number of locally pooled handles.
    pub fn pooled(&self) -> usize {
        self.handles.len()
    }

    async fn evict(&self, crawler_id: &str) {
        if let Some((_, handle)) = self.handles.remove(crawler_id) {
            handle.client.close().await;
            log::debug!("Closed pooled client of crawler {crawler_id}");
        }
    }

    /// Closes pooled handles whose detail record is gone, returns how many.
    pub async fn evict_stale(&self) -> Result<usize> {
        let pooled: Vec<String> = self.handles.iter().map(|h| h.key().clone()).collect();
        let mut evicted = 0;
        for crawler_id in pooled {
            if !self.cache.exists(&keys::crawler(&crawler_id)).await? {
                self.evict(&crawler_id).await;
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    pub fn spawn_watcher(self: &Arc<Self>, every: Duration, token: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                match timeout(every, token.cancelled()).await {
                    Ok(()) => break,
                    Err(_) => {
                        if let Err(e) = registry.evict_stale().await {
                            log::error!("Couldn't check pooled crawlers: {e}");
                        }
                    }
                }
            }
        })
    }
}
