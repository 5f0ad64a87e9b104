use std::sync::Arc;
use std::time::Duration;

use fleet_control::cache::Cache;
use fleet_control::config::RegistryConfig;
use fleet_control::crawler::CrawlerRegistry;
use fleet_control::memory::{MemoryCache, ScriptedConnector};
use fleet_control::ns::keys;
use fleet_control::Error;
use tokio_util::sync::CancellationToken;

struct Fixture {
    cache: Arc<MemoryCache>,
    connector: Arc<ScriptedConnector>,
    registry: Arc<CrawlerRegistry>,
}

fn fixture() -> Fixture {
    let cache = Arc::new(MemoryCache::new());
    let connector = Arc::new(ScriptedConnector::new(|_| Ok(vec![])));
    let registry = Arc::new(CrawlerRegistry::new(
        cache.clone(),
        connector.clone(),
        &RegistryConfig {
            crawler_ttl_secs: 60,
            ..Default::default()
        },
    ));
    Fixture {
        cache,
        connector,
        registry,
    }
}

#[tokio::test]
async fn register_indexes_crawler() {
    let fx = fixture();
    let crawler = fx
        .registry
        .register("node-1", "shop", "1.0.0", "10.0.0.1:7000", vec!["shop.example.com".into()])
        .await
        .unwrap();

    assert_eq!(vec!["shop".to_string()], fx.registry.store_ids().await.unwrap());
    assert_eq!(
        vec![crawler.id.clone()],
        fx.cache.zrange(&keys::store_crawlers("shop")).await.unwrap()
    );
    let stored = fx.registry.get(&crawler.id).await.unwrap().unwrap();
    assert_eq!(crawler, stored);
    assert_eq!(1, fx.registry.count("shop").await.unwrap());
}

#[tokio::test]
async fn register_is_idempotent() {
    let fx = fixture();
    let first = fx
        .registry
        .register("node-1", "shop", "1.0.0", "10.0.0.1:7000", vec![])
        .await
        .unwrap();
    let second = fx
        .registry
        .register("node-1", "shop", "1.0.0", "10.0.0.1:7000", vec![])
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(first.online_utc, second.online_utc);
    assert_eq!(1, fx.registry.count("shop").await.unwrap());
}

#[tokio::test]
async fn register_needs_store_and_address() {
    let fx = fixture();
    let res = fx.registry.register("node-1", "", "1.0.0", "10.0.0.1:7000", vec![]).await;
    assert!(matches!(res, Err(Error::InvalidArgument(_))));
    let res = fx.registry.register("node-1", "shop", "1.0.0", "", vec![]).await;
    assert!(matches!(res, Err(Error::InvalidArgument(_))));
}

#[tokio::test(start_paused = true)]
async fn clean_drops_expired_crawlers() {
    let fx = fixture();
    let crawler = fx
        .registry
        .register("node-1", "shop", "1.0.0", "10.0.0.1:7000", vec![])
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(fx.registry.get(&crawler.id).await.unwrap().is_none());
    assert_eq!(0, fx.registry.count("shop").await.unwrap());

    assert_eq!(1, fx.registry.clean("shop").await.unwrap());
    assert!(fx.registry.store_ids().await.unwrap().is_empty());
    assert_eq!(0, fx.registry.clean("shop").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn heartbeat_extends_life() {
    let fx = fixture();
    let crawler = fx
        .registry
        .register("node-1", "shop", "1.0.0", "10.0.0.1:7000", vec![])
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(40)).await;
    fx.registry.heartbeat(&crawler.id).await.unwrap();
    tokio::time::advance(Duration::from_secs(40)).await;
    assert!(fx.registry.get(&crawler.id).await.unwrap().is_some());

    tokio::time::advance(Duration::from_secs(30)).await;
    let res = fx.registry.heartbeat(&crawler.id).await;
    assert!(matches!(res, Err(Error::InvalidArgument(_))));
}

#[tokio::test]
async fn delete_closes_pooled_client() {
    let fx = fixture();
    let crawler = fx
        .registry
        .register("node-1", "shop", "1.0.0", "10.0.0.1:7000", vec![])
        .await
        .unwrap();
    assert!(fx.registry.get_by_id(&crawler.id).await.unwrap().is_some());
    assert_eq!(1, fx.registry.pooled());

    fx.registry.delete(&crawler).await.unwrap();
    assert_eq!(0, fx.registry.pooled());
    assert!(fx.connector.clients()[0].is_closed());
    assert!(fx.registry.store_ids().await.unwrap().is_empty());
    assert!(fx.registry.get(&crawler.id).await.unwrap().is_none());
}

#[tokio::test]
async fn delete_keeps_store_with_other_crawlers() {
    let fx = fixture();
    let a = fx
        .registry
        .register("node-1", "shop", "1.0.0", "10.0.0.1:7000", vec![])
        .await
        .unwrap();
    fx.registry
        .register("node-2", "shop", "1.0.0", "10.0.0.2:7000", vec![])
        .await
        .unwrap();

    fx.registry.delete(&a).await.unwrap();
    assert_eq!(vec!["shop".to_string()], fx.registry.store_ids().await.unwrap());
    assert_eq!(1, fx.registry.count("shop").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn pooled_handle_lives_with_detail_record() {
    let fx = fixture();
    let crawler = fx
        .registry
        .register("node-1", "shop", "1.0.0", "10.0.0.1:7000", vec![])
        .await
        .unwrap();

    let first = fx.registry.get_by_id(&crawler.id).await.unwrap().unwrap();
    let second = fx.registry.get_by_id(&crawler.id).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(1, fx.connector.clients().len());

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(fx.registry.get_by_id(&crawler.id).await.unwrap().is_none());
    assert!(fx.connector.clients()[0].is_closed());
    assert_eq!(0, fx.registry.pooled());
}

#[tokio::test]
async fn pick_prefers_latest_heartbeat() {
    let fx = fixture();
    let a = fx
        .registry
        .register("node-1", "shop", "1.0.0", "10.0.0.1:7000", vec![])
        .await
        .unwrap();
    std::thread::sleep(Duration::from_millis(5));
    let b = fx
        .registry
        .register("node-2", "shop", "1.0.0", "10.0.0.2:7000", vec![])
        .await
        .unwrap();
    assert_eq!(b.id, fx.registry.pick("shop").await.unwrap().crawler.id);

    std::thread::sleep(Duration::from_millis(5));
    fx.registry.heartbeat(&a.id).await.unwrap();
    assert_eq!(a.id, fx.registry.pick("shop").await.unwrap().crawler.id);

    let res = fx.registry.pick("other").await;
    assert!(matches!(res, Err(Error::Unavailable(_))));
}

#[tokio::test(start_paused = true)]
async fn watcher_evicts_stale_handles() {
    let fx = fixture();
    let crawler = fx
        .registry
        .register("node-1", "shop", "1.0.0", "10.0.0.1:7000", vec![])
        .await
        .unwrap();
    fx.registry.get_by_id(&crawler.id).await.unwrap();

    let token = CancellationToken::new();
    let watcher = fx
        .registry
        .spawn_watcher(Duration::from_secs(30), token.clone());
    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(1, fx.registry.pooled());

    tokio::time::sleep(Duration::from_secs(50)).await;
    assert_eq!(0, fx.registry.pooled());
    assert!(fx.connector.clients()[0].is_closed());

    token.cancel();
    watcher.await.unwrap();
}
