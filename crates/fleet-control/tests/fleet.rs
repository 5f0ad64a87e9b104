use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_control::config::{RegistryConfig, StoreConfig};
use fleet_control::crawler::CrawlerRegistry;
use fleet_control::memory::{MemoryBroker, MemoryCache, ScriptedConnector};
use fleet_control::ns::topics;
use fleet_control::store::StoreFleet;
use fleet_control::Error;
use fleet_proto::{Item, ParseOutput, ParseTask, Request};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct Fixture {
    broker: Arc<MemoryBroker>,
    crawlers: Arc<CrawlerRegistry>,
    fleet: StoreFleet,
    token: CancellationToken,
}

fn fixture() -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();

    let connector = ScriptedConnector::new(|task| {
        Ok(vec![ParseOutput::Item(Item {
            tracing_id: task.request.tracing_id.clone(),
            job_id: task.request.job_id.clone(),
            store_id: task.request.store_id.clone(),
            request_id: task.request.id.clone(),
            data: serde_json::json!({ "sku": "A-1" }),
            timestamp: Utc::now(),
        })])
    });
    let crawlers = Arc::new(CrawlerRegistry::new(
        Arc::new(MemoryCache::new()),
        Arc::new(connector),
        &RegistryConfig {
            crawler_ttl_secs: 60,
            ..Default::default()
        },
    ));
    let broker = Arc::new(MemoryBroker::new());
    let token = CancellationToken::new();
    let fleet = StoreFleet::new(
        crawlers.clone(),
        broker.clone(),
        StoreConfig::default(),
        token.clone(),
    );
    Fixture {
        broker,
        crawlers,
        fleet,
        token,
    }
}

async fn register(fx: &Fixture, store_id: &str) {
    fx.crawlers
        .register("node-1", store_id, "1.0.0", &format!("{store_id}.crawlers:7000"), vec![])
        .await
        .unwrap();
}

#[tokio::test]
async fn arms_stores_with_crawlers() {
    let fx = fixture();
    register(&fx, "shop").await;
    fx.fleet.reconcile().await.unwrap();

    let handler = fx.fleet.handler("shop").unwrap();
    assert_eq!(3, handler.concurrency().max);
    let topic = topics::store_request("shop");
    assert!(fx.broker.is_subscribed(&topic));
    assert_eq!(Some(3), fx.broker.max_in_flight(&topic));
    fx.token.cancel();
}

#[tokio::test]
async fn keeps_adapted_concurrency() {
    let fx = fixture();
    register(&fx, "shop").await;
    fx.fleet.reconcile().await.unwrap();

    let handler = fx.fleet.handler("shop").unwrap();
    handler.set_concurrency(6);
    fx.fleet.reconcile().await.unwrap();
    assert_eq!(6, handler.concurrency().max);
    fx.token.cancel();
}

#[tokio::test]
async fn rearms_cordoned_store() {
    let fx = fixture();
    register(&fx, "shop").await;
    fx.fleet.reconcile().await.unwrap();

    let handler = fx.fleet.handler("shop").unwrap();
    handler.set_concurrency(0);
    fx.fleet.reconcile().await.unwrap();
    assert_eq!(3, handler.concurrency().max);
    fx.token.cancel();
}

#[tokio::test(start_paused = true)]
async fn disarms_store_whose_crawlers_expired() {
    let fx = fixture();
    register(&fx, "shop").await;
    fx.fleet.reconcile().await.unwrap();

    tokio::time::advance(Duration::from_secs(61)).await;
    fx.fleet.reconcile().await.unwrap();

    let handler = fx.fleet.handler("shop").unwrap();
    assert_eq!(0, handler.concurrency().max);
    assert_eq!(Some(0), fx.broker.max_in_flight(&topics::store_request("shop")));
    assert!(fx.crawlers.store_ids().await.unwrap().is_empty());
    fx.token.cancel();
}

#[tokio::test]
async fn direct_parse_goes_through_store() {
    let fx = fixture();
    register(&fx, "shop").await;
    fx.fleet.reconcile().await.unwrap();

    let task = ParseTask {
        request: Request::new("shop", "https://shop.example.com/p/1"),
        response: None,
    };
    let deadline = Instant::now() + Duration::from_secs(1);
    let mut items = 0;
    let summary = fx
        .fleet
        .parse("shop", deadline, &task, |out| {
            if let ParseOutput::Item(_) = out {
                items += 1;
            }
        })
        .await
        .unwrap();
    assert_eq!(1, summary.items);
    assert_eq!(1, items);

    let res = fx.fleet.parse("unknown", deadline, &task, |_| {}).await;
    assert!(matches!(res, Err(Error::Unavailable(_))));
    fx.token.cancel();
}

#[tokio::test]
async fn lists_concurrency_per_store() {
    let fx = fixture();
    register(&fx, "b-shop").await;
    register(&fx, "a-shop").await;
    fx.fleet.reconcile().await.unwrap();

    let all = fx.fleet.concurrency();
    let ids: Vec<_> = all.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(vec!["a-shop", "b-shop"], ids);
    fx.token.cancel();
}
