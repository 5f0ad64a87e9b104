use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_control::broker::{Message, MessageHandler};
use fleet_control::config::{RegistryConfig, StoreConfig};
use fleet_control::crawler::CrawlerRegistry;
use fleet_control::memory::{MemoryBroker, MemoryCache, MemoryMessage, Outcome, ScriptedConnector};
use fleet_control::ns::topics;
use fleet_control::store::{Concurrency, StoreHandler};
use fleet_control::Error;
use fleet_proto::{Item, ParseFailure, ParseOutput, ParseTask, Request, StatusEvent};
use tokio::time::Instant;

fn item(task: &ParseTask) -> ParseOutput {
    ParseOutput::Item(Item {
        tracing_id: task.request.tracing_id.clone(),
        job_id: task.request.job_id.clone(),
        store_id: task.request.store_id.clone(),
        request_id: task.request.id.clone(),
        data: serde_json::json!({ "title": "Blue mug" }),
        timestamp: Utc::now(),
    })
}

fn failure(task: &ParseTask) -> ParseOutput {
    ParseOutput::Error(ParseFailure {
        tracing_id: task.request.tracing_id.clone(),
        request_id: task.request.id.clone(),
        message: "selector matched nothing".into(),
    })
}

fn task(store_id: &str) -> ParseTask {
    ParseTask {
        request: Request::new(store_id, "https://shop.example.com/p/1"),
        response: None,
    }
}

struct Fixture {
    broker: Arc<MemoryBroker>,
    handler: Arc<StoreHandler>,
    failing: Arc<AtomicBool>,
}

async fn fixture(latency: Duration) -> Fixture {
    let failing = Arc::new(AtomicBool::new(false));
    let fail = failing.clone();
    let connector = ScriptedConnector::new(move |task| {
        if fail.load(Ordering::SeqCst) {
            Ok(vec![failure(task)])
        } else {
            Ok(vec![item(task)])
        }
    })
    .with_latency(latency);

    let crawlers = Arc::new(CrawlerRegistry::new(
        Arc::new(MemoryCache::new()),
        Arc::new(connector),
        &RegistryConfig::default(),
    ));
    crawlers
        .register("node-1", "shop", "1.0.0", "10.0.0.1:7000", vec![])
        .await
        .unwrap();

    let broker = Arc::new(MemoryBroker::new());
    let handler = Arc::new(StoreHandler::new(
        "shop",
        StoreConfig::default(),
        crawlers,
        broker.clone(),
    ));
    Fixture {
        broker,
        handler,
        failing,
    }
}

async fn parse_many(handler: &StoreHandler, n: usize) {
    let task = task("shop");
    for _ in 0..n {
        let deadline = Instant::now() + Duration::from_secs(5);
        handler.parse(deadline, &task, |_| {}).await.unwrap();
    }
}

fn assert_invariants(c: Concurrency) {
    assert!(c.max_mq <= c.max, "{c:?}");
    assert!(c.current_mq <= c.current, "{c:?}");
    assert!(c.max_mq >= 0 && c.current_mq >= 0, "{c:?}");
}

#[tokio::test]
async fn disarmed_store_is_unavailable() {
    let fx = fixture(Duration::ZERO).await;
    let deadline = Instant::now() + Duration::from_secs(1);
    let res = fx.handler.parse(deadline, &task("shop"), |_| {}).await;
    assert!(matches!(res, Err(Error::Unavailable(_))));
}

#[tokio::test]
async fn arming_opens_both_lanes() {
    let fx = fixture(Duration::ZERO).await;
    assert!(fx.handler.arm());
    assert!(!fx.handler.arm());
    assert_eq!(
        Concurrency {
            max: 3,
            max_mq: 3,
            current: 0,
            current_mq: 0
        },
        fx.handler.concurrency()
    );
    assert_eq!(3, *fx.handler.in_flight_limit().borrow());

    assert!(fx.handler.disarm());
    assert_eq!(0, *fx.handler.in_flight_limit().borrow());
}

#[tokio::test]
async fn direct_parse_feeds_callback() {
    let fx = fixture(Duration::ZERO).await;
    fx.handler.arm();

    let mut outputs = vec![];
    let deadline = Instant::now() + Duration::from_secs(1);
    let summary = fx
        .handler
        .parse(deadline, &task("shop"), |out| outputs.push(out))
        .await
        .unwrap();
    assert!(summary.is_success());
    assert_eq!(1, summary.items);
    assert_eq!(1, outputs.len());
    assert!(fx.broker.messages(topics::ITEM).is_empty());
    assert_invariants(fx.handler.concurrency());
}

#[tokio::test]
async fn success_and_failure_windows() {
    let fx = fixture(Duration::ZERO).await;
    fx.handler.arm();

    parse_many(&fx.handler, 20).await;
    assert_eq!(4, fx.handler.adjust().max);

    fx.failing.store(true, Ordering::SeqCst);
    parse_many(&fx.handler, 20).await;
    assert_eq!(2, fx.handler.adjust().max);
    parse_many(&fx.handler, 20).await;
    assert_eq!(1, fx.handler.adjust().max);
}

#[tokio::test]
async fn sustained_success_stops_at_ceiling() {
    let fx = fixture(Duration::ZERO).await;
    fx.handler.arm();

    let mut previous = fx.handler.concurrency().max;
    for _ in 0..12 {
        parse_many(&fx.handler, 20).await;
        let c = fx.handler.adjust();
        assert!(c.max - previous <= 1);
        assert!(c.max <= 10);
        assert_invariants(c);
        previous = c.max;
    }
    assert_eq!(10, previous);
}

#[tokio::test]
async fn small_sample_resets_to_default() {
    let fx = fixture(Duration::ZERO).await;
    fx.handler.set_concurrency(7);
    parse_many(&fx.handler, 2).await;
    assert_eq!(3, fx.handler.adjust().max);
}

#[tokio::test]
async fn poor_rate_never_drops_below_default() {
    let fx = fixture(Duration::ZERO).await;
    fx.handler.set_concurrency(5);
    parse_many(&fx.handler, 6).await;
    fx.failing.store(true, Ordering::SeqCst);
    parse_many(&fx.handler, 14).await;
    assert_eq!(4, fx.handler.adjust().max);

    fx.handler.set_concurrency(3);
    fx.failing.store(false, Ordering::SeqCst);
    parse_many(&fx.handler, 6).await;
    fx.failing.store(true, Ordering::SeqCst);
    parse_many(&fx.handler, 14).await;
    assert_eq!(3, fx.handler.adjust().max);
}

#[tokio::test]
async fn idle_window_holds() {
    let fx = fixture(Duration::ZERO).await;
    fx.handler.arm();
    assert_eq!(3, fx.handler.adjust().max);
    fx.handler.disarm();
    assert_eq!(0, fx.handler.adjust().max);
}

#[tokio::test]
async fn set_concurrency_is_clamped() {
    let fx = fixture(Duration::ZERO).await;
    assert_eq!(10, fx.handler.set_concurrency(50).max);
    assert_eq!(0, fx.handler.set_concurrency(-3).max);
}

#[tokio::test]
async fn queue_message_publishes_results() {
    let fx = fixture(Duration::ZERO).await;
    fx.handler.arm();

    let task = task("shop");
    let msg = Arc::new(MemoryMessage::new(serde_json::to_vec(&task).unwrap(), 1));
    fx.handler.handle_message(msg.clone()).await.unwrap();

    assert!(!msg.auto_response());
    assert_eq!(Some(Outcome::Finished), msg.outcome());
    assert_eq!(1, fx.broker.decoded::<Item>(topics::ITEM).len());
    let status = fx.broker.decoded::<StatusEvent>(topics::STATUS);
    assert_eq!(1, status.len());
    assert!(status[0].success);
    assert_eq!(task.request.id, status[0].request_id);
    assert_eq!(1, status[0].item_count);
}

#[tokio::test]
async fn empty_result_is_a_failure() {
    let crawlers = Arc::new(CrawlerRegistry::new(
        Arc::new(MemoryCache::new()),
        Arc::new(ScriptedConnector::new(|_| Ok(vec![]))),
        &RegistryConfig::default(),
    ));
    crawlers
        .register("node-1", "shop", "1.0.0", "10.0.0.1:7000", vec![])
        .await
        .unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let handler = StoreHandler::new("shop", StoreConfig::default(), crawlers, broker.clone());
    handler.arm();

    let msg = Arc::new(MemoryMessage::new(serde_json::to_vec(&task("shop")).unwrap(), 1));
    handler.handle_message(msg.clone()).await.unwrap();

    assert_eq!(Some(Outcome::Finished), msg.outcome());
    assert_eq!(1, broker.decoded::<ParseFailure>(topics::ERROR).len());
    let status = broker.decoded::<StatusEvent>(topics::STATUS);
    assert!(!status[0].success);
    assert!(status[0].error.is_some());
}

#[tokio::test]
async fn missing_crawler_cordons_store() {
    let fx = fixture(Duration::ZERO).await;
    let ghost = StoreHandler::new(
        "ghost",
        StoreConfig::default(),
        Arc::new(CrawlerRegistry::new(
            Arc::new(MemoryCache::new()),
            Arc::new(ScriptedConnector::new(|_| Ok(vec![]))),
            &RegistryConfig::default(),
        )),
        fx.broker.clone(),
    );
    ghost.arm();

    let msg = Arc::new(MemoryMessage::new(serde_json::to_vec(&task("ghost")).unwrap(), 1));
    ghost.handle_message(msg.clone()).await.unwrap();

    assert_eq!(0, ghost.concurrency().max);
    assert!(matches!(
        msg.outcome(),
        Some(Outcome::Requeued { backoff: true, .. })
    ));
}

#[tokio::test]
async fn no_room_requeues_without_backoff() {
    let fx = fixture(Duration::ZERO).await;
    let msg = Arc::new(MemoryMessage::new(serde_json::to_vec(&task("shop")).unwrap(), 1));
    fx.handler.handle_message(msg.clone()).await.unwrap();
    assert!(matches!(
        msg.outcome(),
        Some(Outcome::Requeued { backoff: false, .. })
    ));
}

#[tokio::test]
async fn malformed_message_is_finished() {
    let fx = fixture(Duration::ZERO).await;
    fx.handler.arm();
    let msg = Arc::new(MemoryMessage::new(b"{\"request\":".to_vec(), 1));
    fx.handler.handle_message(msg.clone()).await.unwrap();
    assert_eq!(Some(Outcome::Finished), msg.outcome());
    assert!(fx.broker.messages(topics::STATUS).is_empty());
}

fn spawn_queue_parse(handler: &Arc<StoreHandler>) -> tokio::task::JoinHandle<Arc<MemoryMessage>> {
    let handler = handler.clone();
    tokio::spawn(async move {
        let msg = Arc::new(MemoryMessage::new(serde_json::to_vec(&task("shop")).unwrap(), 1));
        let as_message: Arc<dyn Message> = msg.clone();
        handler.handle_message(as_message).await.unwrap();
        msg
    })
}

#[tokio::test(start_paused = true)]
async fn direct_caller_waits_for_queue_lane() {
    let fx = fixture(Duration::from_secs(1)).await;
    fx.handler.arm();

    let queued: Vec<_> = (0..3).map(|_| spawn_queue_parse(&fx.handler)).collect();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let c = fx.handler.concurrency();
    assert_eq!((3, 3), (c.current, c.current_mq));

    let deadline = Instant::now() + Duration::from_millis(500);
    let res = fx.handler.parse(deadline, &task("shop"), |_| {}).await;
    assert!(matches!(res, Err(Error::DeadlineExceeded(_))));
    assert_invariants(fx.handler.concurrency());

    let deadline = Instant::now() + Duration::from_secs(5);
    let summary = fx
        .handler
        .parse(deadline, &task("shop"), |_| {})
        .await
        .unwrap();
    assert!(summary.is_success());

    for q in queued {
        assert_eq!(Some(Outcome::Finished), q.await.unwrap().outcome());
    }
    let c = fx.handler.concurrency();
    assert_eq!((0, 0), (c.current, c.current_mq));
    assert_invariants(c);
}

#[tokio::test(start_paused = true)]
async fn keep_alive_touches_long_parses() {
    let fx = fixture(Duration::from_secs(70)).await;
    fx.handler.arm();

    let mut task = task("shop");
    task.request.options.max_ttl_per_request = 120;
    let msg = Arc::new(MemoryMessage::new(serde_json::to_vec(&task).unwrap(), 1));
    fx.handler.handle_message(msg.clone()).await.unwrap();

    assert_eq!(2, msg.touches());
    assert_eq!(Some(Outcome::Finished), msg.outcome());
}

#[tokio::test]
async fn unbounded_request_ttl_still_parses() {
    let fx = fixture(Duration::ZERO).await;
    fx.handler.arm();

    let mut task = task("shop");
    task.request.options.max_ttl_per_request = u64::MAX;
    let msg = Arc::new(MemoryMessage::new(serde_json::to_vec(&task).unwrap(), 1));
    fx.handler.handle_message(msg.clone()).await.unwrap();

    assert_eq!(Some(Outcome::Finished), msg.outcome());
    assert_eq!(1, fx.broker.messages(topics::ITEM).len());
}

#[tokio::test(start_paused = true)]
async fn reclaim_returns_direct_slot_to_saturated_queue() {
    let fx = fixture(Duration::from_secs(1)).await;
    fx.handler.arm();

    parse_many(&fx.handler, 1).await;
    assert_eq!(2, fx.handler.concurrency().max_mq);
    assert!(!fx.handler.reclaim());

    let queued: Vec<_> = (0..2).map(|_| spawn_queue_parse(&fx.handler)).collect();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(fx.handler.reclaim());
    assert_eq!(3, fx.handler.concurrency().max_mq);
    assert_eq!(3, *fx.handler.in_flight_limit().borrow());
    assert!(!fx.handler.reclaim());

    for q in queued {
        q.await.unwrap();
    }
}
