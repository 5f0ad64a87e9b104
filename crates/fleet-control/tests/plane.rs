use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_control::config::ControlConfig;
use fleet_control::memory::{MemoryBroker, MemoryCache, MemoryRepo, ScriptedConnector};
use fleet_control::ControlPlane;
use fleet_proto::{
    CommandError, Inbound, JoinPing, NodeDescriptor, Outbound, Request, RequestStatus,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn request_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut config = ControlConfig::default();
    config.dispatch.pop_timeout_ms = 50;
    let repo = Arc::new(MemoryRepo::new());
    let plane = Arc::new(
        ControlPlane::new(
            config,
            Arc::new(MemoryCache::new()),
            Arc::new(MemoryBroker::new()),
            repo.clone(),
            Arc::new(ScriptedConnector::new(|_| Ok(vec![]))),
        )
        .unwrap(),
    );

    let token = CancellationToken::new();
    let running = {
        let plane = plane.clone();
        let token = token.clone();
        tokio::spawn(async move { plane.run(token).await })
    };

    let (tx, inbound) = mpsc::channel(16);
    let (outbound, mut rx) = mpsc::channel(16);
    let nodes = plane.nodes().clone();
    tokio::spawn(async move { nodes.serve(ReceiverStream::new(inbound), outbound).await });
    let join = Inbound::JoinPing(JoinPing {
        node: NodeDescriptor {
            id: "node-a".into(),
            host: "10.0.0.3".into(),
            max_concurrency: 2,
        },
        timestamp: Utc::now().timestamp_millis(),
    });
    tx.send(Ok(join.encode().unwrap())).await.unwrap();
    assert!(matches!(
        Outbound::decode(&rx.recv().await.unwrap()).unwrap(),
        Outbound::JoinPong(_)
    ));

    let req = Request::new("shop", "https://shop.example.com/p/9");
    plane.submit(req.clone()).await.unwrap();

    let frame = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    match Outbound::decode(&frame).unwrap() {
        Outbound::Command(cmd) => assert_eq!(req.id, cmd.request.id),
        other => panic!("Expected command, got {other:?}"),
    }
    assert_eq!(1, plane.host_locker().in_flight("shop.example.com"));

    let done = Inbound::CommandError(CommandError {
        request_id: req.id.clone(),
        succeeded: true,
        duration_ms: 40,
        message: String::new(),
    });
    tx.send(Ok(done.encode().unwrap())).await.unwrap();
    timeout(Duration::from_secs(5), async {
        while repo.request(&req.id).map(|r| r.status) != Some(RequestStatus::Done) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(0, plane.host_locker().in_flight("shop.example.com"));

    token.cancel();
    timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
}

#[test]
fn rejects_invalid_config() {
    let mut config = ControlConfig::default();
    config.host_lock.max_per_host = 0;
    let res = ControlPlane::new(
        config,
        Arc::new(MemoryCache::new()),
        Arc::new(MemoryBroker::new()),
        Arc::new(MemoryRepo::new()),
        Arc::new(ScriptedConnector::new(|_| Ok(vec![]))),
    );
    assert!(res.is_err());
}
