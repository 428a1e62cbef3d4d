#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use gatesync_core::WatchEventKind;
use gatesync_kubehub::memory::MemoryTransport;
use gatesync_kubehub::{WatchError, WatchHub, DEFAULT_KEEPALIVE};
use gatesync_query::WatchQuery;
use serde_json::{json, Value};
use tokio::sync::Barrier;

fn secret(name: &str) -> String {
    MemoryTransport::frame(WatchEventKind::Added, json!({"metadata": {"name": name, "namespace": "ns"}}))
}

async fn settle(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn concurrent_watches_share_one_connection() {
    let mem = Arc::new(MemoryTransport::new());
    let hub = WatchHub::new(mem.clone());
    let q = WatchQuery::secrets("ns");

    let mut a = hub.watch::<Value>(&q).expect("watch a");
    let mut b = hub.watch::<Value>(&WatchQuery::secrets("ns")).expect("watch b");
    assert_eq!(a.key(), b.key());
    assert_eq!(hub.connections_created(), 1);
    assert_eq!(hub.subscriber_count(a.key()), 2);

    a.wait_open().await.expect("open a");
    b.wait_open().await.expect("open b");
    assert_eq!(mem.opens(), 1);

    assert!(mem.send(&q.to_uri(), secret("tls")));
    let ev_a = a.next().await.expect("event").expect("decoded");
    let ev_b = b.next().await.expect("event").expect("decoded");
    assert_eq!(ev_a.kind, WatchEventKind::Added);
    assert_eq!(ev_a.object["metadata"]["name"], "tls");
    assert_eq!(ev_b.object, ev_a.object);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_watchers_on_worker_threads_share_one_connection() {
    const WATCHERS: usize = 16;
    let mem = Arc::new(MemoryTransport::new());
    let hub = WatchHub::new(mem.clone());
    let q = WatchQuery::secrets("ns");
    let start = Arc::new(Barrier::new(WATCHERS));
    let joined = Arc::new(Barrier::new(WATCHERS + 1));

    let mut tasks = Vec::with_capacity(WATCHERS);
    for _ in 0..WATCHERS {
        let (hub, q, start, joined) = (hub.clone(), q.clone(), start.clone(), joined.clone());
        tasks.push(tokio::spawn(async move {
            start.wait().await;
            let mut stream = hub.watch::<Value>(&q).expect("watch");
            stream.wait_open().await.expect("open");
            joined.wait().await;
            stream.next().await.expect("event").expect("decoded")
        }));
    }

    joined.wait().await;
    assert_eq!(hub.connections_created(), 1);
    assert_eq!(mem.opens(), 1);
    assert_eq!(hub.active_connections(), 1);

    assert!(mem.send(&q.to_uri(), secret("shared")));
    for task in tasks {
        let ev = tokio::time::timeout(Duration::from_secs(5), task).await.expect("delivered").expect("join");
        assert_eq!(ev.object["metadata"]["name"], "shared");
    }
}

#[tokio::test]
async fn distinct_queries_get_distinct_connections() {
    let mem = Arc::new(MemoryTransport::new());
    let hub = WatchHub::new(mem.clone());
    let a = hub.watch::<Value>(&WatchQuery::secrets("a")).expect("watch");
    let b = hub.watch::<Value>(&WatchQuery::secrets("b")).expect("watch");
    let c = hub.watch::<Value>(&WatchQuery::secrets("a").allow_watch_bookmarks(true)).expect("watch");
    assert_ne!(a.key(), b.key());
    assert_ne!(a.key(), c.key());
    assert_eq!(hub.connections_created(), 3);
    assert_eq!(hub.active_connections(), 3);
}

#[tokio::test]
async fn last_detach_closes_and_rewatch_reopens() {
    let mem = Arc::new(MemoryTransport::new());
    let hub = WatchHub::new(mem.clone());
    let q = WatchQuery::plugins("edge");
    let uri = q.to_uri();

    let mut a = hub.watch::<Value>(&q).expect("watch");
    let b = hub.watch::<Value>(&q).expect("watch");
    a.wait_open().await.expect("open");
    let key = a.key().clone();

    drop(a);
    assert_eq!(hub.subscriber_count(&key), 1);
    assert_eq!(hub.active_connections(), 1);
    drop(b);
    assert_eq!(hub.active_connections(), 0);
    settle(|| !mem.is_open(&uri)).await;

    let mut c = hub.watch::<Value>(&q).expect("rewatch");
    c.wait_open().await.expect("open");
    assert_eq!(hub.connections_created(), 2);
    assert_eq!(mem.opens(), 2);
    assert!(mem.is_open(&uri));
}

#[tokio::test(start_paused = true)]
async fn keepalive_pings_while_idle() {
    let mem = Arc::new(MemoryTransport::new());
    let hub = WatchHub::with_keepalive(mem.clone(), Duration::from_millis(50));
    let mut a = hub.watch::<Value>(&WatchQuery::gateways("edge")).expect("watch");
    a.wait_open().await.expect("open");

    tokio::time::sleep(Duration::from_millis(175)).await;
    assert!(mem.pings() >= 2, "pings: {}", mem.pings());
    assert_eq!(hub.active_connections(), 1);
}

#[tokio::test(start_paused = true)]
async fn keepalive_failure_is_terminal() {
    let mem = Arc::new(MemoryTransport::new());
    let hub = WatchHub::with_keepalive(mem.clone(), Duration::from_millis(50));
    let q = WatchQuery::gateways("edge");
    let mut a = hub.watch::<Value>(&q).expect("watch");
    a.wait_open().await.expect("open");
    let key = a.key().clone();

    mem.fail_ping(true);
    match a.next().await {
        Some(Err(WatchError::Keepalive(msg))) => assert_eq!(msg, "ping rejected"),
        other => panic!("expected keepalive failure, got {:?}", other.map(|r| r.map(|e| e.kind))),
    }
    assert!(a.next().await.is_none());
    assert_eq!(hub.active_connections(), 0);
    assert_eq!(hub.subscriber_count(&key), 0);
    assert!(!mem.is_open(&q.to_uri()));

    // Nothing resubscribes on its own; a new watch opens a new connection.
    mem.fail_ping(false);
    let mut b = hub.watch::<Value>(&q).expect("rewatch");
    b.wait_open().await.expect("open");
    assert_eq!(hub.connections_created(), 2);
}

#[tokio::test(start_paused = true)]
async fn zero_keepalive_uses_default_interval() {
    let mem = Arc::new(MemoryTransport::new());
    let hub = WatchHub::with_keepalive(mem.clone(), Duration::ZERO);
    assert_eq!(hub.keepalive(), DEFAULT_KEEPALIVE);

    let q = WatchQuery::gateways("edge");
    let mut a = hub.watch::<Value>(&q).expect("watch");
    a.wait_open().await.expect("open");
    tokio::time::sleep(DEFAULT_KEEPALIVE / 2).await;
    assert_eq!(mem.pings(), 0);
    tokio::time::sleep(DEFAULT_KEEPALIVE).await;
    assert!(mem.pings() >= 1, "pings: {}", mem.pings());

    assert!(mem.send(&q.to_uri(), secret("still-flowing")));
    let ev = a.next().await.expect("event").expect("decoded");
    assert_eq!(ev.object["metadata"]["name"], "still-flowing");
    assert_eq!(hub.active_connections(), 1);
}

#[tokio::test]
async fn slow_subscriber_keeps_latest_event() {
    let mem = Arc::new(MemoryTransport::new());
    let hub = WatchHub::new(mem.clone());
    let q = WatchQuery::services("edge");
    let mut slow = hub.watch::<Value>(&q).expect("watch");
    slow.wait_open().await.expect("open");

    for name in ["s1", "s2", "s3"] {
        assert!(mem.send(&q.to_uri(), secret(name)));
    }
    settle(|| slow.dropped() == 2).await;

    let ev = slow.next().await.expect("event").expect("decoded");
    assert_eq!(ev.object["metadata"]["name"], "s3");
    assert_eq!(slow.dropped(), 2);
}

#[tokio::test]
async fn undecodable_frame_does_not_end_stream() {
    let mem = Arc::new(MemoryTransport::new());
    let hub = WatchHub::new(mem.clone());
    let q = WatchQuery::secrets("ns");
    let mut a = hub.watch::<Value>(&q).expect("watch");
    a.wait_open().await.expect("open");

    assert!(mem.send(&q.to_uri(), "not json".to_string()));
    assert!(matches!(a.next().await, Some(Err(WatchError::Decode(_)))));
    assert!(mem.send(&q.to_uri(), secret("ok")));
    let ev = a.next().await.expect("event").expect("decoded");
    assert_eq!(ev.object["metadata"]["name"], "ok");
}

#[tokio::test]
async fn open_error_reaches_subscriber_and_is_not_cached() {
    let mem = Arc::new(MemoryTransport::new());
    let hub = WatchHub::new(mem.clone());
    let q = WatchQuery::secrets("ns");

    mem.fail_open(Some("forbidden"));
    let mut a = hub.watch::<Value>(&q).expect("watch");
    assert_eq!(a.wait_open().await, Err(WatchError::Open("forbidden".into())));
    assert_eq!(hub.active_connections(), 0);
    assert!(matches!(a.next().await, Some(Err(WatchError::Open(_)))));
    assert!(a.next().await.is_none());

    mem.fail_open(None);
    let mut b = hub.watch::<Value>(&q).expect("watch");
    b.wait_open().await.expect("open");
    assert_eq!(mem.opens(), 2);
    assert_eq!(hub.connections_created(), 2);
}

#[tokio::test]
async fn transport_failure_and_completion_end_streams() {
    let mem = Arc::new(MemoryTransport::new());
    let hub = WatchHub::new(mem.clone());

    let failing = WatchQuery::secrets("a");
    let mut a = hub.watch::<Value>(&failing).expect("watch");
    a.wait_open().await.expect("open");
    assert!(mem.fail(&failing.to_uri(), "reset"));
    assert_eq!(a.next().await.map(|r| r.map(|_| ())), Some(Err(WatchError::Transport("reset".into()))));
    assert!(a.next().await.is_none());

    let ending = WatchQuery::secrets("b");
    let mut b = hub.watch::<Value>(&ending).expect("watch");
    b.wait_open().await.expect("open");
    mem.end(&ending.to_uri());
    assert!(b.next().await.is_none());
    assert_eq!(hub.active_connections(), 0);
}

#[tokio::test]
async fn shutdown_ends_streams_and_rejects_new_watches() {
    let mem = Arc::new(MemoryTransport::new());
    let hub = WatchHub::new(mem.clone());
    let q = WatchQuery::plugins("edge");
    let mut a = hub.watch::<Value>(&q).expect("watch");
    a.wait_open().await.expect("open");

    hub.shutdown();
    assert!(a.next().await.is_none());
    assert_eq!(hub.active_connections(), 0);
    assert!(matches!(hub.watch::<Value>(&q), Err(WatchError::Shutdown)));
    settle(|| !mem.is_open(&q.to_uri())).await;
}
