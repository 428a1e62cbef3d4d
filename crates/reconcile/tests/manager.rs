#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gatesync_core::{ResourceKey, ResourceKind, WatchEventKind, DEFAULT_GROUP, DEFAULT_VERSION};
use gatesync_kubehub::memory::MemoryTransport;
use gatesync_kubehub::WatchHub;
use gatesync_reconcile::{standard_queue, Manager, ManagerSettings, ResourceStatus, RouteTable, StatusWriter, WatchManager};
use gatesync_store::RevisionCache;
use serde_json::json;

struct NoStatus;

#[async_trait]
impl StatusWriter for NoStatus {
    async fn write(&self, _: ResourceKind, _: &ResourceKey, _: &ResourceStatus) -> anyhow::Result<()> { Ok(()) }
}

fn settings() -> ManagerSettings {
    ManagerSettings {
        group: DEFAULT_GROUP.into(),
        version: DEFAULT_VERSION.into(),
        namespace: "edge".into(),
        open_timeout: Duration::from_millis(200),
        resubscribe_delay: Duration::from_millis(100),
    }
}

fn setup() -> (Arc<MemoryTransport>, WatchHub, Arc<RevisionCache>, Arc<gatesync_reconcile::ReconciliationQueue>) {
    let mem = Arc::new(MemoryTransport::new());
    let hub = WatchHub::new(mem.clone());
    let cache = RevisionCache::new();
    let queue = Arc::new(standard_queue(cache.clone(), RouteTable::new(), Arc::new(NoStatus), 0));
    (mem, hub, cache, queue)
}

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn events_flow_from_watch_into_cache() {
    let (mem, hub, cache, queue) = setup();
    let mgr = WatchManager::gateways(hub.clone(), queue.clone(), settings());
    mgr.start().await.expect("start");
    assert!(mgr.is_running());
    assert_eq!(hub.active_connections(), 2);

    let secrets = settings().query(ResourceKind::Secret).to_uri();
    assert_eq!(secrets, "/api/v1/namespaces/edge/secrets?watch=true");
    let frame = MemoryTransport::frame(WatchEventKind::Added, json!({"metadata": {"name": "cert", "namespace": "edge"}}));
    assert!(mem.send(&secrets, frame));
    settle().await;
    queue.drain_once().await;
    assert!(cache.secrets.contains(&ResourceKey::new(Some("edge"), "cert")));

    mgr.stop().await.expect("stop");
    assert!(!mgr.is_running());
    assert_eq!(hub.active_connections(), 0);
    settle().await;
    assert!(!mem.is_open(&secrets));
}

#[tokio::test]
async fn start_fails_when_watch_cannot_open() {
    let (mem, hub, _cache, queue) = setup();
    mem.fail_open(Some("connection refused"));
    let mgr = WatchManager::plugins(hub.clone(), queue, settings());

    let err = mgr.start().await.expect_err("start must fail");
    assert!(format!("{:#}", err).contains("connection refused"));
    assert!(!mgr.is_running());
    assert_eq!(hub.active_connections(), 0);
    mgr.stop().await.expect("stop is a no-op");
}

#[tokio::test(start_paused = true)]
async fn pump_resubscribes_after_stream_failure() {
    let (mem, hub, cache, queue) = setup();
    let mgr = WatchManager::plugins(hub.clone(), queue.clone(), settings());
    mgr.start().await.expect("start");
    let uri = settings().query(ResourceKind::Plugin).to_uri();
    assert_eq!(mem.opens(), 1);

    assert!(mem.fail(&uri, "connection reset"));
    tokio::time::sleep(Duration::from_millis(150)).await;
    settle().await;
    assert_eq!(mem.opens(), 2);
    assert!(mem.is_open(&uri));

    let frame = MemoryTransport::frame(
        WatchEventKind::Added,
        json!({"metadata": {"name": "auth", "namespace": "edge"}, "spec": {"type": "jwt"}}),
    );
    assert!(mem.send(&uri, frame));
    settle().await;
    queue.drain_once().await;
    assert!(cache.plugins.contains(&ResourceKey::new(Some("edge"), "auth")));
    mgr.stop().await.expect("stop");
}
