//! Watch-driven managers: subscribe through the hub and feed the queue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use gatesync_core::{ResourceKind, WatchActionContext};
use gatesync_kubehub::{WatchError, WatchHub, WatchStream};
use gatesync_query::{ResourceQuery, WatchQuery};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::ReconciliationQueue;

/// A unit the orchestrator starts and stops in dependency order.
#[async_trait]
pub trait Manager: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub group: String,
    pub version: String,
    /// Empty means all namespaces.
    pub namespace: String,
    pub open_timeout: Duration,
    pub resubscribe_delay: Duration,
}

impl ManagerSettings {
    pub fn query(&self, kind: ResourceKind) -> WatchQuery {
        ResourceQuery::for_kind(kind, &self.group, &self.version).namespace(&self.namespace).watch()
    }
}

struct Running {
    cancel: CancellationToken,
    pumps: Vec<JoinHandle<()>>,
}

/// Manager over one or more watched kinds.
pub struct WatchManager {
    name: &'static str,
    hub: WatchHub,
    queue: Arc<ReconciliationQueue>,
    settings: ManagerSettings,
    watches: Vec<(ResourceKind, WatchQuery)>,
    running: Mutex<Option<Running>>,
}

impl WatchManager {
    pub fn new(name: &'static str, hub: WatchHub, queue: Arc<ReconciliationQueue>, settings: ManagerSettings) -> Self {
        Self { name, hub, queue, settings, watches: Vec::new(), running: Mutex::new(None) }
    }

    pub fn watching(mut self, kind: ResourceKind) -> Self {
        let query = self.settings.query(kind);
        self.watches.push((kind, query));
        self
    }

    pub fn plugins(hub: WatchHub, queue: Arc<ReconciliationQueue>, settings: ManagerSettings) -> Self {
        Self::new("plugins", hub, queue, settings).watching(ResourceKind::Plugin)
    }

    /// Gateways plus the secrets their listeners and services reference.
    pub fn gateways(hub: WatchHub, queue: Arc<ReconciliationQueue>, settings: ManagerSettings) -> Self {
        Self::new("gateways", hub, queue, settings).watching(ResourceKind::Secret).watching(ResourceKind::Gateway)
    }

    pub fn services(hub: WatchHub, queue: Arc<ReconciliationQueue>, settings: ManagerSettings) -> Self {
        Self::new("services", hub, queue, settings).watching(ResourceKind::Service)
    }

    pub fn is_running(&self) -> bool { self.running.lock().is_some() }

    async fn open(&self, query: &WatchQuery) -> Result<WatchStream<Value>> {
        let mut stream = self.hub.watch::<Value>(query).with_context(|| format!("watching {}", query.to_uri()))?;
        tokio::time::timeout(self.settings.open_timeout, stream.wait_open())
            .await
            .map_err(|_| anyhow!("opening {} timed out after {:?}", query.to_uri(), self.settings.open_timeout))?
            .with_context(|| format!("opening {}", query.to_uri()))?;
        Ok(stream)
    }
}

#[async_trait]
impl Manager for WatchManager {
    fn name(&self) -> &str { self.name }

    async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        // Open every stream before pumping so a failed start leaves nothing behind.
        let mut streams = Vec::with_capacity(self.watches.len());
        for (kind, query) in &self.watches {
            streams.push((*kind, query.clone(), self.open(query).await?));
        }
        let cancel = CancellationToken::new();
        let pumps = streams
            .into_iter()
            .map(|(kind, query, stream)| {
                tokio::spawn(pump(
                    kind,
                    query,
                    stream,
                    self.hub.clone(),
                    Arc::clone(&self.queue),
                    cancel.clone(),
                    self.settings.resubscribe_delay,
                ))
            })
            .collect();
        *self.running.lock() = Some(Running { cancel, pumps });
        info!(manager = self.name, watches = self.watches.len(), "manager started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let running = self.running.lock().take();
        let Some(running) = running else { return Ok(()) };
        running.cancel.cancel();
        for pump in running.pumps {
            pump.await.with_context(|| format!("joining {} watch pump", self.name))?;
        }
        info!(manager = self.name, "manager stopped");
        Ok(())
    }
}

/// Forward events of one watch into the queue. After a terminal stream
/// error the watch is re-requested after `resubscribe_delay`.
async fn pump(
    kind: ResourceKind,
    query: WatchQuery,
    mut stream: WatchStream<Value>,
    hub: WatchHub,
    queue: Arc<ReconciliationQueue>,
    cancel: CancellationToken,
    resubscribe_delay: Duration,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return,
            item = stream.next() => item,
        };
        match item {
            Some(Ok(ev)) => {
                if queue.enqueue(WatchActionContext::from_event(kind, ev)).is_err() {
                    debug!(kind = %kind, "queue closed; stopping pump");
                    return;
                }
                continue;
            }
            Some(Err(WatchError::Decode(e))) => {
                warn!(kind = %kind, error = %e, "skipping undecodable watch event");
                continue;
            }
            Some(Err(e)) => warn!(kind = %kind, key = %stream.key(), error = %e, "watch failed"),
            None => info!(kind = %kind, key = %stream.key(), "watch ended"),
        }
        stream = loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(resubscribe_delay) => {}
            }
            match hub.watch::<Value>(&query) {
                Ok(s) => break s,
                Err(WatchError::Shutdown) => return,
                Err(e) => warn!(kind = %kind, error = %e, "resubscribe failed"),
            }
        };
        info!(kind = %kind, key = %stream.key(), "resubscribed");
    }
}
