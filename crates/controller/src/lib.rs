//! gatesync controller – configuration, orchestration and wiring.
//!
//! [`Controller::connect`] builds the whole in-process graph from a
//! [`SyncConfig`]: one watch hub over the kube websocket transport, the
//! revision cache, the route table, the reconciliation queue with its
//! handlers, the three managers and the admission gate.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use gatesync_admission::AdmissionGate;
use gatesync_kubehub::{get_kube_client, KubeWsTransport, WatchHub};
use gatesync_reconcile::{standard_queue, KubeStatusWriter, Manager, ManagerSettings, RouteTable, WatchManager};
use gatesync_store::RevisionCache;
use tracing::info;

pub mod config;
pub mod control;
pub mod orchestrator;

pub use config::SyncConfig;
pub use control::{ControlPlane, KubeControlPlane};
pub use orchestrator::{SyncOrchestrator, SyncState};

pub struct Controller {
    pub config: SyncConfig,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub gate: Arc<AdmissionGate>,
    pub routes: Arc<RouteTable>,
    pub cache: Arc<RevisionCache>,
}

impl Controller {
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let client = get_kube_client(config.api_url.as_deref()).await?;
        let transport = KubeWsTransport::new(client.clone()).with_bearer(config.token.clone());
        let hub = WatchHub::with_keepalive(Arc::new(transport), config.keepalive());

        let cache = RevisionCache::new();
        let routes = RouteTable::new();
        let status =
            KubeStatusWriter::new(client.clone(), &config.api_group, &config.api_version, config.status_timeout());
        let queue = Arc::new(standard_queue(cache.clone(), routes.clone(), Arc::new(status), config.max_retries));

        let settings = ManagerSettings {
            group: config.api_group.clone(),
            version: config.api_version.clone(),
            namespace: config.namespace.clone(),
            open_timeout: config.open_timeout(),
            resubscribe_delay: config.resubscribe_delay(),
        };
        let managers: Vec<Arc<dyn Manager>> = vec![
            Arc::new(WatchManager::plugins(hub.clone(), queue.clone(), settings.clone())),
            Arc::new(WatchManager::gateways(hub.clone(), queue.clone(), settings.clone())),
            Arc::new(WatchManager::services(hub.clone(), queue.clone(), settings)),
        ];
        let control = Arc::new(KubeControlPlane::new(client, config.open_timeout()));
        let orchestrator = SyncOrchestrator::new(config.enabled, config.bootstrap_retry(), control, managers)
            .with_queue(queue, config.drain_interval())
            .with_hub(hub);
        let gate = AdmissionGate::standard(&config.api_group, cache.clone());
        let ns = if config.namespace.is_empty() { "*" } else { config.namespace.as_str() };
        info!(group = %config.api_group, version = %config.api_version, ns = %ns, "controller wired");
        Ok(Self { config, orchestrator: Arc::new(orchestrator), gate: Arc::new(gate), routes, cache })
    }
}
