//! gatesync reconcile – ordered processing of watch events.
//!
//! Managers subscribe to watches and push one [`WatchActionContext`] per event
//! into the [`ReconciliationQueue`]. The queue drains on a fixed period in
//! strict arrival order through a per-kind handler table; handlers are the
//! only writers of the revision cache.
//!
//! [`WatchActionContext`]: gatesync_core::WatchActionContext

#![forbid(unsafe_code)]

use std::sync::Arc;

use gatesync_core::ResourceKind;
use gatesync_store::RevisionCache;

pub mod handlers;
pub mod manager;
pub mod queue;
pub mod schedule;
pub mod sink;
pub mod status;

pub use handlers::{GatewayHandler, PluginHandler, Reconciler, SecretHandler, ServiceHandler};
pub use manager::{Manager, ManagerSettings, WatchManager};
pub use queue::{ActionHandler, QueueError, ReconciliationQueue, DEFAULT_DRAIN_INTERVAL, DEFAULT_MAX_RETRIES};
pub use schedule::RepeatingTask;
pub use sink::{GatewayConfig, GatewaySink, RouteSnapshot, RouteTable, ServiceRoute};
pub use status::{KubeStatusWriter, ResourceStatus, StatusWriter};

/// Queue with the handler table for every kind the controller watches.
pub fn standard_queue(
    cache: Arc<RevisionCache>,
    sink: Arc<dyn GatewaySink>,
    status: Arc<dyn StatusWriter>,
    max_retries: u32,
) -> ReconciliationQueue {
    let r = Reconciler::new(cache, sink, status);
    ReconciliationQueue::new(max_retries)
        .with_handler(ResourceKind::Plugin, Arc::new(PluginHandler(r.clone())))
        .with_handler(ResourceKind::Gateway, Arc::new(GatewayHandler(r.clone())))
        .with_handler(ResourceKind::Service, Arc::new(ServiceHandler(r.clone())))
        .with_handler(ResourceKind::Secret, Arc::new(SecretHandler(r)))
}
