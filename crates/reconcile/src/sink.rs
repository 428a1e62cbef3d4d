//! Gateway-visible configuration produced by reconciliation.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use gatesync_core::{GatewayRef, Listener, PluginRevision, ResourceKey, ResourceKind};
use gatesync_store::{Owner, PluginUse};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    pub enabled: bool,
    pub listeners: Vec<Listener>,
    pub plugins: Vec<PluginUse>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRoute {
    pub gateway: GatewayRef,
    pub context_paths: Vec<String>,
    pub upstream: String,
    pub plugins: Vec<PluginUse>,
}

/// Receives converged configuration. Calls come from the queue consumer only.
pub trait GatewaySink: Send + Sync {
    fn upsert_plugin(&self, key: &ResourceKey, revision: &PluginRevision);
    fn remove_plugin(&self, key: &ResourceKey);
    fn upsert_gateway(&self, key: &ResourceKey, config: GatewayConfig);
    fn remove_gateway(&self, key: &ResourceKey);
    fn upsert_route(&self, key: &ResourceKey, route: ServiceRoute);
    fn remove_route(&self, key: &ResourceKey);
    /// Refresh the resolved plugins of an owner after a plugin changed.
    fn update_plugins(&self, owner: &Owner, plugins: &[PluginUse]);
}

/// Serializable view of everything applied so far, keyed by `ns/name`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RouteSnapshot {
    pub plugins: BTreeMap<String, PluginRevision>,
    pub gateways: BTreeMap<String, GatewayConfig>,
    pub routes: BTreeMap<String, ServiceRoute>,
}

/// In-memory sink; readers get lock-free snapshots.
#[derive(Default)]
pub struct RouteTable {
    snap: ArcSwap<RouteSnapshot>,
}

impl RouteTable {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    pub fn snapshot(&self) -> Arc<RouteSnapshot> { self.snap.load_full() }

    fn update(&self, mut f: impl FnMut(&mut RouteSnapshot)) {
        self.snap.rcu(|cur| {
            let mut next = RouteSnapshot::clone(cur);
            f(&mut next);
            next
        });
    }
}

impl GatewaySink for RouteTable {
    fn upsert_plugin(&self, key: &ResourceKey, revision: &PluginRevision) {
        self.update(|s| {
            s.plugins.insert(key.to_string(), revision.clone());
        });
    }

    fn remove_plugin(&self, key: &ResourceKey) {
        self.update(|s| {
            s.plugins.remove(&key.to_string());
        });
    }

    fn upsert_gateway(&self, key: &ResourceKey, config: GatewayConfig) {
        self.update(|s| {
            s.gateways.insert(key.to_string(), config.clone());
        });
    }

    fn remove_gateway(&self, key: &ResourceKey) {
        self.update(|s| {
            s.gateways.remove(&key.to_string());
        });
    }

    fn upsert_route(&self, key: &ResourceKey, route: ServiceRoute) {
        self.update(|s| {
            s.routes.insert(key.to_string(), route.clone());
        });
    }

    fn remove_route(&self, key: &ResourceKey) {
        self.update(|s| {
            s.routes.remove(&key.to_string());
        });
    }

    fn update_plugins(&self, owner: &Owner, plugins: &[PluginUse]) {
        let name = owner.key.to_string();
        self.update(|s| match owner.kind {
            ResourceKind::Gateway => {
                if let Some(g) = s.gateways.get_mut(&name) {
                    g.plugins = plugins.to_vec();
                }
            }
            ResourceKind::Service => {
                if let Some(r) = s.routes.get_mut(&name) {
                    r.plugins = plugins.to_vec();
                }
            }
            _ => {}
        });
    }
}
