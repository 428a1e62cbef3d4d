//! gatesync store: revision cache of reconciled state.
//!
//! Each per-kind cache keeps its state in an `ArcSwap` snapshot. Writes come
//! from the single reconciliation consumer and replace the snapshot
//! copy-on-write; readers (the admission gate, HTTP handlers) load the current
//! snapshot without blocking. Lookups for unknown keys return empty defaults.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use gatesync_core::{ResourceKey, ResourceKind};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

mod gateway;
mod plugin;
mod secret;
mod service;

pub use gateway::GatewayCache;
pub use plugin::{PluginCache, PluginUse};
pub use secret::SecretCache;
pub use service::{normalize_path, ServiceCache};

/// A resource that references plugins (a gateway or a service).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Owner {
    pub kind: ResourceKind,
    pub key: ResourceKey,
}

impl Owner {
    pub fn new(kind: ResourceKind, key: ResourceKey) -> Self { Self { kind, key } }
    pub fn gateway(key: ResourceKey) -> Self { Self::new(ResourceKind::Gateway, key) }
    pub fn service(key: ResourceKey) -> Self { Self::new(ResourceKind::Service, key) }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.kind, self.key) }
}

/// Last reconciled content hash per resource key.
pub trait HashLedger {
    fn hash_of(&self, key: &ResourceKey) -> Option<String>;
    fn set_hash(&self, key: &ResourceKey, hash: &str);
    /// Forget the hash so the next event for `key` reconciles in full.
    fn clear_hash(&self, key: &ResourceKey);

    /// True when `hash` equals the stored hash; an absent entry counts as changed.
    fn is_unchanged(&self, key: &ResourceKey, hash: &str) -> bool {
        self.hash_of(key).as_deref() == Some(hash)
    }
}

/// Copy-on-write holder for one cache's state.
pub(crate) struct Snapshot<S> {
    inner: ArcSwap<S>,
}

impl<S: Clone + Default> Default for Snapshot<S> {
    fn default() -> Self { Self { inner: ArcSwap::from_pointee(S::default()) } }
}

impl<S: Clone + Default> Snapshot<S> {
    pub(crate) fn load(&self) -> Arc<S> { self.inner.load_full() }

    /// Apply `f` to a private copy and publish it.
    pub(crate) fn update(&self, mut f: impl FnMut(&mut S)) {
        self.inner.rcu(|cur| {
            let mut next = S::clone(cur);
            f(&mut next);
            next
        });
    }

    pub(crate) fn reset(&self) { self.inner.store(Arc::new(S::default())); }
}

pub(crate) type Hashes = FxHashMap<ResourceKey, String>;

/// All caches shared by the reconciliation handlers and the admission gate.
#[derive(Default)]
pub struct RevisionCache {
    pub plugins: PluginCache,
    pub gateways: GatewayCache,
    pub services: ServiceCache,
    pub secrets: SecretCache,
}

impl RevisionCache {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    /// Hash ledger for `kind`.
    pub fn ledger(&self, kind: ResourceKind) -> &dyn HashLedger {
        match kind {
            ResourceKind::Plugin => &self.plugins,
            ResourceKind::Gateway => &self.gateways,
            ResourceKind::Service => &self.services,
            ResourceKind::Secret => &self.secrets,
        }
    }

    pub fn clear_all(&self) {
        self.plugins.clear_cache();
        self.gateways.clear();
        self.services.clear();
        self.secrets.clear();
        tracing::debug!("revision cache cleared");
    }
}
