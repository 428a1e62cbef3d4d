use std::collections::BTreeSet;

use gatesync_core::ResourceKey;
use rustc_hash::FxHashMap;

use crate::{HashLedger, Hashes, Snapshot};

#[derive(Clone, Default)]
struct GatewayEntry {
    enabled: bool,
    listeners: BTreeSet<String>,
}

#[derive(Clone, Default)]
struct GatewayState {
    entries: FxHashMap<ResourceKey, GatewayEntry>,
    hashes: Hashes,
}

/// Known gateways with their enablement and listener names.
#[derive(Default)]
pub struct GatewayCache {
    state: Snapshot<GatewayState>,
}

impl GatewayCache {
    pub fn set_gateway(&self, key: &ResourceKey, enabled: bool, listeners: impl IntoIterator<Item = String>) {
        let listeners: BTreeSet<String> = listeners.into_iter().collect();
        self.state.update(|s| {
            s.entries.insert(key.clone(), GatewayEntry { enabled, listeners: listeners.clone() });
        });
    }

    pub fn contains(&self, key: &ResourceKey) -> bool { self.state.load().entries.contains_key(key) }

    pub fn is_enabled(&self, key: &ResourceKey) -> bool {
        self.state.load().entries.get(key).map(|e| e.enabled).unwrap_or(false)
    }

    pub fn listeners(&self, key: &ResourceKey) -> BTreeSet<String> {
        self.state.load().entries.get(key).map(|e| e.listeners.clone()).unwrap_or_default()
    }

    pub fn has_listener(&self, key: &ResourceKey, listener: &str) -> bool {
        self.state.load().entries.get(key).map(|e| e.listeners.contains(listener)).unwrap_or(false)
    }

    pub fn remove(&self, key: &ResourceKey) {
        self.state.update(|s| {
            s.entries.remove(key);
            s.hashes.remove(key);
        });
    }

    pub fn clear(&self) { self.state.reset(); }

    pub fn len(&self) -> usize { self.state.load().entries.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl HashLedger for GatewayCache {
    fn hash_of(&self, key: &ResourceKey) -> Option<String> { self.state.load().hashes.get(key).cloned() }

    fn set_hash(&self, key: &ResourceKey, hash: &str) {
        self.state.update(|s| {
            s.hashes.insert(key.clone(), hash.to_string());
        });
    }

    fn clear_hash(&self, key: &ResourceKey) {
        self.state.update(|s| {
            s.hashes.remove(key);
        });
    }
}
