//! Plugin revisions and the owner → plugin reverse index.

use std::collections::BTreeSet;

use gatesync_core::{PluginRef, PluginRevision, ResourceKey};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{HashLedger, Hashes, Owner, Snapshot};

/// One plugin used by an owner, as resolved when the owner was reconciled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginUse {
    pub plugin: ResourceKey,
    pub reference: PluginRef,
    pub revision: PluginRevision,
}

impl PluginUse {
    /// Use that has not been resolved to a plugin revision.
    pub fn unresolved(plugin: ResourceKey, reference: PluginRef) -> Self {
        let revision = PluginRevision::reference(reference.clone());
        Self { plugin, reference, revision }
    }
}

#[derive(Clone, Default)]
struct PluginState {
    revisions: FxHashMap<ResourceKey, PluginRevision>,
    used_by: FxHashMap<Owner, Vec<PluginUse>>,
    hashes: Hashes,
}

#[derive(Default)]
pub struct PluginCache {
    state: Snapshot<PluginState>,
}

impl PluginCache {
    pub fn set_revision(&self, plugin: &ResourceKey, revision: PluginRevision) {
        self.state.update(|s| {
            s.revisions.insert(plugin.clone(), revision.clone());
        });
    }

    pub fn get_revision(&self, plugin: &ResourceKey) -> Option<PluginRevision> {
        self.state.load().revisions.get(plugin).cloned()
    }

    pub fn remove_revision(&self, plugin: &ResourceKey) {
        self.state.update(|s| {
            s.revisions.remove(plugin);
            s.hashes.remove(plugin);
        });
    }

    pub fn contains(&self, plugin: &ResourceKey) -> bool { self.state.load().revisions.contains_key(plugin) }

    /// Replace the full list of plugins used by `owner`; an empty list drops the owner.
    pub fn register_plugins_for(&self, owner: &Owner, uses: Vec<PluginUse>) {
        debug!(owner = %owner, count = uses.len(), "registering plugin uses");
        self.state.update(|s| {
            if uses.is_empty() {
                s.used_by.remove(owner);
            } else {
                s.used_by.insert(owner.clone(), uses.clone());
            }
        });
    }

    pub fn plugins_used_by(&self, owner: &Owner) -> Vec<PluginUse> {
        self.state.load().used_by.get(owner).cloned().unwrap_or_default()
    }

    /// Owners whose registered uses include `plugin`.
    pub fn resources_using_plugin(&self, plugin: &ResourceKey) -> BTreeSet<Owner> {
        self.state
            .load()
            .used_by
            .iter()
            .filter(|(_, uses)| uses.iter().any(|u| &u.plugin == plugin))
            .map(|(owner, _)| owner.clone())
            .collect()
    }

    pub fn remove_plugins_used_by(&self, owner: &Owner) {
        self.state.update(|s| {
            s.used_by.remove(owner);
        });
    }

    pub fn clear_cache(&self) { self.state.reset(); }

    pub fn len(&self) -> usize { self.state.load().revisions.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl HashLedger for PluginCache {
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
