use gatesync_core::ResourceKey;
use rustc_hash::FxHashSet;

use crate::{HashLedger, Hashes, Snapshot};

#[derive(Clone, Default)]
struct SecretState {
    known: FxHashSet<ResourceKey>,
    hashes: Hashes,
}

/// Secrets observed in the watched namespace; only identity is kept, never data.
#[derive(Default)]
pub struct SecretCache {
    state: Snapshot<SecretState>,
}

impl SecretCache {
    pub fn insert(&self, key: &ResourceKey) {
        self.state.update(|s| {
            s.known.insert(key.clone());
        });
    }

    pub fn remove(&self, key: &ResourceKey) {
        self.state.update(|s| {
            s.known.remove(key);
            s.hashes.remove(key);
        });
    }

    pub fn contains(&self, key: &ResourceKey) -> bool { self.state.load().known.contains(key) }

    pub fn clear(&self) { self.state.reset(); }

    pub fn len(&self) -> usize { self.state.load().known.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl HashLedger for SecretCache {
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
