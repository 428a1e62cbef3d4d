//! Service enablement, claimed context paths and gateway attachment.

use std::collections::BTreeSet;

use gatesync_core::{GatewayRef, ResourceKey};
use rustc_hash::FxHashMap;

use crate::{HashLedger, Hashes, Snapshot};

/// Canonical form used for overlap checks: no trailing slash, root is `/`.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

#[derive(Clone)]
struct ServiceEntry {
    enabled: bool,
    context_paths: BTreeSet<String>,
    gateway: Option<GatewayRef>,
}

// Services are enabled unless their spec says otherwise.
impl Default for ServiceEntry {
    fn default() -> Self { Self { enabled: true, context_paths: BTreeSet::new(), gateway: None } }
}

#[derive(Clone, Default)]
struct ServiceState {
    entries: FxHashMap<ResourceKey, ServiceEntry>,
    hashes: Hashes,
}

#[derive(Default)]
pub struct ServiceCache {
    state: Snapshot<ServiceState>,
}

impl ServiceCache {
    pub fn set_service_enabled(&self, key: &ResourceKey, enabled: bool) {
        self.state.update(|s| s.entries.entry(key.clone()).or_default().enabled = enabled);
    }

    pub fn is_service_enabled(&self, key: &ResourceKey) -> bool {
        self.state.load().entries.get(key).map(|e| e.enabled).unwrap_or(false)
    }

    pub fn set_service_context_paths<I, P>(&self, key: &ResourceKey, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        let paths: BTreeSet<String> = paths.into_iter().map(|p| normalize_path(p.as_ref())).collect();
        self.state.update(|s| s.entries.entry(key.clone()).or_default().context_paths = paths.clone());
    }

    pub fn service_context_paths(&self, key: &ResourceKey) -> BTreeSet<String> {
        self.state.load().entries.get(key).map(|e| e.context_paths.clone()).unwrap_or_default()
    }

    pub fn remove_service_context_paths(&self, key: &ResourceKey) {
        self.state.update(|s| {
            if let Some(e) = s.entries.get_mut(key) {
                e.context_paths.clear();
            }
        });
    }

    /// True iff an enabled service other than `excluding` claims one of `paths`.
    pub fn has_context_path<P: AsRef<str>>(&self, paths: &[P], excluding: Option<&ResourceKey>) -> bool {
        let wanted: BTreeSet<String> = paths.iter().map(|p| normalize_path(p.as_ref())).collect();
        let snap = self.state.load();
        snap.entries
            .iter()
            .filter(|(k, e)| e.enabled && Some(*k) != excluding)
            .any(|(_, e)| !e.context_paths.is_disjoint(&wanted))
    }

    pub fn set_service_gateway(&self, key: &ResourceKey, gateway: GatewayRef) {
        self.state.update(|s| s.entries.entry(key.clone()).or_default().gateway = Some(gateway.clone()));
    }

    pub fn service_gateway(&self, key: &ResourceKey) -> Option<GatewayRef> {
        self.state.load().entries.get(key).and_then(|e| e.gateway.clone())
    }

    /// Services in the gateway's namespace attached to it. With a listener,
    /// only services pinned to that listener are returned.
    pub fn services_attached_to(&self, gateway: &ResourceKey, listener: Option<&str>) -> BTreeSet<ResourceKey> {
        self.state
            .load()
            .entries
            .iter()
            .filter(|(k, _)| k.namespace == gateway.namespace)
            .filter(|(_, e)| match &e.gateway {
                Some(g) => g.name == gateway.name && listener.map_or(true, |l| g.listener.as_deref() == Some(l)),
                None => false,
            })
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool { self.state.load().entries.contains_key(key) }

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

impl HashLedger for ServiceCache {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_trailing_slash() {
        assert_eq!(normalize_path("/a/"), "/a");
        assert_eq!(normalize_path("a"), "/a");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
    }

    #[test]
    fn disabled_services_do_not_claim_paths() {
        let cache = ServiceCache::default();
        let svc = ResourceKey::new(Some("edge"), "svc1");
        cache.set_service_context_paths(&svc, ["/a"]);
        assert!(cache.has_context_path(&["/a/"], None));
        cache.set_service_enabled(&svc, false);
        assert!(!cache.has_context_path(&["/a"], None));
    }
}
