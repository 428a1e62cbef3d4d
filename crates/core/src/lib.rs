//! gatesync core types: resource identity, watch events and reconciliation contexts.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod hash;
pub mod resources;
pub mod revision;

pub use hash::{canonical_json, content_hash, HASH_HEX_LEN};
pub use resources::{
    GatewayRef, GatewayResource, GatewaySpec, Listener, PluginResource, PluginSpec, ServiceResource,
    ServiceSpec,
};
pub use revision::{PluginRef, PluginRevision};

/// Owning API group of the managed custom resources.
pub const DEFAULT_GROUP: &str = "gatesync.io";
/// Served version of the managed custom resources.
pub const DEFAULT_VERSION: &str = "v1alpha1";
/// Version of the core (group-less) API.
pub const CORE_VERSION: &str = "v1";

pub mod prelude {
    pub use super::{
        content_hash, CoreError, PluginRef, PluginRevision, ResourceKey, ResourceKind, WatchActionContext,
        WatchEvent, WatchEventKind,
    };
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("resource payload missing metadata.name")]
    MissingName,
    #[error("decoding {kind} payload: {source}")]
    Decode {
        kind: ResourceKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Resource kinds the controller watches. Secrets live in the core group,
/// everything else in the owning custom group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Plugin,
    Gateway,
    Service,
    Secret,
}

impl ResourceKind {
    pub const MANAGED: [ResourceKind; 3] = [ResourceKind::Plugin, ResourceKind::Gateway, ResourceKind::Service];

    pub fn kind(&self) -> &'static str {
        match self {
            ResourceKind::Plugin => "Plugin",
            ResourceKind::Gateway => "Gateway",
            ResourceKind::Service => "Service",
            ResourceKind::Secret => "Secret",
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            ResourceKind::Plugin => "plugins",
            ResourceKind::Gateway => "gateways",
            ResourceKind::Service => "services",
            ResourceKind::Secret => "secrets",
        }
    }

    pub fn is_core(&self) -> bool { matches!(self, ResourceKind::Secret) }

    /// Lookup by `kind` as carried in admission requests.
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "Plugin" => Some(ResourceKind::Plugin),
            "Gateway" => Some(ResourceKind::Gateway),
            "Service" => Some(ResourceKind::Service),
            "Secret" => Some(ResourceKind::Secret),
            _ => None,
        }
    }

    /// Lookup by plural resource name (URI segment).
    pub fn from_plural(plural: &str) -> Option<Self> {
        match plural {
            "plugins" => Some(ResourceKind::Plugin),
            "gateways" => Some(ResourceKind::Gateway),
            "services" => Some(ResourceKind::Service),
            "secrets" => Some(ResourceKind::Secret),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.kind()) }
}

/// Namespaced identity of a resource, rendered `ns/name` (or `name` when cluster scoped).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    /// Extract the key from a raw object's `metadata`.
    pub fn from_object(raw: &serde_json::Value) -> Result<Self, CoreError> {
        let meta = raw.get("metadata");
        let name = meta
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(CoreError::MissingName)?;
        let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str());
        Ok(Self::new(namespace, name))
    }

    /// Key of a sibling resource in the same namespace.
    pub fn sibling(&self, name: &str) -> Self { Self { namespace: self.namespace.clone(), name: name.to_string() } }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Watch event type as sent by the API server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchEventKind {
    #[serde(rename = "ADDED")]
    Added,
    #[serde(rename = "MODIFIED")]
    Modified,
    #[serde(rename = "DELETED")]
    Deleted,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "BOOKMARK")]
    Bookmark,
}

/// One decoded watch frame: `{"type": "...", "object": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent<T> {
    #[serde(rename = "type")]
    pub kind: WatchEventKind,
    pub object: T,
}

/// One unit of reconciliation work, created per watch event and discarded once drained.
#[derive(Debug, Clone)]
pub struct WatchActionContext {
    /// Assigned by the queue at enqueue time; strictly increasing.
    pub seq: u64,
    pub resource: ResourceKind,
    pub event: WatchEventKind,
    pub payload: serde_json::Value,
    pub retries: u32,
    pub errors: Vec<String>,
}

impl WatchActionContext {
    pub fn new(resource: ResourceKind, event: WatchEventKind, payload: serde_json::Value) -> Self {
        Self { seq: 0, resource, event, payload, retries: 0, errors: Vec::new() }
    }

    pub fn from_event(resource: ResourceKind, ev: WatchEvent<serde_json::Value>) -> Self {
        Self::new(resource, ev.kind, ev.object)
    }

    pub fn key(&self) -> Result<ResourceKey, CoreError> { ResourceKey::from_object(&self.payload) }

    pub fn generation(&self) -> Option<i64> {
        self.payload.get("metadata").and_then(|m| m.get("generation")).and_then(|v| v.as_i64())
    }

    /// Decode the payload into a typed resource.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, CoreError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| CoreError::Decode { kind: self.resource, source })
    }

    pub fn record_error(&mut self, msg: impl Into<String>) { self.errors.push(msg.into()); }

    pub fn has_errors(&self) -> bool { !self.errors.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_from_object_reads_metadata() {
        let raw = serde_json::json!({"metadata": {"name": "svc1", "namespace": "edge"}});
        let key = ResourceKey::from_object(&raw).expect("key");
        assert_eq!(key.to_string(), "edge/svc1");
        assert_eq!(key.sibling("p").to_string(), "edge/p");
        assert!(matches!(ResourceKey::from_object(&serde_json::json!({})), Err(CoreError::MissingName)));
    }

    #[test]
    fn watch_event_decodes_type_tags() {
        let ev: WatchEvent<serde_json::Value> =
            serde_json::from_str(r#"{"type":"BOOKMARK","object":{"metadata":{"resourceVersion":"7"}}}"#).expect("decode");
        assert_eq!(ev.kind, WatchEventKind::Bookmark);
        let ctx = WatchActionContext::from_event(ResourceKind::Plugin, ev);
        assert_eq!(ctx.event, WatchEventKind::Bookmark);
        assert!(!ctx.has_errors());
    }

    #[test]
    fn kind_lookups_are_symmetric() {
        for k in [ResourceKind::Plugin, ResourceKind::Gateway, ResourceKind::Service, ResourceKind::Secret] {
            assert_eq!(ResourceKind::from_kind(k.kind()), Some(k));
            assert_eq!(ResourceKind::from_plural(k.plural()), Some(k));
        }
        assert!(ResourceKind::Secret.is_core());
    }
}
