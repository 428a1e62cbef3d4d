//! Plugin references and revisions.

use serde::{Deserialize, Serialize};

use crate::hash::content_hash;

/// Reference from a gateway or service to a plugin in the same namespace,
/// optionally pinned to a generation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct PluginRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
}

impl PluginRef {
    pub fn new(name: &str) -> Self { Self { name: name.to_string(), generation: None } }
}

/// Observed version of a plugin: either an unresolved reference or a resolved
/// payload with its content hash. The two shapes are never mixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRevision {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    plugin_reference: Option<PluginRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    generation: Option<i64>,
}

impl PluginRevision {
    /// Pointer to a plugin that has not been resolved (yet).
    pub fn reference(r: PluginRef) -> Self {
        let generation = r.generation;
        Self { plugin_reference: Some(r), payload: None, hash: None, generation }
    }

    /// Resolved revision; the hash is computed from `payload`.
    pub fn resolved(payload: serde_json::Value, generation: Option<i64>) -> Self {
        let hash = content_hash(&payload);
        Self { plugin_reference: None, payload: Some(payload), hash: Some(hash), generation }
    }

    pub fn is_ref(&self) -> bool { self.plugin_reference.is_some() }
    pub fn is_valid(&self) -> bool { self.payload.is_some() && self.hash.is_some() }

    pub fn plugin_reference(&self) -> Option<&PluginRef> { self.plugin_reference.as_ref() }
    pub fn payload(&self) -> Option<&serde_json::Value> { self.payload.as_ref() }
    pub fn hash(&self) -> Option<&str> { self.hash.as_deref() }
    pub fn generation(&self) -> Option<i64> { self.generation }
}
