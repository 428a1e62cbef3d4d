//! Status write-back to the status subresource.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use gatesync_core::{ResourceKey, ResourceKind};
use kube::api::{Api, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    pub hash: String,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// RFC 3339 time of the reconcile that produced this status.
    pub last_sync_time: String,
}

impl ResourceStatus {
    pub fn ready(hash: &str, generation: Option<i64>) -> Self {
        Self {
            observed_generation: generation,
            hash: hash.to_string(),
            ready: true,
            message: None,
            last_sync_time: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn not_ready(hash: &str, generation: Option<i64>, message: impl Into<String>) -> Self {
        Self { ready: false, message: Some(message.into()), ..Self::ready(hash, generation) }
    }
}

#[async_trait]
pub trait StatusWriter: Send + Sync {
    async fn write(&self, kind: ResourceKind, key: &ResourceKey, status: &ResourceStatus) -> Result<()>;
}

/// Merge-patches `.status` through the kube client.
pub struct KubeStatusWriter {
    client: kube::Client,
    group: String,
    version: String,
    timeout: Duration,
}

impl KubeStatusWriter {
    pub fn new(client: kube::Client, group: &str, version: &str, timeout: Duration) -> Self {
        Self { client, group: group.to_string(), version: version.to_string(), timeout }
    }

    fn api(&self, kind: ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(&self.group, &self.version, kind.kind());
        let ar = ApiResource::from_gvk_with_plural(&gvk, kind.plural());
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn write(&self, kind: ResourceKind, key: &ResourceKey, status: &ResourceStatus) -> Result<()> {
        let api = self.api(kind, key.namespace.as_deref());
        let patch = serde_json::json!({ "status": status });
        let pp = PatchParams::default();
        tokio::time::timeout(self.timeout, api.patch_status(&key.name, &pp, &Patch::Merge(&patch)))
            .await
            .with_context(|| format!("status write for {} {} timed out", kind, key))?
            .with_context(|| format!("patching status of {} {}", kind, key))?;
        debug!(kind = %kind, key = %key, ready = status.ready, "status written");
        Ok(())
    }
}
