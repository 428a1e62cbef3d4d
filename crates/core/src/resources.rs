//! Typed views over the managed custom resources.
//!
//! Only the fields the controller acts on are modelled; everything else in
//! `spec` is carried through untouched by the raw JSON payload.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::revision::PluginRef;

fn default_true() -> bool { true }

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginSpec {
    /// Plugin implementation name (e.g. `rate-limit`).
    #[serde(rename = "type")]
    pub plugin_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginResource {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: PluginSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub listeners: Vec<Listener>,
    #[serde(default)]
    pub plugins: Vec<PluginRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayResource {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: GatewaySpec,
}

/// Attachment of a service to a gateway (optionally a single listener).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub gateway: GatewayRef,
    #[serde(default)]
    pub context_paths: Vec<String>,
    #[serde(default)]
    pub upstream: String,
    #[serde(default)]
    pub plugins: Vec<PluginRef>,
    #[serde(default)]
    pub secrets: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceResource {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: ServiceSpec,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_spec_defaults() {
        let svc: ServiceResource = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "svc1", "namespace": "edge"},
            "spec": {"gateway": {"name": "gw"}, "contextPaths": ["/a"], "plugins": [{"name": "auth"}]}
        }))
        .expect("decode");
        assert!(svc.spec.enabled);
        assert_eq!(svc.spec.context_paths, vec!["/a".to_string()]);
        assert_eq!(svc.spec.plugins[0].name, "auth");
        assert_eq!(svc.spec.gateway.listener, None);
    }

    #[test]
    fn listener_tls_secret_is_camel_case() {
        let gw: GatewayResource = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "gw"},
            "spec": {"listeners": [{"name": "https", "port": 443, "protocol": "HTTPS", "tlsSecret": "cert"}]}
        }))
        .expect("decode");
        assert_eq!(gw.spec.listeners[0].tls_secret.as_deref(), Some("cert"));
    }
}
