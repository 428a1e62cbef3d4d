//! `admission.k8s.io/v1` AdmissionReview wire types (the subset the gate reads and writes).

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const REVIEW_API_VERSION: &str = "admission.k8s.io/v1";
pub const REVIEW_KIND: &str = "AdmissionReview";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Connect,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    pub kind: GroupVersionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_object: Option<Value>,
}

impl AdmissionRequest {
    /// Resource name from the request, falling back to the object's metadata.
    pub fn resource_name(&self) -> Option<String> {
        self.name.clone().filter(|n| !n.is_empty()).or_else(|| {
            [&self.object, &self.old_object]
                .into_iter()
                .flatten()
                .find_map(|o| o.pointer("/metadata/name").and_then(|v| v.as_str()).map(|s| s.to_string()))
        })
    }

    pub fn is_status_update(&self) -> bool {
        self.operation == Operation::Update && self.sub_resource.as_deref() == Some("status")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResult {
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

impl AdmissionReview {
    pub fn request(req: AdmissionRequest) -> Self {
        Self { api_version: REVIEW_API_VERSION.into(), kind: REVIEW_KIND.into(), request: Some(req), response: None }
    }

    pub fn response(resp: AdmissionResponse) -> Self {
        Self { api_version: REVIEW_API_VERSION.into(), kind: REVIEW_KIND.into(), request: None, response: Some(resp) }
    }
}
