//! gatesync admission – synchronous allow/deny for managed resource mutations.
//!
//! Rules run in order: the API group must match, status-subresource updates
//! pass untouched, everything else goes to the validator registered for the
//! kind. The gate never writes anything.

#![forbid(unsafe_code)]

use std::sync::Arc;

use gatesync_core::{ResourceKey, ResourceKind};
use gatesync_store::RevisionCache;
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

pub mod review;
pub mod validators;

pub use review::{AdmissionRequest, AdmissionResponse, AdmissionReview, GroupVersionKind, Operation, StatusResult};
pub use validators::{GatewayValidator, PluginValidator, ServiceValidator, Validator};

pub const CODE_OK: u16 = 200;
/// Structural problem with the request (wrong group, unknown kind).
pub const CODE_BAD_REQUEST: u16 = 400;
/// Mutation would break a resource that depends on this one.
pub const CODE_CONFLICT: u16 = 409;
/// Referenced dependencies are not known.
pub const CODE_UNRESOLVED: u16 = 422;
pub const CODE_INTERNAL: u16 = 500;

const INTERNAL_MESSAGE: &str = "admission request could not be processed";

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("decoding admission review: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("admission review carries no request")]
    MissingRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Decision {
    pub fn allow() -> Self { Self { allowed: true, code: CODE_OK, message: None } }

    pub fn deny(code: u16, message: impl Into<String>) -> Self {
        Self { allowed: false, code, message: Some(message.into()) }
    }

    /// Generic failure; details are only logged.
    pub fn internal() -> Self { Self::deny(CODE_INTERNAL, INTERNAL_MESSAGE) }

    pub fn into_response(self, uid: String) -> AdmissionResponse {
        let status = if self.allowed {
            None
        } else {
            Some(StatusResult { code: self.code, message: self.message.unwrap_or_default() })
        };
        AdmissionResponse { uid, allowed: self.allowed, status }
    }
}

pub struct AdmissionGate {
    group: String,
    validators: FxHashMap<ResourceKind, Box<dyn Validator>>,
}

impl AdmissionGate {
    /// Gate with no validators; see [`AdmissionGate::standard`].
    pub fn new(group: &str) -> Self { Self { group: group.to_string(), validators: FxHashMap::default() } }

    /// Gate with the validator of every managed kind.
    pub fn standard(group: &str, cache: Arc<RevisionCache>) -> Self {
        Self::new(group)
            .with_validator(ResourceKind::Plugin, Box::new(PluginValidator { cache: Arc::clone(&cache) }))
            .with_validator(ResourceKind::Gateway, Box::new(GatewayValidator { cache: Arc::clone(&cache) }))
            .with_validator(ResourceKind::Service, Box::new(ServiceValidator { cache }))
    }

    pub fn with_validator(mut self, kind: ResourceKind, validator: Box<dyn Validator>) -> Self {
        self.validators.insert(kind, validator);
        self
    }

    pub fn group(&self) -> &str { &self.group }

    pub fn validate(&self, req: &AdmissionRequest) -> Decision {
        let decision = self.decide(req);
        if decision.allowed {
            counter!("admission_allowed_total", 1u64);
            debug!(uid = %req.uid, kind = %req.kind.kind, op = ?req.operation, "admitted");
        } else {
            counter!("admission_denied_total", 1u64);
            info!(uid = %req.uid, kind = %req.kind.kind, op = ?req.operation, code = decision.code, reason = ?decision.message, "denied");
        }
        decision
    }

    fn decide(&self, req: &AdmissionRequest) -> Decision {
        if req.kind.group != self.group {
            return Decision::deny(
                CODE_BAD_REQUEST,
                format!("resource group {:?} does not match {}", req.kind.group, self.group),
            );
        }
        if req.is_status_update() {
            return Decision::allow();
        }
        let validator = ResourceKind::from_kind(&req.kind.kind)
            .filter(|k| ResourceKind::MANAGED.contains(k))
            .and_then(|k| self.validators.get(&k));
        let Some(validator) = validator else {
            return Decision::deny(CODE_BAD_REQUEST, format!("kind {} is not managed", req.kind.kind));
        };
        let Some(name) = req.resource_name() else {
            return Decision::deny(CODE_BAD_REQUEST, "request names no resource");
        };
        let key = ResourceKey::new(req.namespace.as_deref().filter(|ns| !ns.is_empty()), &name);
        validator.validate(&key, req)
    }

    /// Decode a review body and answer it. Never fails: malformed input
    /// yields a denial with code 500.
    pub fn review(&self, body: &[u8]) -> AdmissionReview {
        match parse_request(body) {
            Ok(req) => {
                let uid = req.uid.clone();
                AdmissionReview::response(self.validate(&req).into_response(uid))
            }
            Err(e) => {
                warn!(error = %e, bytes = body.len(), "rejecting malformed admission review");
                counter!("admission_denied_total", 1u64);
                AdmissionReview::response(Decision::internal().into_response(String::new()))
            }
        }
    }
}

fn parse_request(body: &[u8]) -> Result<AdmissionRequest, AdmissionError> {
    let review: AdmissionReview = serde_json::from_slice(body)?;
    review.request.ok_or(AdmissionError::MissingRequest)
}
