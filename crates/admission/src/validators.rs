//! Per-kind business rules. Validators only read the revision cache.

use std::collections::BTreeSet;
use std::sync::Arc;

use gatesync_core::{GatewayResource, PluginResource, ResourceKey, ServiceResource};
use gatesync_store::{Owner, RevisionCache};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::review::{AdmissionRequest, Operation};
use crate::{Decision, CODE_CONFLICT, CODE_UNRESOLVED};

pub trait Validator: Send + Sync {
    fn validate(&self, key: &ResourceKey, req: &AdmissionRequest) -> Decision;
}

fn decode<T: DeserializeOwned>(req: &AdmissionRequest) -> Result<T, Decision> {
    let Some(object) = req.object.clone() else {
        warn!(uid = %req.uid, kind = %req.kind.kind, "admission request carries no object");
        return Err(Decision::internal());
    };
    serde_json::from_value(object).map_err(|e| {
        warn!(uid = %req.uid, kind = %req.kind.kind, error = %e, "undecodable admission object");
        Decision::internal()
    })
}

fn owners(set: &BTreeSet<Owner>) -> String { set.iter().map(|o| o.to_string()).collect::<Vec<_>>().join(", ") }

fn unresolved(problems: &[String]) -> Decision { Decision::deny(CODE_UNRESOLVED, problems.join("; ")) }

pub struct PluginValidator {
    pub cache: Arc<RevisionCache>,
}

impl Validator for PluginValidator {
    fn validate(&self, key: &ResourceKey, req: &AdmissionRequest) -> Decision {
        match req.operation {
            Operation::Create | Operation::Update => match decode::<PluginResource>(req) {
                Ok(p) if p.spec.plugin_type.trim().is_empty() => {
                    Decision::deny(CODE_UNRESOLVED, "plugin type must be set")
                }
                Ok(_) => Decision::allow(),
                Err(d) => d,
            },
            Operation::Delete => {
                let users = self.cache.plugins.resources_using_plugin(key);
                if users.is_empty() {
                    Decision::allow()
                } else {
                    Decision::deny(CODE_CONFLICT, format!("plugin {} is still used by {}", key, owners(&users)))
                }
            }
            Operation::Connect => Decision::allow(),
        }
    }
}

pub struct GatewayValidator {
    pub cache: Arc<RevisionCache>,
}

impl Validator for GatewayValidator {
    fn validate(&self, key: &ResourceKey, req: &AdmissionRequest) -> Decision {
        match req.operation {
            Operation::Create | Operation::Update => {
                let gw = match decode::<GatewayResource>(req) {
                    Ok(gw) => gw,
                    Err(d) => return d,
                };
                let mut problems = Vec::new();
                let mut names = BTreeSet::new();
                for l in &gw.spec.listeners {
                    if !names.insert(l.name.as_str()) {
                        problems.push(format!("listener {} is declared twice", l.name));
                    }
                    if let Some(secret) = l.tls_secret.as_deref() {
                        if !self.cache.secrets.contains(&key.sibling(secret)) {
                            problems.push(format!("secret {} not found", secret));
                        }
                    }
                }
                for p in &gw.spec.plugins {
                    if !self.cache.plugins.contains(&key.sibling(&p.name)) {
                        problems.push(format!("plugin {} not found", p.name));
                    }
                }
                if !problems.is_empty() {
                    return unresolved(&problems);
                }
                if req.operation == Operation::Update {
                    for removed in self.cache.gateways.listeners(key).iter().filter(|l| !names.contains(l.as_str())) {
                        let attached = self.cache.services.services_attached_to(key, Some(removed.as_str()));
                        if !attached.is_empty() {
                            let list = attached.iter().map(|k| k.to_string()).collect::<Vec<_>>().join(", ");
                            return Decision::deny(
                                CODE_CONFLICT,
                                format!("listener {} is still used by services {}", removed, list),
                            );
                        }
                    }
                }
                Decision::allow()
            }
            Operation::Delete => {
                let attached = self.cache.services.services_attached_to(key, None);
                if attached.is_empty() {
                    Decision::allow()
                } else {
                    let list = attached.iter().map(|k| k.to_string()).collect::<Vec<_>>().join(", ");
                    Decision::deny(CODE_CONFLICT, format!("gateway {} is still used by services {}", key, list))
                }
            }
            Operation::Connect => Decision::allow(),
        }
    }
}

pub struct ServiceValidator {
    pub cache: Arc<RevisionCache>,
}

impl Validator for ServiceValidator {
    fn validate(&self, key: &ResourceKey, req: &AdmissionRequest) -> Decision {
        if !matches!(req.operation, Operation::Create | Operation::Update) {
            return Decision::allow();
        }
        let svc = match decode::<ServiceResource>(req) {
            Ok(svc) => svc,
            Err(d) => return d,
        };
        let spec = &svc.spec;
        let mut problems = Vec::new();
        for p in &spec.plugins {
            if !self.cache.plugins.contains(&key.sibling(&p.name)) {
                problems.push(format!("plugin {} not found", p.name));
            }
        }
        for s in &spec.secrets {
            if !self.cache.secrets.contains(&key.sibling(s)) {
                problems.push(format!("secret {} not found", s));
            }
        }
        let gateway = key.sibling(&spec.gateway.name);
        if !self.cache.gateways.contains(&gateway) {
            problems.push(format!("gateway {} not found", spec.gateway.name));
        } else if let Some(listener) = spec.gateway.listener.as_deref() {
            if !self.cache.gateways.has_listener(&gateway, listener) {
                problems.push(format!("gateway {} has no listener {}", spec.gateway.name, listener));
            }
        }
        if !problems.is_empty() {
            return unresolved(&problems);
        }
        if spec.enabled && self.cache.services.has_context_path(spec.context_paths.as_slice(), Some(key)) {
            return Decision::deny(
                CODE_CONFLICT,
                format!("context paths {:?} are already claimed by another service", spec.context_paths),
            );
        }
        Decision::allow()
    }
}
