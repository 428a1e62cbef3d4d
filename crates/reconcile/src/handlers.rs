//! Per-kind reconciliation handlers.
//!
//! Every handler fingerprints the resource `spec`; an unchanged hash is a
//! no-op. Changes update the revision cache, the gateway sink and the status
//! subresource, and the hash is recorded last so a failed status write is
//! retried in full.
//!
//! Gateways and services depend on other resources (plugins, secrets, their
//! gateway, paths held by other services). The last applied payload of each
//! is kept, and a change to a dependency re-runs its dependents with the hash
//! gate bypassed so their status converges without a new event.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use gatesync_core::{
    content_hash, GatewayResource, PluginRef, PluginResource, PluginRevision, ResourceKey, ResourceKind,
    ServiceResource, WatchActionContext, WatchEventKind,
};
use gatesync_store::{normalize_path, HashLedger, Owner, PluginUse, RevisionCache};
use metrics::counter;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::queue::ActionHandler;
use crate::sink::{GatewayConfig, GatewaySink, ServiceRoute};
use crate::status::{ResourceStatus, StatusWriter};

type Applied = Arc<Mutex<BTreeMap<ResourceKey, Value>>>;

/// Shared collaborators of all handlers.
#[derive(Clone)]
pub struct Reconciler {
    pub cache: Arc<RevisionCache>,
    pub sink: Arc<dyn GatewaySink>,
    pub status: Arc<dyn StatusWriter>,
    gateways: Applied,
    services: Applied,
}

fn spec_hash(payload: &Value) -> String { content_hash(payload.get("spec").unwrap_or(&Value::Null)) }

fn generation_of(payload: &Value) -> Option<i64> { payload.pointer("/metadata/generation").and_then(Value::as_i64) }

/// Resolve plugin references of an owner in its namespace. A pinned
/// generation only resolves against that exact generation.
pub fn resolve_uses(cache: &RevisionCache, owner: &ResourceKey, refs: &[PluginRef]) -> Vec<PluginUse> {
    refs.iter()
        .map(|r| {
            let plugin = owner.sibling(&r.name);
            match cache.plugins.get_revision(&plugin) {
                Some(rev) if rev.is_valid() && r.generation.map_or(true, |g| rev.generation() == Some(g)) => {
                    PluginUse { plugin, reference: r.clone(), revision: rev }
                }
                _ => PluginUse::unresolved(plugin, r.clone()),
            }
        })
        .collect()
}

fn unresolved(uses: &[PluginUse]) -> Vec<String> {
    uses.iter().filter(|u| u.revision.is_ref()).map(|u| format!("plugin {} is not resolved", u.reference.name)).collect()
}

fn status_for(hash: &str, generation: Option<i64>, problems: &[String]) -> ResourceStatus {
    if problems.is_empty() {
        ResourceStatus::ready(hash, generation)
    } else {
        ResourceStatus::not_ready(hash, generation, problems.join("; "))
    }
}

fn skipped(kind: ResourceKind, key: &ResourceKey) {
    counter!("reconcile_skipped_total", 1u64);
    debug!(kind = %kind, key = %key, "content unchanged; skipping");
}

/// Decode every applied payload; entries were decoded once before being kept.
fn decoded<T: DeserializeOwned>(applied: &Applied) -> Vec<(ResourceKey, T)> {
    let entries: Vec<(ResourceKey, Value)> = applied.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    entries.into_iter().filter_map(|(k, v)| serde_json::from_value(v).ok().map(|t| (k, t))).collect()
}

impl Reconciler {
    pub fn new(cache: Arc<RevisionCache>, sink: Arc<dyn GatewaySink>, status: Arc<dyn StatusWriter>) -> Self {
        Self { cache, sink, status, gateways: Applied::default(), services: Applied::default() }
    }

    /// Reconcile a gateway. Returns `false` when `gated` and the spec is unchanged.
    async fn reconcile_gateway(&self, key: &ResourceKey, gw: &GatewayResource, payload: &Value, gated: bool) -> Result<bool> {
        let hash = spec_hash(payload);
        if gated && self.cache.gateways.is_unchanged(key, &hash) {
            skipped(ResourceKind::Gateway, key);
            return Ok(false);
        }
        let owner = Owner::gateway(key.clone());
        let uses = resolve_uses(&self.cache, key, &gw.spec.plugins);
        let mut problems = unresolved(&uses);
        for secret in gw.spec.listeners.iter().filter_map(|l| l.tls_secret.as_deref()) {
            if !self.cache.secrets.contains(&key.sibling(secret)) {
                problems.push(format!("secret {} not found", secret));
            }
        }
        self.cache.gateways.set_gateway(key, gw.spec.enabled, gw.spec.listeners.iter().map(|l| l.name.clone()));
        self.cache.plugins.register_plugins_for(&owner, uses.clone());
        self.sink.upsert_gateway(
            key,
            GatewayConfig { enabled: gw.spec.enabled, listeners: gw.spec.listeners.clone(), plugins: uses },
        );
        self.gateways.lock().insert(key.clone(), payload.clone());

        self.status.write(ResourceKind::Gateway, key, &status_for(&hash, generation_of(payload), &problems)).await?;
        self.cache.gateways.set_hash(key, &hash);
        info!(key = %key, hash = %hash, listeners = gw.spec.listeners.len(), ready = problems.is_empty(), "gateway reconciled");
        Ok(true)
    }

    async fn reconcile_service(&self, key: &ResourceKey, svc: &ServiceResource, payload: &Value, gated: bool) -> Result<()> {
        let hash = spec_hash(payload);
        if gated && self.cache.services.is_unchanged(key, &hash) {
            skipped(ResourceKind::Service, key);
            return Ok(());
        }
        let owner = Owner::service(key.clone());
        let spec = &svc.spec;
        let uses = resolve_uses(&self.cache, key, &spec.plugins);
        let mut problems = unresolved(&uses);
        for secret in &spec.secrets {
            if !self.cache.secrets.contains(&key.sibling(secret)) {
                problems.push(format!("secret {} not found", secret));
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
        let conflict = spec.enabled && self.cache.services.has_context_path(spec.context_paths.as_slice(), Some(key));
        if conflict {
            problems.push("context path already claimed by another service".to_string());
        }
        // A conflicting service must not claim its paths.
        let routed = spec.enabled && !conflict;
        self.cache.services.set_service_enabled(key, routed);
        self.cache.services.set_service_context_paths(key, &spec.context_paths);
        self.cache.services.set_service_gateway(key, spec.gateway.clone());
        self.cache.plugins.register_plugins_for(&owner, uses.clone());
        if routed {
            let route = ServiceRoute {
                gateway: spec.gateway.clone(),
                context_paths: spec.context_paths.clone(),
                upstream: spec.upstream.clone(),
                plugins: uses,
            };
            self.sink.upsert_route(key, route);
        } else {
            self.sink.remove_route(key);
        }
        self.services.lock().insert(key.clone(), payload.clone());

        self.status.write(ResourceKind::Service, key, &status_for(&hash, generation_of(payload), &problems)).await?;
        self.cache.services.set_hash(key, &hash);
        info!(key = %key, hash = %hash, routed, ready = problems.is_empty(), "service reconciled");
        Ok(())
    }

    /// Re-run a dependent from its last applied payload, bypassing the hash
    /// gate. A failed status write forgets the hash so its next event retries.
    async fn rerun(&self, owner: &Owner) {
        let outcome = match owner.kind {
            ResourceKind::Gateway => {
                let Some(payload) = self.gateways.lock().get(&owner.key).cloned() else { return };
                match serde_json::from_value::<GatewayResource>(payload.clone()) {
                    Ok(gw) => self.reconcile_gateway(&owner.key, &gw, &payload, false).await.map(|_| ()),
                    Err(e) => Err(e.into()),
                }
            }
            ResourceKind::Service => {
                let Some(payload) = self.services.lock().get(&owner.key).cloned() else { return };
                match serde_json::from_value::<ServiceResource>(payload.clone()) {
                    Ok(svc) => self.reconcile_service(&owner.key, &svc, &payload, false).await,
                    Err(e) => Err(e.into()),
                }
            }
            ResourceKind::Plugin | ResourceKind::Secret => return,
        };
        counter!("reconcile_dependents_total", 1u64);
        if let Err(e) = outcome {
            warn!(owner = %owner, error = %e, "dependent reconcile failed; next event retries");
            self.cache.ledger(owner.kind).clear_hash(&owner.key);
        }
    }

    /// Re-run every owner of `plugin` after it changed.
    async fn refresh_owners(&self, plugin: &ResourceKey) {
        for owner in self.cache.plugins.resources_using_plugin(plugin) {
            debug!(owner = %owner, plugin = %plugin, "plugin changed; re-running owner");
            self.rerun(&owner).await;
        }
    }

    /// Re-run every service attached to `gateway`.
    async fn refresh_attached(&self, gateway: &ResourceKey) {
        for svc in self.cache.services.services_attached_to(gateway, None) {
            self.rerun(&Owner::service(svc)).await;
        }
    }

    /// Paths `key` currently holds; unrouted services hold none.
    fn held_paths(&self, key: &ResourceKey) -> BTreeSet<String> {
        if self.cache.services.is_service_enabled(key) {
            self.cache.services.service_context_paths(key)
        } else {
            BTreeSet::new()
        }
    }

    /// Give paths `key` held before and no longer holds to unrouted services
    /// that want them, in key order.
    async fn release_paths(&self, key: &ResourceKey, held_before: &BTreeSet<String>) {
        let held_now = self.held_paths(key);
        let freed: BTreeSet<&String> = held_before.difference(&held_now).collect();
        if freed.is_empty() {
            return;
        }
        for (other, svc) in decoded::<ServiceResource>(&self.services) {
            if other == *key || !svc.spec.enabled || self.cache.services.is_service_enabled(&other) {
                continue;
            }
            if svc.spec.context_paths.iter().any(|p| freed.contains(&normalize_path(p))) {
                debug!(key = %other, freed_by = %key, "context path released; re-running service");
                self.rerun(&Owner::service(other)).await;
            }
        }
    }

    /// Gateways and services in the secret's namespace that reference it.
    fn secret_dependents(&self, secret: &ResourceKey) -> Vec<Owner> {
        let gateways = decoded::<GatewayResource>(&self.gateways).into_iter().filter(|(k, gw)| {
            k.namespace == secret.namespace
                && gw.spec.listeners.iter().any(|l| l.tls_secret.as_deref() == Some(secret.name.as_str()))
        });
        let services = decoded::<ServiceResource>(&self.services)
            .into_iter()
            .filter(|(k, svc)| k.namespace == secret.namespace && svc.spec.secrets.contains(&secret.name));
        gateways.map(|(k, _)| Owner::gateway(k)).chain(services.map(|(k, _)| Owner::service(k))).collect()
    }

    /// Decode or log and give up; malformed payloads are not retried.
    fn decode<T: DeserializeOwned>(ctx: &mut WatchActionContext) -> Option<T> {
        match ctx.decode::<T>() {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(seq = ctx.seq, kind = %ctx.resource, error = %e, "dropping undecodable resource");
                ctx.record_error(e.to_string());
                None
            }
        }
    }

    fn key(ctx: &mut WatchActionContext) -> Option<ResourceKey> {
        match ctx.key() {
            Ok(k) => Some(k),
            Err(e) => {
                warn!(seq = ctx.seq, kind = %ctx.resource, error = %e, "dropping event without identity");
                ctx.record_error(e.to_string());
                None
            }
        }
    }
}

pub struct PluginHandler(pub Reconciler);
pub struct GatewayHandler(pub Reconciler);
pub struct ServiceHandler(pub Reconciler);
pub struct SecretHandler(pub Reconciler);

#[async_trait]
impl ActionHandler for PluginHandler {
    async fn handle(&self, ctx: &mut WatchActionContext) -> Result<()> {
        let r = &self.0;
        let Some(key) = Reconciler::key(ctx) else { return Ok(()) };
        if ctx.event == WatchEventKind::Deleted {
            r.cache.plugins.remove_revision(&key);
            r.sink.remove_plugin(&key);
            r.refresh_owners(&key).await;
            info!(key = %key, "plugin removed");
            return Ok(());
        }
        let Some(plugin) = Reconciler::decode::<PluginResource>(ctx) else { return Ok(()) };
        let hash = spec_hash(&ctx.payload);
        if r.cache.plugins.is_unchanged(&key, &hash) {
            skipped(ResourceKind::Plugin, &key);
            return Ok(());
        }
        let spec = ctx.payload.get("spec").cloned().unwrap_or(Value::Null);
        let revision = PluginRevision::resolved(spec, ctx.generation());
        r.cache.plugins.set_revision(&key, revision.clone());
        r.sink.upsert_plugin(&key, &revision);
        r.refresh_owners(&key).await;

        let problems = if plugin.spec.enabled { Vec::new() } else { vec!["plugin is disabled".to_string()] };
        r.status.write(ResourceKind::Plugin, &key, &status_for(&hash, ctx.generation(), &problems)).await?;
        r.cache.plugins.set_hash(&key, &hash);
        info!(key = %key, hash = %hash, plugin_type = %plugin.spec.plugin_type, "plugin reconciled");
        Ok(())
    }
}

#[async_trait]
impl ActionHandler for GatewayHandler {
    async fn handle(&self, ctx: &mut WatchActionContext) -> Result<()> {
        let r = &self.0;
        let Some(key) = Reconciler::key(ctx) else { return Ok(()) };
        if ctx.event == WatchEventKind::Deleted {
            r.cache.gateways.remove(&key);
            r.cache.plugins.remove_plugins_used_by(&Owner::gateway(key.clone()));
            r.sink.remove_gateway(&key);
            r.gateways.lock().remove(&key);
            info!(key = %key, "gateway removed");
            r.refresh_attached(&key).await;
            return Ok(());
        }
        let Some(gw) = Reconciler::decode::<GatewayResource>(ctx) else { return Ok(()) };
        if r.reconcile_gateway(&key, &gw, &ctx.payload, true).await? {
            r.refresh_attached(&key).await;
        }
        Ok(())
    }
}

#[async_trait]
impl ActionHandler for ServiceHandler {
    async fn handle(&self, ctx: &mut WatchActionContext) -> Result<()> {
        let r = &self.0;
        let Some(key) = Reconciler::key(ctx) else { return Ok(()) };
        let held_before = r.held_paths(&key);
        if ctx.event == WatchEventKind::Deleted {
            r.cache.services.remove(&key);
            r.cache.plugins.remove_plugins_used_by(&Owner::service(key.clone()));
            r.sink.remove_route(&key);
            r.services.lock().remove(&key);
            info!(key = %key, "service removed");
            r.release_paths(&key, &held_before).await;
            return Ok(());
        }
        let Some(svc) = Reconciler::decode::<ServiceResource>(ctx) else { return Ok(()) };
        let outcome = r.reconcile_service(&key, &svc, &ctx.payload, true).await;
        // Paths are released from the cache before the status write, so this
        // runs even when the write failed and the retry would see nothing freed.
        r.release_paths(&key, &held_before).await;
        outcome
    }
}

#[async_trait]
impl ActionHandler for SecretHandler {
    async fn handle(&self, ctx: &mut WatchActionContext) -> Result<()> {
        let r = &self.0;
        let Some(key) = Reconciler::key(ctx) else { return Ok(()) };
        let known = r.cache.secrets.contains(&key);
        let present = ctx.event != WatchEventKind::Deleted;
        if present {
            r.cache.secrets.insert(&key);
        } else {
            r.cache.secrets.remove(&key);
        }
        debug!(key = %key, event = ?ctx.event, "secret observed");
        if known != present {
            for owner in r.secret_dependents(&key) {
                r.rerun(&owner).await;
            }
        }
        Ok(())
    }
}
