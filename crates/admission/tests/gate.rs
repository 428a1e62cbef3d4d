#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use gatesync_admission::{
    AdmissionGate, AdmissionRequest, AdmissionReview, Decision, GroupVersionKind, Operation, Validator, CODE_BAD_REQUEST,
    CODE_CONFLICT, CODE_INTERNAL, CODE_UNRESOLVED,
};
use gatesync_core::{GatewayRef, PluginRef, ResourceKey, ResourceKind, DEFAULT_GROUP};
use gatesync_store::{Owner, PluginUse, RevisionCache};
use serde_json::{json, Value};

fn key(name: &str) -> ResourceKey { ResourceKey::new(Some("edge"), name) }

fn request(kind: &str, op: Operation, name: &str, object: Option<Value>) -> AdmissionRequest {
    AdmissionRequest {
        uid: format!("uid-{}", name),
        kind: GroupVersionKind { group: DEFAULT_GROUP.into(), version: "v1alpha1".into(), kind: kind.into() },
        sub_resource: None,
        name: Some(name.into()),
        namespace: Some("edge".into()),
        operation: op,
        object,
        old_object: None,
    }
}

fn service(name: &str, gw: &str, listener: Option<&str>, paths: &[&str]) -> Value {
    json!({
        "metadata": {"name": name, "namespace": "edge"},
        "spec": {"gateway": {"name": gw, "listener": listener}, "contextPaths": paths, "upstream": "http://b"}
    })
}

/// Cache with plugin `auth`, secret `cert`, gateway `gw` (listeners http, https)
/// and service `svc1` on `gw/https` claiming `/a` and using `auth`.
fn populated() -> Arc<RevisionCache> {
    let cache = RevisionCache::new();
    cache.plugins.set_revision(&key("auth"), gatesync_core::PluginRevision::resolved(json!({"type": "jwt"}), Some(1)));
    cache.secrets.insert(&key("cert"));
    cache.gateways.set_gateway(&key("gw"), true, ["http".to_string(), "https".to_string()]);
    cache.services.set_service_enabled(&key("svc1"), true);
    cache.services.set_service_context_paths(&key("svc1"), ["/a"]);
    cache.services.set_service_gateway(&key("svc1"), GatewayRef { name: "gw".into(), listener: Some("https".into()) });
    cache
        .plugins
        .register_plugins_for(&Owner::service(key("svc1")), vec![PluginUse::unresolved(key("auth"), PluginRef::new("auth"))]);
    cache
}

struct Counting(Arc<AtomicU32>);

impl Validator for Counting {
    fn validate(&self, _: &ResourceKey, _: &AdmissionRequest) -> Decision {
        self.0.fetch_add(1, Ordering::SeqCst);
        Decision::deny(CODE_CONFLICT, "always")
    }
}

#[test]
fn foreign_group_is_a_structural_error() {
    let gate = AdmissionGate::standard(DEFAULT_GROUP, populated());
    let mut req = request("Service", Operation::Create, "svc9", Some(service("svc9", "gw", None, &["/z"])));
    req.kind.group = "networking.k8s.io".into();
    let d = gate.validate(&req);
    assert!(!d.allowed);
    assert_eq!(d.code, CODE_BAD_REQUEST);

    req.object = Some(json!("garbage"));
    assert_eq!(gate.validate(&req).code, CODE_BAD_REQUEST);
}

#[test]
fn status_updates_bypass_validators() {
    let calls = Arc::new(AtomicU32::new(0));
    let gate = AdmissionGate::new(DEFAULT_GROUP).with_validator(ResourceKind::Service, Box::new(Counting(calls.clone())));
    let mut req = request("Service", Operation::Update, "svc1", Some(json!({"status": {"ready": true}})));
    req.sub_resource = Some("status".into());
    assert_eq!(gate.validate(&req), Decision::allow());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    req.sub_resource = None;
    assert!(!gate.validate(&req).allowed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn unknown_kind_is_denied() {
    let gate = AdmissionGate::standard(DEFAULT_GROUP, populated());
    let d = gate.validate(&request("Route", Operation::Create, "r1", Some(json!({}))));
    assert_eq!(d.code, CODE_BAD_REQUEST);
}

#[test]
fn plugin_delete_blocked_while_in_use() {
    let cache = populated();
    let gate = AdmissionGate::standard(DEFAULT_GROUP, cache.clone());
    let d = gate.validate(&request("Plugin", Operation::Delete, "auth", None));
    assert_eq!(d.code, CODE_CONFLICT);
    assert!(d.message.unwrap_or_default().contains("edge/svc1"));

    cache.plugins.remove_plugins_used_by(&Owner::service(key("svc1")));
    assert!(gate.validate(&request("Plugin", Operation::Delete, "auth", None)).allowed);
    assert!(gate.validate(&request("Plugin", Operation::Delete, "unused", None)).allowed);
}

#[test]
fn plugin_payload_must_decode() {
    let gate = AdmissionGate::standard(DEFAULT_GROUP, populated());
    let ok = json!({"metadata": {"name": "cors"}, "spec": {"type": "cors"}});
    assert!(gate.validate(&request("Plugin", Operation::Create, "cors", Some(ok))).allowed);
    let bad = json!({"metadata": {"name": "cors"}, "spec": {"type": 5}});
    let d = gate.validate(&request("Plugin", Operation::Create, "cors", Some(bad)));
    assert_eq!(d.code, CODE_INTERNAL);
    let empty = json!({"metadata": {"name": "cors"}, "spec": {"type": " "}});
    assert_eq!(gate.validate(&request("Plugin", Operation::Create, "cors", Some(empty))).code, CODE_UNRESOLVED);
}

#[test]
fn service_create_requires_dependencies() {
    let gate = AdmissionGate::standard(DEFAULT_GROUP, populated());
    let mut svc = service("svc2", "gw", Some("http"), &["/b"]);
    svc["spec"]["plugins"] = json!([{"name": "auth"}]);
    svc["spec"]["secrets"] = json!(["cert"]);
    assert!(gate.validate(&request("Service", Operation::Create, "svc2", Some(svc.clone()))).allowed);

    svc["spec"]["plugins"] = json!([{"name": "missing"}]);
    let d = gate.validate(&request("Service", Operation::Create, "svc2", Some(svc.clone())));
    assert_eq!(d.code, CODE_UNRESOLVED);
    assert!(d.message.unwrap_or_default().contains("missing"));

    let nolistener = service("svc2", "gw", Some("grpc"), &["/b"]);
    assert_eq!(gate.validate(&request("Service", Operation::Create, "svc2", Some(nolistener))).code, CODE_UNRESOLVED);
    let nogw = service("svc2", "other", None, &["/b"]);
    assert_eq!(gate.validate(&request("Service", Operation::Create, "svc2", Some(nogw))).code, CODE_UNRESOLVED);
}

#[test]
fn service_context_path_conflicts() {
    let gate = AdmissionGate::standard(DEFAULT_GROUP, populated());
    let clash = service("svc2", "gw", None, &["/a/"]);
    assert_eq!(gate.validate(&request("Service", Operation::Create, "svc2", Some(clash))).code, CODE_CONFLICT);

    // Re-submitting the owner of the path is fine.
    let own = service("svc1", "gw", Some("https"), &["/a"]);
    assert!(gate.validate(&request("Service", Operation::Update, "svc1", Some(own))).allowed);

    let mut disabled = service("svc2", "gw", None, &["/a"]);
    disabled["spec"]["enabled"] = json!(false);
    assert!(gate.validate(&request("Service", Operation::Create, "svc2", Some(disabled))).allowed);

    assert!(gate.validate(&request("Service", Operation::Delete, "svc1", None)).allowed);
}

#[test]
fn gateway_rules() {
    let gate = AdmissionGate::standard(DEFAULT_GROUP, populated());
    let gw = |listeners: Value, plugins: Value| json!({"metadata": {"name": "gw"}, "spec": {"listeners": listeners, "plugins": plugins}});

    let keep_https = gw(json!([{"name": "https", "port": 443, "tlsSecret": "cert"}]), json!([{"name": "auth"}]));
    assert!(gate.validate(&request("Gateway", Operation::Update, "gw", Some(keep_https))).allowed);

    let drop_https = gw(json!([{"name": "http", "port": 80}]), json!([]));
    let d = gate.validate(&request("Gateway", Operation::Update, "gw", Some(drop_https)));
    assert_eq!(d.code, CODE_CONFLICT);
    assert!(d.message.unwrap_or_default().contains("https"));

    let dup = gw(json!([{"name": "http", "port": 80}, {"name": "http", "port": 81}]), json!([]));
    assert_eq!(gate.validate(&request("Gateway", Operation::Create, "gw2", Some(dup))).code, CODE_UNRESOLVED);

    let no_secret = gw(json!([{"name": "https", "port": 443, "tlsSecret": "nope"}]), json!([]));
    assert_eq!(gate.validate(&request("Gateway", Operation::Create, "gw2", Some(no_secret))).code, CODE_UNRESOLVED);

    assert_eq!(gate.validate(&request("Gateway", Operation::Delete, "gw", None)).code, CODE_CONFLICT);
    assert!(gate.validate(&request("Gateway", Operation::Delete, "idle", None)).allowed);
}

#[test]
fn review_round_trip_and_malformed_body() {
    let gate = AdmissionGate::standard(DEFAULT_GROUP, populated());
    let body = serde_json::to_vec(&AdmissionReview::request(request("Plugin", Operation::Delete, "auth", None)))
        .expect("encode");
    let out = gate.review(&body);
    let resp = out.response.expect("response");
    assert_eq!(resp.uid, "uid-auth");
    assert!(!resp.allowed);
    assert_eq!(resp.status.map(|s| s.code), Some(CODE_CONFLICT));

    let out = gate.review(b"{not json");
    let resp = out.response.expect("response");
    assert!(!resp.allowed);
    let status = resp.status.expect("status");
    assert_eq!(status.code, CODE_INTERNAL);
    assert!(!status.message.contains("not json"));

    let wire = json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "705ab4f5",
            "kind": {"group": "gatesync.io", "version": "v1alpha1", "kind": "Plugin"},
            "resource": {"group": "gatesync.io", "version": "v1alpha1", "resource": "plugins"},
            "subResource": "status",
            "name": "auth",
            "namespace": "edge",
            "operation": "UPDATE",
            "object": {"status": {}}
        }
    });
    let out = gate.review(wire.to_string().as_bytes());
    let encoded = serde_json::to_value(&out).expect("encode");
    assert_eq!(encoded["response"]["allowed"], json!(true));
    assert_eq!(encoded["response"]["uid"], json!("705ab4f5"));
    assert_eq!(encoded["apiVersion"], json!("admission.k8s.io/v1"));
}
