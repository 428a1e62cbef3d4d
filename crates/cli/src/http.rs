//! Webhook and introspection endpoints.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use gatesync_admission::{AdmissionGate, AdmissionReview};
use gatesync_controller::{Controller, SyncOrchestrator, SyncState};
use gatesync_reconcile::{RouteSnapshot, RouteTable};
use serde_json::{json, Value};

#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<AdmissionGate>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub routes: Arc<RouteTable>,
}

impl From<&Controller> for AppState {
    fn from(c: &Controller) -> Self {
        Self { gate: c.gate.clone(), orchestrator: c.orchestrator.clone(), routes: c.routes.clone() }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/validate", post(validate))
        .route("/healthz", get(healthz))
        .route("/routes", get(routes))
        .with_state(state)
}

/// Always answers 200; the verdict lives in the review body.
async fn validate(State(s): State<AppState>, body: Bytes) -> Json<AdmissionReview> { Json(s.gate.review(&body)) }

async fn healthz(State(s): State<AppState>) -> (StatusCode, Json<Value>) {
    let state = s.orchestrator.state();
    let enabled = s.orchestrator.is_enabled();
    let healthy = state == SyncState::Running || !enabled;
    let code = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(json!({ "state": state, "enabled": enabled })))
}

async fn routes(State(s): State<AppState>) -> Json<RouteSnapshot> { Json(RouteSnapshot::clone(&s.routes.snapshot())) }

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum_test::TestServer;
    use gatesync_admission::{AdmissionRequest, GroupVersionKind, Operation};
    use gatesync_controller::ControlPlane;
    use gatesync_core::ResourceKey;
    use gatesync_reconcile::GatewaySink;
    use gatesync_store::RevisionCache;
    use std::time::Duration;

    struct Idle;

    #[async_trait]
    impl ControlPlane for Idle {
        async fn probe(&self) -> anyhow::Result<()> { Ok(()) }
        async fn release(&self) {}
    }

    fn state(enabled: bool) -> AppState {
        AppState {
            gate: Arc::new(AdmissionGate::standard("gatesync.io", RevisionCache::new())),
            orchestrator: Arc::new(SyncOrchestrator::new(enabled, Duration::from_secs(5), Arc::new(Idle), Vec::new())),
            routes: RouteTable::new(),
        }
    }

    #[tokio::test]
    async fn validate_answers_with_review() {
        let server = TestServer::new(router(state(true))).unwrap();
        let review = AdmissionReview::request(AdmissionRequest {
            uid: "u1".into(),
            kind: GroupVersionKind { group: "other.io".into(), version: "v1".into(), kind: "Plugin".into() },
            sub_resource: None,
            name: Some("auth".into()),
            namespace: Some("edge".into()),
            operation: Operation::Create,
            object: None,
            old_object: None,
        });
        let response = server.post("/validate").json(&review).await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["response"]["uid"], json!("u1"));
        assert_eq!(body["response"]["allowed"], json!(false));
        assert_eq!(body["response"]["status"]["code"], json!(400));

        let response = server.post("/validate").text("not a review").await;
        let body: Value = response.json();
        assert_eq!(body["response"]["status"]["code"], json!(500));
    }

    #[tokio::test]
    async fn healthz_reflects_orchestrator_state() {
        let server = TestServer::new(router(state(true))).unwrap();
        let response = server.get("/healthz").await;
        assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.json::<Value>()["state"], json!("stopped"));

        let server = TestServer::new(router(state(false))).unwrap();
        assert_eq!(server.get("/healthz").await.status_code(), StatusCode::OK);
    }

    #[tokio::test]
    async fn routes_serializes_current_table() {
        let s = state(true);
        s.routes.remove_route(&ResourceKey::new(Some("edge"), "absent"));
        let server = TestServer::new(router(s)).unwrap();
        let body: Value = server.get("/routes").await.json();
        assert_eq!(body, json!({"plugins": {}, "gateways": {}, "routes": {}}));
    }
}
