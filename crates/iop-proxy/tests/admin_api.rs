//! Admin API behavior against a real router and state store.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use tower::ServiceExt;

use iop_common::api::{ApiResponse, HealthStatus, RouteSummary, StatusResponse};
use iop_proxy::acme::{AcmeController, ChallengeMap};
use iop_proxy::admin::{AdminState, router};
use iop_proxy::health::HealthMonitor;
use iop_proxy::state::StateStore;
use iop_proxy::tls::CertStore;

async fn test_router(dir: &tempfile::TempDir) -> Router {
    let store = StateStore::open(dir.path().join("state.json")).await.unwrap();
    let certs = Arc::new(CertStore::new(dir.path().join("certs")));
    let challenges = Arc::new(ChallengeMap::new());
    let acme = AcmeController::new(
        store.clone(),
        certs,
        challenges,
        dir.path().join("acme/account.key"),
        None,
    );
    let monitor = HealthMonitor::new(store.clone()).unwrap();
    router(AdminState {
        store,
        acme,
        monitor,
    })
}

fn post_json(path: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

async fn body_json<T: serde::de::DeserializeOwned>(
    response: axum::http::Response<Body>,
) -> ApiResponse<T> {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

const UPSERT: &str =
    r#"{"host":"Demo.Example","target":"demo-web:3000","project":"demo","ssl":false}"#;

#[tokio::test]
async fn upsert_then_get_returns_the_target() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(&dir).await;

    let response = app
        .clone()
        .oneshot(post_json("/api/hosts", UPSERT))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let created: RouteSummary = body_json(response).await.into_result().unwrap();
    assert_eq!(created.host, "demo.example");
    assert_eq!(created.health, HealthStatus::Unknown);

    let response = app.oneshot(get("/api/hosts")).await.unwrap();
    let routes: Vec<RouteSummary> = body_json(response).await.into_result().unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].target, "demo-web:3000");
}

#[tokio::test]
async fn delete_then_get_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(&dir).await;

    app.clone()
        .oneshot(post_json("/api/hosts", UPSERT))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/hosts/demo.example")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.clone().oneshot(get("/api/hosts")).await.unwrap();
    let routes: Vec<RouteSummary> = body_json(response).await.into_result().unwrap();
    assert!(routes.is_empty());

    // Deleting again reports unknown host.
    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/hosts/demo.example")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn host_collision_across_projects_is_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(&dir).await;

    app.clone()
        .oneshot(post_json("/api/hosts", UPSERT))
        .await
        .unwrap();

    let other =
        r#"{"host":"demo.example","target":"other-api:8000","project":"other","ssl":false}"#;
    let response = app.oneshot(post_json("/api/hosts", other)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn health_update_for_unknown_host_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(&dir).await;

    let response = app
        .oneshot(post_json(
            "/api/hosts/ghost.example/health",
            r#"{"status":"healthy"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_update_is_visible_in_status() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(&dir).await;

    app.clone()
        .oneshot(post_json("/api/hosts", UPSERT))
        .await
        .unwrap();
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/hosts/demo.example/health",
            r#"{"status":"healthy"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/api/status")).await.unwrap();
    let status: StatusResponse = body_json(response).await.into_result().unwrap();
    assert_eq!(status.routes[0].health, HealthStatus::Healthy);
}

#[tokio::test]
async fn invalid_target_is_rejected_without_state_change() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(&dir).await;

    let bad = r#"{"host":"demo.example","target":"no-port","project":"demo"}"#;
    let response = app
        .clone()
        .oneshot(post_json("/api/hosts", bad))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app.oneshot(get("/api/hosts")).await.unwrap();
    let routes: Vec<RouteSummary> = body_json(response).await.into_result().unwrap();
    assert!(routes.is_empty());
}

#[tokio::test]
async fn staging_toggle_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(&dir).await;

    let response = app.clone().oneshot(get("/api/status")).await.unwrap();
    let status: StatusResponse = body_json(response).await.into_result().unwrap();
    assert!(!status.staging);

    let response = app
        .clone()
        .oneshot(post_json("/api/staging", r#"{"staging":true}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/api/status")).await.unwrap();
    let status: StatusResponse = body_json(response).await.into_result().unwrap();
    assert!(status.staging);
}

#[tokio::test]
async fn ssl_route_gets_a_certificate_record() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(&dir).await;

    let ssl = r#"{"host":"secure.example","target":"demo-web:3000","project":"demo","ssl":true}"#;
    let response = app.clone().oneshot(post_json("/api/hosts", ssl)).await.unwrap();
    let created: RouteSummary = body_json(response).await.into_result().unwrap();
    let cert = created.cert.expect("ssl route carries a cert record");
    assert_eq!(cert.state, iop_common::api::CertState::None);
}
