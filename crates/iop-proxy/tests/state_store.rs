//! State snapshot durability and recovery.

use iop_common::api::{CertState, HealthStatus, IssuerMode};
use iop_proxy::state::{CertRecord, ProxyState, RouteRecord, SCHEMA_VERSION, StateStore};

fn demo_route() -> RouteRecord {
    RouteRecord {
        target: "demo-web:3000".to_string(),
        project: "demo".to_string(),
        health_path: "/up".to_string(),
        ssl: true,
        health: HealthStatus::Healthy,
        request_timeout_secs: Some(60),
    }
}

#[tokio::test]
async fn full_document_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let store = StateStore::open(path.clone()).await.unwrap();
    store
        .mutate(|state| {
            state.staging = true;
            state.routes.insert("demo.example".to_string(), demo_route());
            let mut cert = CertRecord::new(IssuerMode::Staging);
            cert.state = CertState::Acquiring;
            cert.attempts = 3;
            cert.last_error = Some("rate limited".to_string());
            state.certs.insert("demo.example".to_string(), cert);
        })
        .await
        .unwrap();

    let reopened = StateStore::open(path).await.unwrap();
    reopened
        .read(|state| {
            assert!(state.staging);
            assert_eq!(state.schema_version, SCHEMA_VERSION);

            let route = &state.routes["demo.example"];
            assert_eq!(route.target, "demo-web:3000");
            assert_eq!(route.health, HealthStatus::Healthy);
            assert_eq!(route.request_timeout_secs, Some(60));

            let cert = &state.certs["demo.example"];
            assert_eq!(cert.state, CertState::Acquiring);
            assert_eq!(cert.attempts, 3);
            assert_eq!(cert.last_error.as_deref(), Some("rate limited"));
        })
        .await;
}

#[tokio::test]
async fn leftover_temp_file_does_not_shadow_the_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let store = StateStore::open(path.clone()).await.unwrap();
    store
        .mutate(|state| {
            state.routes.insert("demo.example".to_string(), demo_route());
        })
        .await
        .unwrap();

    // Simulate a crash between temp write and rename.
    tokio::fs::write(path.with_extension("json.tmp"), b"garbage from a dying process")
        .await
        .unwrap();

    let reopened = StateStore::open(path).await.unwrap();
    let count = reopened.read(|state| state.routes.len()).await;
    assert_eq!(count, 1);
}

#[tokio::test]
async fn future_schema_versions_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let mut doc = ProxyState::empty();
    doc.schema_version = SCHEMA_VERSION + 1;
    tokio::fs::write(&path, serde_json::to_vec(&doc).unwrap())
        .await
        .unwrap();

    let err = StateStore::open(path).await.unwrap_err();
    assert!(err.to_string().contains("schema version"));
}

#[tokio::test]
async fn reads_observe_writes_before_any_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path().join("state.json")).await.unwrap();

    store
        .mutate(|state| {
            state.routes.insert("a.example".to_string(), demo_route());
        })
        .await
        .unwrap();
    store
        .mutate(|state| {
            state
                .routes
                .get_mut("a.example")
                .expect("just inserted")
                .target = "demo-api:8000".to_string();
        })
        .await
        .unwrap();

    let target = store
        .read(|state| state.routes["a.example"].target.clone())
        .await;
    assert_eq!(target, "demo-api:8000");
}
