use std::sync::Arc;

use autoheal_core::ledger::AttemptDb;
use autoheal_core::types::{AttemptOutcome, ExtractedFields, FixAttempt, Incident, IncidentId, SourceKind};
use autoheal_server::feedback::LoopState;
use autoheal_server::state::{AppState, StatusBoard};
use axum::http::StatusCode;
use http_body_util::BodyExt;
use tempfile::TempDir;
use tokio::sync::watch;
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn app_state(ledger: Option<Arc<AttemptDb>>) -> (AppState, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    (AppState::new(StatusBoard::default(), ledger, Arc::new(tx)), rx)
}

/// Send a GET request via `oneshot` and return (status, parsed JSON body).
async fn get(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Send an empty POST request via `oneshot` and return (status, parsed JSON body).
async fn post(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

fn oom_incident(pod: &str) -> Incident {
    Incident::new(
        "cluster",
        format!("pod={pod} namespace=ns1 container=c1 OOMKilled"),
        ExtractedFields::Orchestrator {
            namespace: "ns1".into(),
            pod: pod.into(),
            container: "c1".into(),
            reason: "OOMKilled".into(),
        },
        None,
    )
}

fn attempt(incident: &str, n: u32, outcome: AttemptOutcome) -> FixAttempt {
    let mut a = FixAttempt::begin(IncidentId::new(incident), n, "container exceeded its memory limit");
    a.outcome = outcome;
    a
}

fn ledger(dir: &TempDir) -> Arc<AttemptDb> {
    let db = AttemptDb::open(&dir.path().join(".autoheal/attempts.redb")).unwrap();
    db.record(&attempt("orchestrator:ns1/p1/c1", 1, AttemptOutcome::Failed)).unwrap();
    db.record(&attempt("warehouse:DB.S.T", 1, AttemptOutcome::Success)).unwrap();
    db.record(&attempt("orchestrator:ns1/p1/c1", 2, AttemptOutcome::Success)).unwrap();
    Arc::new(db)
}

// ---------------------------------------------------------------------------
// Health and status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_is_ok() {
    let (state, _rx) = app_state(None);
    let (status, body) = get(autoheal_server::build_router(state), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn status_reports_sources_and_active_incidents() {
    let (state, _rx) = app_state(None);
    state
        .status
        .register_source("cluster", SourceKind::Orchestrator, "log_file");
    state.status.poll_succeeded("cluster", 2);
    let inc = oom_incident("p1");
    state.status.incident_detected(&inc);
    state.status.transition(&inc, LoopState::Remediating, 1);

    let (status, body) = get(autoheal_server::build_router(state), "/api/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stopping"], false);
    assert_eq!(body["sources"][0]["id"], "cluster");
    assert_eq!(body["sources"][0]["health"], "healthy");
    assert_eq!(body["sources"][0]["records"], 2);
    assert_eq!(body["active"][0]["id"], "orchestrator:ns1/p1/c1");
    assert_eq!(body["active"][0]["state"], "remediating");
    assert_eq!(body["counters"]["incidents"], 1);
}

#[tokio::test]
async fn stop_flips_the_shutdown_signal() {
    let (state, rx) = app_state(None);
    let (status, body) = post(autoheal_server::build_router(state.clone()), "/api/stop").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["stopping"], true);
    assert!(*rx.borrow());

    let (_, body) = get(autoheal_server::build_router(state), "/api/status").await;
    assert_eq!(body["stopping"], true);
}

// ---------------------------------------------------------------------------
// Attempts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn attempts_without_ledger_is_empty() {
    let (state, _rx) = app_state(None);
    let (status, body) = get(autoheal_server::build_router(state), "/api/attempts").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!([]));
}

#[tokio::test]
async fn attempts_are_newest_first() {
    let dir = TempDir::new().unwrap();
    let (state, _rx) = app_state(Some(ledger(&dir)));
    let (status, body) = get(autoheal_server::build_router(state), "/api/attempts?limit=2").await;
    assert_eq!(status, StatusCode::OK);
    let list = body.as_array().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["incident_id"], "orchestrator:ns1/p1/c1");
    assert_eq!(list[0]["attempt"], 2);
    assert_eq!(list[1]["incident_id"], "warehouse:DB.S.T");
}

#[tokio::test]
async fn attempts_filter_by_incident() {
    let dir = TempDir::new().unwrap();
    let (state, _rx) = app_state(Some(ledger(&dir)));
    let (status, body) = get(
        autoheal_server::build_router(state),
        "/api/attempts?incident=orchestrator:ns1/p1/c1",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let attempts: Vec<u64> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["attempt"].as_u64().unwrap())
        .collect();
    assert_eq!(attempts, vec![2, 1]);
}

#[tokio::test]
async fn attempts_reject_zero_limit() {
    let (state, _rx) = app_state(None);
    let (status, body) = get(autoheal_server::build_router(state), "/api/attempts?limit=0").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("limit"));
}

// ---------------------------------------------------------------------------
// Serving
// ---------------------------------------------------------------------------

#[tokio::test]
async fn serve_on_stops_on_shutdown() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (state, rx) = app_state(None);
    let server = tokio::spawn(autoheal_server::serve_on(listener, state.clone(), rx));
    state.request_shutdown();
    tokio::time::timeout(std::time::Duration::from_secs(5), server)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
}
