mod common;

use std::sync::Arc;

use axum_test::TestServer;
use common::{settings, ScriptedGateway};
use flowcast::cache::{CacheLimits, ResponseCache};
use flowcast::gateway::GatewayError;
use flowcast::web_server::{router, AppState, SessionLimits};
use flowcast::Pipeline;
use serde_json::{json, Value};

fn state(dir: &std::path::Path, gateway: Arc<ScriptedGateway>) -> AppState {
    let settings = settings(dir);
    let cache = ResponseCache::open(&settings.cache_dir, CacheLimits::default()).unwrap();
    let pipeline = Arc::new(Pipeline::new(&settings, gateway, Arc::new(cache)));
    AppState::new(pipeline, &settings).unwrap()
}

fn server_with(dir: &std::path::Path, state: AppState) -> TestServer {
    TestServer::new(router(state, &settings(dir))).unwrap()
}

fn server(dir: &std::path::Path, gateway: Arc<ScriptedGateway>) -> TestServer {
    server_with(dir, state(dir, gateway))
}

#[tokio::test]
async fn test_index_page_renders() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(dir.path(), ScriptedGateway::new(vec![]));
    let response = server.get("/").await;
    response.assert_status_ok();
    let html = response.text();
    assert!(html.contains("<title>flowcast</title>"));
    assert!(html.contains("llama2"));
}

#[tokio::test]
async fn test_health_reports_cache() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(dir.path(), ScriptedGateway::new(vec![]));
    let body: Value = server.get("/api/health").await.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["cache"]["entries"], 0);
}

#[test_log::test(tokio::test)]
async fn test_diagram_round_trip_and_artifact_download() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = ScriptedGateway::new(vec![Ok("Start -> Load data -> End")]);
    let server = server(dir.path(), gateway);

    let response = server
        .post("/api/diagram")
        .json(&json!({"prompt": "a loading flow"}))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();

    assert_eq!(body["cache_hit"], false);
    assert_eq!(body["spec"]["nodes"].as_array().unwrap().len(), 3);
    assert!(body["session_id"].as_str().is_some());
    let artifacts = body["artifacts"].as_array().unwrap();
    assert_eq!(artifacts.len(), 2);

    let svg = artifacts
        .iter()
        .find(|a| a["format"] == "svg")
        .and_then(|a| a["url"].as_str())
        .unwrap();
    let download = server.get(svg).await;
    download.assert_status_ok();
    assert!(download.text().starts_with("<svg"));

    // Same prompt in the same session is served from the cache.
    let again: Value = server
        .post("/api/diagram")
        .json(&json!({"prompt": "a loading flow", "session_id": body["session_id"]}))
        .await
        .json();
    assert_eq!(again["cache_hit"], true);
    assert_eq!(again["session_id"], body["session_id"]);
}

#[tokio::test]
async fn test_error_statuses() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = ScriptedGateway::new(vec![
        Err(GatewayError::NonSuccessStatus {
            status: 500,
            body: "boom".to_string(),
        }),
        Ok("Nothing useful here."),
    ]);
    let server = server(dir.path(), gateway);

    let empty = server
        .post("/api/diagram")
        .json(&json!({"prompt": "   "}))
        .expect_failure()
        .await;
    assert_eq!(empty.status_code().as_u16(), 400);

    let upstream = server
        .post("/api/diagram")
        .json(&json!({"prompt": "first"}))
        .expect_failure()
        .await;
    assert_eq!(upstream.status_code().as_u16(), 502);
    let body: Value = upstream.json();
    assert_eq!(body["stage"], "gateway");

    let unparsable = server
        .post("/api/diagram")
        .json(&json!({"prompt": "second"}))
        .expect_failure()
        .await;
    assert_eq!(unparsable.status_code().as_u16(), 422);
    assert_eq!(unparsable.json::<Value>()["stage"], "parse");
}

#[tokio::test]
async fn test_unknown_session_id_is_not_adopted() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path(), ScriptedGateway::new(vec![Ok("A -> B")]));
    let server = server_with(dir.path(), state.clone());

    let body: Value = server
        .post("/api/diagram")
        .json(&json!({"prompt": "ab", "session_id": "made-up"}))
        .await
        .json();
    assert_ne!(body["session_id"], "made-up");
    assert_eq!(state.session_count().await, 1);
}

#[tokio::test]
async fn test_sessions_are_capped_and_expire() {
    let dir = tempfile::tempdir().unwrap();
    let limits = SessionLimits {
        max_sessions: 2,
        idle_ttl: std::time::Duration::from_millis(200),
    };
    let state = state(dir.path(), ScriptedGateway::new(vec![Ok("A -> B")])).with_session_limits(limits);
    let server = server_with(dir.path(), state.clone());

    let mut ids = Vec::new();
    for _ in 0..3 {
        let body: Value = server.post("/api/diagram").json(&json!({"prompt": "ab"})).await.json();
        ids.push(body["session_id"].as_str().unwrap().to_string());
    }
    assert_eq!(state.session_count().await, 2);

    // The most recent session is still known.
    let again: Value = server
        .post("/api/diagram")
        .json(&json!({"prompt": "ab", "session_id": ids[2]}))
        .await
        .json();
    assert_eq!(again["session_id"], ids[2].as_str());

    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    let later: Value = server
        .post("/api/diagram")
        .json(&json!({"prompt": "ab", "session_id": ids[2]}))
        .await
        .json();
    assert_ne!(later["session_id"], ids[2].as_str());
    assert_eq!(state.session_count().await, 1);
}
