use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use super::*;
use crate::config::Platform;
use crate::registry::RegisteredBot;
use crate::testutil::{harness, test_bot_config, MockRunner, TestHarness};

async fn read_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

fn state_for(h: &TestHarness, dir: &std::path::Path, secret: Option<&str>) -> ApiState {
    let registry = Arc::new(BotRegistry::new());
    registry.register(RegisteredBot {
        name: "testbot".into(),
        platform: Platform::Telegram,
        config: test_bot_config("testbot", &dir.join("work")),
        bridge: h.bridge.clone(),
        sender: h.sender.clone(),
    });
    let scheduler = TaskScheduler::new(
        registry.clone(),
        dir.join("scheduled-tasks.json"),
        "UTC".into(),
    );
    ApiState {
        registry,
        scheduler,
        costs: h.costs.clone(),
        metrics: h.metrics.clone(),
        secret: secret.map(str::to_string),
        bots_file: None,
        started_at: Instant::now(),
    }
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn health_reports_bots_and_tasks() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());
    let state = state_for(&h, tmp.path(), None);
    state.scheduler.schedule_task(crate::scheduler::ScheduleTaskRequest {
        bot_name: "testbot".into(),
        chat_id: "c1".into(),
        prompt: "later".into(),
        delay_seconds: 3600,
        send_cards: false,
        label: None,
    });
    let app = router(state.clone());

    let response = app
        .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["bots"], 1);
    assert_eq!(body["scheduledTasks"], 1);
    state.scheduler.destroy();
}

#[tokio::test(start_paused = true)]
async fn secret_gates_every_route() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());
    let state = state_for(&h, tmp.path(), Some("hunter2"));
    let app = router(state.clone());

    let response = app
        .clone()
        .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(
            Request::get("/api/health")
                .header(header::AUTHORIZATION, "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(
            Request::get("/api/health")
                .header(header::AUTHORIZATION, "Bearer hunter2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    state.scheduler.destroy();
}

#[tokio::test(start_paused = true)]
async fn run_task_executes_through_bridge() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());
    h.runner.push_script(MockRunner::quick_script("done"));
    let state = state_for(&h, tmp.path(), None);
    let app = router(state.clone());

    let response = app
        .oneshot(post_json(
            "/api/tasks",
            json!({"botName": "testbot", "chatId": "c1", "prompt": "do it"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["responseText"], "done");
    assert_eq!(h.runner.prompts(), vec!["do it"]);
    state.scheduler.destroy();
}

#[tokio::test(start_paused = true)]
async fn run_task_unknown_bot_is_404() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());
    let state = state_for(&h, tmp.path(), None);
    let app = router(state.clone());

    let response = app
        .oneshot(post_json(
            "/api/tasks",
            json!({"botName": "ghost", "chatId": "c1", "prompt": "x"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    state.scheduler.destroy();
}

#[tokio::test(start_paused = true)]
async fn schedule_one_time_then_cancel() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());
    let state = state_for(&h, tmp.path(), None);
    let app = router(state.clone());

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/schedule",
            json!({"botName": "testbot", "chatId": "c1", "prompt": "remind", "delaySeconds": 600}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = read_json(response).await;
    let id = body["task"]["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(Request::get("/api/schedule").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = read_json(response).await;
    assert_eq!(body["tasks"].as_array().unwrap().len(), 1);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/schedule/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/schedule/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    state.scheduler.destroy();
}

#[tokio::test(start_paused = true)]
async fn schedule_recurring_pause_resume() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());
    let state = state_for(&h, tmp.path(), None);
    let app = router(state.clone());

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/schedule",
            json!({
                "botName": "testbot", "chatId": "c1", "prompt": "news",
                "cronExpr": "0 8 * * *", "timezone": "UTC",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = read_json(response).await;
    let id = body["recurring"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["recurring"]["status"], "active");

    let response = app
        .clone()
        .oneshot(post_json(&format!("/api/schedule/{id}/pause"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["recurring"]["status"], "paused");

    let response = app
        .oneshot(post_json(&format!("/api/schedule/{id}/resume"), json!({})))
        .await
        .unwrap();
    let body = read_json(response).await;
    assert_eq!(body["recurring"]["status"], "active");
    state.scheduler.destroy();
}

#[tokio::test(start_paused = true)]
async fn bad_cron_is_400() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());
    let state = state_for(&h, tmp.path(), None);
    let app = router(state.clone());

    let response = app
        .oneshot(post_json(
            "/api/schedule",
            json!({"botName": "testbot", "chatId": "c1", "prompt": "x", "cronExpr": "nope"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    state.scheduler.destroy();
}

#[tokio::test(start_paused = true)]
async fn malformed_json_is_400() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());
    let state = state_for(&h, tmp.path(), None);
    let app = router(state.clone());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/schedule")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    state.scheduler.destroy();
}

#[tokio::test(start_paused = true)]
async fn oversized_body_is_413() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());
    let state = state_for(&h, tmp.path(), None);
    let app = router(state.clone());

    let huge = "x".repeat(2 * 1024 * 1024);
    let response = app
        .oneshot(post_json(
            "/api/schedule",
            json!({"botName": "testbot", "chatId": "c1", "prompt": huge, "delaySeconds": 60}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    state.scheduler.destroy();
}

#[tokio::test(start_paused = true)]
async fn unknown_route_is_404() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());
    let state = state_for(&h, tmp.path(), None);
    let app = router(state.clone());

    let response = app
        .oneshot(Request::get("/api/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    state.scheduler.destroy();
}

#[tokio::test(start_paused = true)]
async fn metrics_exposition_is_plaintext() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());
    h.metrics.inc_counter("metabot_tasks_total", &[]);
    let state = state_for(&h, tmp.path(), None);
    let app = router(state.clone());

    let response = app
        .oneshot(Request::get("/api/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/plain"));
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("metabot_tasks_total 1"));
    state.scheduler.destroy();
}

#[tokio::test(start_paused = true)]
async fn stats_returns_cost_snapshot() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path());
    h.costs.record("testbot", "u1", true, 0.05, 1200);
    let state = state_for(&h, tmp.path(), None);
    let app = router(state.clone());

    let response = app
        .oneshot(Request::get("/api/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = read_json(response).await;
    assert_eq!(body["byBot"]["testbot"]["totalTasks"], 1);
    assert_eq!(body["global"]["completedTasks"], 1);
    state.scheduler.destroy();
}
