
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use captcha_dispatch::api::{router, ApiState};
use captcha_dispatch::identity::{IdentityResolver, COOKIE_NAME, TOKEN_HEADER};
use captcha_dispatch::scheduler::WorkItem;
use captcha_dispatch::server::DispatchServer;
use test_harness::{item, test_server, FakeUpstream};

/// Router over a server whose pool was refreshed from `items`.
async fn create_test_app(items: Vec<WorkItem>) -> (Router, DispatchServer) {
    let server = test_server(FakeUpstream::with_items(items));
    server.refresh().await.unwrap();
    let state = ApiState {
        server: server.clone(),
        identity: IdentityResolver::new(Duration::from_secs(7 * 24 * 60 * 60)),
    };
    (router(state), server)
}

fn token() -> String {
    Uuid::new_v4().to_string()
}

async fn get_json(app: &Router, uri: &str, token: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(uri)
                .header(TOKEN_HEADER, token)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

async fn submit(app: &Router, token: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/submit-captcha")
                .header(TOKEN_HEADER, token)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _server) = create_test_app(Vec::new()).await;
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json, json!({ "ok": true }));
}

#[tokio::test]
async fn test_first_request_issues_cookie() {
    let (app, _server) = create_test_app(vec![item("a")]).await;
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/request-captcha")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .expect("token cookie issued")
        .to_str()
        .unwrap()
        .to_string();
    assert!(cookie.starts_with(&format!("{COOKIE_NAME}=")));
    assert!(cookie.contains("Max-Age=604800"));

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["success"], true);
    assert_eq!(json["sessionId"], "a");
    assert_eq!(json["captchaUrl"], "https://img.example/a.png");
    assert_eq!(json["instruction"], "Select all crosswalks");
}

#[tokio::test]
async fn test_cookie_identifies_returning_client() {
    let (app, _server) = create_test_app(vec![item("a"), item("b")]).await;
    let id = token();

    let request = || {
        Request::builder()
            .uri("/api/request-captcha")
            .header(header::COOKIE, format!("{COOKIE_NAME}={id}"))
            .body(Body::empty())
            .unwrap()
    };

    let first = app.clone().oneshot(request()).await.unwrap();
    assert!(first.headers().get(header::SET_COOKIE).is_none());
    let first = first.into_body().collect().await.unwrap().to_bytes();
    let second = app.oneshot(request()).await.unwrap();
    let second = second.into_body().collect().await.unwrap().to_bytes();

    let first: Value = serde_json::from_slice(&first).unwrap();
    let second: Value = serde_json::from_slice(&second).unwrap();
    assert_eq!(first["sessionId"], second["sessionId"]);
}

#[tokio::test]
async fn test_queue_position_endpoint() {
    let (app, _server) = create_test_app(Vec::new()).await;
    let (alice, bob) = (token(), token());

    let (_, json) = get_json(&app, "/api/queue-position", &alice).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["position"], -1);
    assert_eq!(json["queueLength"], 0);

    get_json(&app, "/api/request-captcha", &alice).await;
    get_json(&app, "/api/request-captcha", &bob).await;

    let (_, json) = get_json(&app, "/api/queue-position", &bob).await;
    assert_eq!(json["position"], 2);
    assert_eq!(json["queueLength"], 2);
}

#[tokio::test]
async fn test_submit_without_assignment() {
    let (app, _server) = create_test_app(Vec::new()).await;
    let (status, json) = submit(&app, &token(), json!({ "userAnswer": "x" })).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["success"], false);
    assert!(json["message"].as_str().unwrap().contains("No captcha assigned"));
}

#[tokio::test]
async fn test_submit_foreign_session_forbidden() {
    let (app, _server) = create_test_app(vec![item("a"), item("b")]).await;
    let (alice, bob) = (token(), token());
    let (_, alice_json) = get_json(&app, "/api/request-captcha", &alice).await;
    get_json(&app, "/api/request-captcha", &bob).await;

    let (status, json) = submit(
        &app,
        &bob,
        json!({ "userAnswer": "x", "sessionId": alice_json["sessionId"] }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["success"], false);
}

#[tokio::test]
async fn test_submit_rejects_bad_payloads() {
    let (app, _server) = create_test_app(vec![item("a")]).await;
    let alice = token();
    get_json(&app, "/api/request-captcha", &alice).await;

    let (status, json) = submit(&app, &alice, json!({ "userAnswer": "   " })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);

    let (status, json) = submit(&app, &alice, json!({ "answer": "wrong field" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);
}

#[tokio::test]
async fn test_status_endpoint() {
    let (app, _server) = create_test_app(vec![item("a")]).await;
    get_json(&app, "/api/request-captcha", &token()).await;
    get_json(&app, "/api/request-captcha", &token()).await;

    let (status, json) = get_json(&app, "/api/status", &token()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!({ "pooled": 0, "assigned": 1, "queued": 1 }));
}

/// One item in the pool: X gets it, Y waits, X finishes, Y keeps waiting.
#[tokio::test]
async fn test_single_item_scenario() {
    let (app, server) = create_test_app(vec![item("solo")]).await;
    let (x, y) = (token(), token());

    let (_, json) = get_json(&app, "/api/request-captcha", &x).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["sessionId"], "solo");
    assert!(json.get("position").is_none());

    let (_, json) = get_json(&app, "/api/request-captcha", &y).await;
    assert_eq!(json["success"], false);
    assert_eq!(json["position"], 1);
    assert_eq!(json["queueLength"], 1);

    let (status, json) = submit(
        &app,
        &x,
        json!({ "userAnswer": "bus", "sessionId": "solo" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["completed"], true);
    assert_eq!(json["verified"], true);
    assert_eq!(json["progress"], json!({ "step": 1, "total": 1 }));

    let stats = server.stats().await;
    assert_eq!(stats.pooled, 0);
    assert_eq!(stats.assigned, 0);

    let (_, json) = get_json(&app, "/api/request-captcha", &y).await;
    assert_eq!(json["success"], false);
    assert_eq!(json["position"], 1);
}
