//! End-to-end tests over the HTTP router with an embedded store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use kvbus::server;
use kvbus::service::Service;
use kvbus::store::MemoryStore;

fn app() -> Router {
    server::router(Arc::new(Service::new(MemoryStore::new())))
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(value) => builder
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn payloads(messages: &Value) -> Vec<String> {
    messages
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["payload"].as_str().unwrap().to_owned())
        .collect()
}

fn ids(value: &Value) -> Vec<String> {
    value
        .as_array()
        .unwrap()
        .iter()
        .map(|id| id.as_str().unwrap().to_owned())
        .collect()
}

#[tokio::test]
async fn normal_round() {
    let app = app();

    let (status, body) = call(&app, "PUT", "/v1/topics/t", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "t");

    let (status, body) = call(
        &app,
        "POST",
        "/v1/messages/topics/t",
        Some(json!({"messages": ["h"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ids(&body).len(), 1);

    let (status, sub) = call(&app, "PUT", "/v1/subscriptions/t/s", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sub["name"], "s");

    let digits: Vec<String> = (0..10).map(|i| i.to_string()).collect();
    let (status, body) = call(
        &app,
        "POST",
        "/v1/messages/topics/t",
        Some(json!({ "messages": digits })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let digit_ids = ids(&body);
    assert_eq!(digit_ids.len(), 10);

    // Defaults. The cursor was initialised at subscribe time, so only the
    // batch published after the subscription is visible.
    let (status, body) = call(&app, "POST", "/v1/subscriptions/t/s", Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payloads(&body), digits);

    // Explicit resume point just after "0".
    let (status, body) = call(
        &app,
        "POST",
        "/v1/subscriptions/t/s",
        Some(json!({"autoACK": true, "offset": digit_ids[0], "limit": 3})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payloads(&body), vec!["1", "2", "3"]);

    let (status, _) = call(
        &app,
        "POST",
        &format!("/v1/messages/ack/t/s/{}", digit_ids[3]),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(
        &app,
        "POST",
        "/v1/subscriptions/t/s",
        Some(json!({"limit": 3, "autoACK": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payloads(&body), vec!["4", "5", "6"]);

    let (status, body) = call(&app, "PUT", "/v1/snapshots/t/s/snap", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "snap");

    let (status, body) = call(
        &app,
        "POST",
        "/v1/subscriptions/t/s",
        Some(json!({"limit": 3, "autoACK": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payloads(&body), vec!["7", "8", "9"]);

    // Seek back to the snapshot: acked returns to the offset of "6".
    let (status, body) = call(&app, "POST", "/v1/snapshots/t/s/snap", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["acked"]["index"], 6);

    let (status, body) = call(
        &app,
        "POST",
        "/v1/subscriptions/t/s",
        Some(json!({"limit": 3, "autoACK": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payloads(&body), vec!["7", "8", "9"]);

    // Drained: an explicit short timeout keeps the long-poll from blocking.
    let (status, body) = call(
        &app,
        "POST",
        "/v1/subscriptions/t/s",
        Some(json!({"limit": 3, "timeout": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 0);

    let (status, _) = call(&app, "DELETE", "/v1/snapshots/t/s/snap", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(&app, "DELETE", "/v1/topics/t", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn not_found_surfaces() {
    let app = app();

    let (status, body) = call(
        &app,
        "POST",
        "/v1/messages/topics/missing",
        Some(json!({"messages": ["m"]})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["reason"].as_str().unwrap().contains("not found"));

    let (status, _) = call(&app, "GET", "/v1/topics/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, "PUT", "/v1/subscriptions/missing/s", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, "DELETE", "/v1/snapshots/missing/s/snap", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Snapshot deletion under an existing topic but missing subscription.
    let (status, _) = call(&app, "PUT", "/v1/topics/t", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call(&app, "DELETE", "/v1/snapshots/t/missing/snap", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["reason"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn long_poll_returns_on_late_publish() {
    let app = app();

    call(&app, "PUT", "/v1/topics/t", None).await;
    call(&app, "PUT", "/v1/subscriptions/t/s", None).await;

    let publisher = app.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        call(
            &publisher,
            "POST",
            "/v1/messages/topics/t",
            Some(json!({"messages": ["late"]})),
        )
        .await;
    });

    let started = Instant::now();
    let (status, body) = call(
        &app,
        "POST",
        "/v1/subscriptions/t/s",
        Some(json!({"timeout": 10})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payloads(&body), vec!["late"]);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn recreated_topic_has_fresh_keyspace() {
    let app = app();

    call(&app, "PUT", "/v1/topics/t", None).await;
    let (status, body) = call(
        &app,
        "POST",
        "/v1/messages/topics/t",
        Some(json!({"messages": ["old"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ids(&body).len(), 1);

    let (status, _) = call(&app, "DELETE", "/v1/topics/t", None).await;
    assert_eq!(status, StatusCode::OK);

    call(&app, "PUT", "/v1/topics/t", None).await;
    call(&app, "PUT", "/v1/subscriptions/t/s", None).await;

    let (status, body) = call(
        &app,
        "POST",
        "/v1/subscriptions/t/s",
        Some(json!({"timeout": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn validation_failures_are_bad_requests() {
    let app = app();
    call(&app, "PUT", "/v1/topics/t", None).await;
    call(&app, "PUT", "/v1/subscriptions/t/s", None).await;

    let (status, body) = call(
        &app,
        "POST",
        "/v1/messages/topics/t",
        Some(json!({"messages": []})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["reason"].as_str().unwrap().contains("empty"));

    let (status, _) = call(&app, "POST", "/v1/messages/topics/t", Some(json!("junk"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(
        &app,
        "POST",
        "/v1/subscriptions/t/s",
        Some(json!({"offset": "not-an-offset"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["reason"]
        .as_str()
        .unwrap()
        .contains("invalid argument"));

    let (status, _) = call(
        &app,
        "POST",
        &format!("/v1/messages/ack/t/s/{}", "bogus"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_route_returns_json_reason() {
    let app = app();
    let (status, body) = call(&app, "GET", "/v2/nothing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["reason"].as_str().is_some());
}

#[tokio::test]
async fn metrics_endpoint_renders() {
    let status_app = server::status_router();
    let app = app();

    // Produce some traffic so the histograms exist.
    call(&app, "PUT", "/v1/topics/t", None).await;

    let response = status_app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("kvbus_topics_opt_seconds"));
}
