//! Admin and producer HTTP API tests, driven through the router without
//! binding a socket.

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use anchor_event_relay::config::{ChannelConfig, Settings};
use anchor_event_relay::dispatch::WorkerStats;
use anchor_event_relay::server::{create_app, AppState};
use anchor_event_relay::service::{EventService, Transports};

struct TestApp {
    router: Router,
    service: Arc<EventService>,
}

fn test_app(api_key: Option<&str>) -> TestApp {
    let mut settings = Settings::default();
    settings.events.read_timeout_ms = 0;
    settings.api.key = api_key.map(str::to_string);
    settings
        .events
        .channels
        .insert("payments".to_string(), ChannelConfig::default());
    let settings = Arc::new(settings);

    let service = Arc::new(EventService::new(&settings, Transports::default()));
    let state = AppState::new(settings, service.clone())
        .with_workers(vec![Arc::new(WorkerStats::new("payments"))]);

    TestApp {
        router: create_app(state),
        service,
    }
}

fn publish_request(channel: &str, body: Value, api_key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("/api/v1/events/{}", channel))
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(key) = api_key {
        builder = builder.header("X-API-Key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_reports_sessions_and_workers() {
    let app = test_app(None);
    app.service.session("payments").await.unwrap();

    let response = app
        .router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["events_enabled"], true);
    assert_eq!(body["sessions"][0]["name"], "payments");
    assert_eq!(body["sessions"][0]["transport"], "memory");
    assert_eq!(body["workers"][0]["channel"], "payments");
    assert_eq!(body["workers"][0]["state"], "idle");
}

#[tokio::test]
async fn test_stats_totals() {
    let app = test_app(None);

    let response = app
        .router
        .oneshot(Request::get("/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["totals"]["events_acked"], 0);
    assert_eq!(body["workers"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_metrics_endpoint_serves_prometheus_text() {
    let app = test_app(None);

    let response = app
        .router
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("anchor_events_worker_state"));
}

#[tokio::test]
async fn test_publish_event_into_channel() {
    let app = test_app(None);

    let response = app
        .router
        .oneshot(publish_request(
            "payments",
            json!({"type": "transaction_created", "id": "evt-1", "payload": {"amount": "10"}}),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let body = json_body(response).await;
    assert_eq!(body["id"], "evt-1");
    assert_eq!(body["channel"], "payments");
    assert_eq!(body["transport"], "memory");

    let session = app.service.session("payments").await.unwrap();
    let response = session.read().await.unwrap().unwrap();
    let event = &response.events()[0];
    assert_eq!(event.id(), "evt-1");
    assert_eq!(event.event_type(), "transaction_created");
    assert_eq!(event.payload()["amount"], "10");
    assert_eq!(event.source(), Some("http-api"));
}

#[tokio::test]
async fn test_publish_generates_id_when_absent() {
    let app = test_app(None);

    let response = app
        .router
        .oneshot(publish_request("payments", json!({"type": "quote_created"}), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let body = json_body(response).await;
    assert!(!body["id"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_publish_to_unknown_channel_is_not_found() {
    let app = test_app(None);

    let response = app
        .router
        .oneshot(publish_request("audit", json!({"type": "quote_created"}), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "CHANNEL_NOT_AVAILABLE");
}

#[tokio::test]
async fn test_publish_rejects_empty_type() {
    let app = test_app(None);

    let response = app
        .router
        .oneshot(publish_request("payments", json!({"type": " "}), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_publish_requires_configured_api_key() {
    let app = test_app(Some("producer-key"));

    let response = app
        .router
        .clone()
        .oneshot(publish_request("payments", json!({"type": "quote_created"}), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .router
        .clone()
        .oneshot(publish_request(
            "payments",
            json!({"type": "quote_created"}),
            Some("wrong-key"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .router
        .oneshot(publish_request(
            "payments",
            json!({"type": "quote_created"}),
            Some("producer-key"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}
