//! CallbackApiClient against a local axum server standing in for the
//! anchor's callback API.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use chrono::{TimeZone, Utc};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use anchor_event_relay::callback::{
    CallbackApiClient, CallbackClaims, CallbackSink, SendEventRequest, SinkError,
};
use anchor_event_relay::config::{CallbackApiConfig, CallbackAuthConfig, CallbackAuthType};
use anchor_event_relay::event::AnchorEvent;
use anchor_event_relay::handler::{CallbackApiEventHandler, EventHandler, HandlerOutcome};

#[derive(Clone)]
struct Endpoint {
    status: StatusCode,
    delay: Duration,
    requests: Arc<Mutex<Vec<(HeaderMap, Value)>>>,
}

async fn receive_event(
    State(endpoint): State<Endpoint>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, &'static str) {
    endpoint.requests.lock().unwrap().push((headers, body));
    tokio::time::sleep(endpoint.delay).await;
    let body = if endpoint.status.is_success() {
        "ok"
    } else {
        "transaction not found"
    };
    (endpoint.status, body)
}

/// Serve `/callbacks/event` on an ephemeral port; returns the base url.
async fn spawn_endpoint(endpoint: Endpoint) -> String {
    let app = Router::new()
        .route("/callbacks/event", post(receive_event))
        .with_state(endpoint);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/callbacks", addr)
}

fn endpoint(status: StatusCode) -> Endpoint {
    Endpoint {
        status,
        delay: Duration::ZERO,
        requests: Arc::new(Mutex::new(Vec::new())),
    }
}

fn config(base_url: String, auth: CallbackAuthConfig) -> CallbackApiConfig {
    CallbackApiConfig {
        enabled: true,
        base_url,
        timeout_ms: 2_000,
        auth,
    }
}

fn request() -> SendEventRequest {
    let event = AnchorEvent::builder("transaction_created")
        .id("evt-1")
        .created_at(Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap())
        .payload(json!({"transaction_id": "tx-1", "amount_in": "100"}))
        .build();
    SendEventRequest::from(&event)
}

#[tokio::test]
async fn test_accepted_event_posts_wire_format() {
    let endpoint = endpoint(StatusCode::OK);
    let requests = endpoint.requests.clone();
    let base_url = spawn_endpoint(endpoint).await;

    let client = CallbackApiClient::new(&config(base_url, CallbackAuthConfig::default())).unwrap();
    client.send_event(&request()).await.unwrap();

    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let (headers, body) = &requests[0];
    assert!(headers.get("authorization").is_none());
    assert_eq!(body["id"], "evt-1");
    assert_eq!(body["type"], "transaction_created");
    assert_eq!(body["timestamp"], "2024-03-01T12:30:00Z");
    assert_eq!(body["payload"]["transaction_id"], "tx-1");
}

#[tokio::test]
async fn test_non_success_status_is_reported() {
    let base_url = spawn_endpoint(endpoint(StatusCode::UNPROCESSABLE_ENTITY)).await;

    let client = CallbackApiClient::new(&config(base_url, CallbackAuthConfig::default())).unwrap();
    let err = client.send_event(&request()).await.unwrap_err();

    match err {
        SinkError::HttpStatus { status, body } => {
            assert_eq!(status, 422);
            assert_eq!(body, "transaction not found");
        }
        other => panic!("expected HttpStatus, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_endpoint_is_connection_refused() {
    // Bind then drop to get a port nothing listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = CallbackApiClient::new(&config(
        format!("http://{}", addr),
        CallbackAuthConfig::default(),
    ))
    .unwrap();
    let err = client.send_event(&request()).await.unwrap_err();

    assert!(matches!(err, SinkError::ConnectionRefused(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_slow_endpoint_times_out() {
    let mut slow = endpoint(StatusCode::OK);
    slow.delay = Duration::from_secs(5);
    let base_url = spawn_endpoint(slow).await;

    let mut config = config(base_url, CallbackAuthConfig::default());
    config.timeout_ms = 100;
    let client = CallbackApiClient::new(&config).unwrap();

    let err = client.send_event(&request()).await.unwrap_err();
    assert!(matches!(err, SinkError::Timeout(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_api_key_header_is_sent() {
    let endpoint = endpoint(StatusCode::OK);
    let requests = endpoint.requests.clone();
    let base_url = spawn_endpoint(endpoint).await;

    let auth = CallbackAuthConfig {
        auth_type: CallbackAuthType::ApiKey,
        secret: Some("anchor-secret".to_string()),
        header: None,
        expiration_ms: 30_000,
    };
    let client = CallbackApiClient::new(&config(base_url, auth)).unwrap();
    client.send_event(&request()).await.unwrap();

    let requests = requests.lock().unwrap();
    assert_eq!(requests[0].0.get("x-api-key").unwrap(), "anchor-secret");
}

#[tokio::test]
async fn test_jwt_header_is_signed_with_secret() {
    let endpoint = endpoint(StatusCode::OK);
    let requests = endpoint.requests.clone();
    let base_url = spawn_endpoint(endpoint).await;

    let auth = CallbackAuthConfig {
        auth_type: CallbackAuthType::Jwt,
        secret: Some("jwt-secret".to_string()),
        header: None,
        expiration_ms: 60_000,
    };
    let client = CallbackApiClient::new(&config(base_url, auth)).unwrap();
    client.send_event(&request()).await.unwrap();

    let requests = requests.lock().unwrap();
    let value = requests[0].0.get("authorization").unwrap().to_str().unwrap();
    let token = value.strip_prefix("Bearer ").unwrap();

    let claims = decode::<CallbackClaims>(
        token,
        &DecodingKey::from_secret("jwt-secret".as_bytes()),
        &Validation::default(),
    )
    .unwrap()
    .claims;
    assert!(claims.exp > claims.iat);
}

#[tokio::test]
async fn test_callback_handler_reduces_http_failure_to_outcome() {
    let base_url = spawn_endpoint(endpoint(StatusCode::INTERNAL_SERVER_ERROR)).await;
    let client = CallbackApiClient::new(&config(base_url, CallbackAuthConfig::default())).unwrap();
    let handler = CallbackApiEventHandler::new(client);

    let event = AnchorEvent::builder("transaction_error").id("evt-9").build();
    let outcome = handler.handle_event(&event).await;

    assert!(matches!(outcome, HandlerOutcome::Failed(_)));
}
