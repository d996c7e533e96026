//! Producer endpoint: publish an event into a named channel.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::event::AnchorEvent;
use crate::server::AppState;
use crate::session::TransportKind;

const API_SOURCE: &str = "http-api";

#[derive(Debug, Deserialize)]
pub struct PublishEventRequest {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Caller-chosen id for idempotent retries; generated when absent
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PublishEventResponse {
    pub id: String,
    pub channel: String,
    pub transport: TransportKind,
}

/// POST /api/v1/events/{channel}
pub async fn publish_event(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Json(request): Json<PublishEventRequest>,
) -> Result<(StatusCode, Json<PublishEventResponse>)> {
    if request.event_type.trim().is_empty() {
        return Err(AppError::Validation("event type must not be empty".to_string()));
    }

    let mut builder = AnchorEvent::builder(request.event_type)
        .payload(request.payload)
        .source(API_SOURCE);
    if let Some(id) = request.id {
        if id.trim().is_empty() {
            return Err(AppError::Validation("event id must not be empty".to_string()));
        }
        builder = builder.id(id);
    }
    let event = builder.build();
    let id = event.id().to_string();

    let session = state.event_service.session(&channel).await?;
    let transport = session.kind();
    session.publish(event).await?;

    tracing::info!(
        channel = %channel,
        event_id = %id,
        transport = %transport,
        "Event accepted for delivery"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(PublishEventResponse {
            id,
            channel,
            transport,
        }),
    ))
}
