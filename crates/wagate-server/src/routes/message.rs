//! Outbound text messages.

use super::{required_identity, ApiError, ApiJson, ApiResult};
use crate::state::AppState;
use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use wagate_core::SentMessage;
use wagate_types::{ApiResponse, Identity};

pub const HELLO_TEXT: &str = "Hello! This is a test message from your WhatsApp gateway.";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(default)]
    pub from_identity: Option<String>,
    #[serde(default)]
    pub to_identity: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendTestQuery {
    pub from: Option<String>,
    pub number: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub to: String,
    pub text: String,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

fn required_text(value: Option<String>, field: &str) -> Result<String, ApiError> {
    value
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("Parameter \"{}\" is required", field)))
}

async fn deliver(
    state: &AppState,
    from: &Identity,
    to: &str,
    text: String,
    message: &str,
) -> ApiResult<SendMessageResponse> {
    let SentMessage {
        to,
        message_id,
        timestamp,
    } = state.registry.send_text(from, to, &text).await?;

    Ok(Json(ApiResponse::ok(
        message,
        SendMessageResponse {
            to,
            text,
            message_id,
            timestamp,
        },
    )))
}

pub async fn send(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<SendMessageRequest>,
) -> ApiResult<SendMessageResponse> {
    let from = required_identity(req.from_identity.as_deref(), "fromIdentity")?;
    let to = required_text(req.to_identity, "toIdentity")?;
    let text = required_text(req.text, "text")?;

    deliver(&state, &from, &to, text, "Message sent successfully").await
}

/// Quick manual test: `GET /api/send-test?from=..&number=..&text=..`.
pub async fn send_test(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SendTestQuery>,
) -> ApiResult<SendMessageResponse> {
    let from = required_identity(query.from.as_deref(), "from")?;
    let to = required_text(query.number, "number")?;
    let text = required_text(query.text, "text")?;

    deliver(&state, &from, &to, text, "Test message sent successfully").await
}

/// Like `send-test` with a fixed greeting.
pub async fn send_hello(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SendTestQuery>,
) -> ApiResult<SendMessageResponse> {
    let from = required_identity(query.from.as_deref(), "from")?;
    let to = required_text(query.number, "number")?;

    deliver(
        &state,
        &from,
        &to,
        HELLO_TEXT.to_string(),
        "Hello message sent successfully",
    )
    .await
}
