//! Pairing code requests.

use super::{required_identity, ApiJson, ApiResult};
use crate::state::AppState;
use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use wagate_core::PairingOutcome;
use wagate_types::{ApiResponse, Identity};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequest {
    #[serde(default)]
    pub identity: Option<String>,
    /// Number whose account gets linked; defaults to the identity itself.
    #[serde(default)]
    pub phone_number: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingResponse {
    pub identity: Identity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
    pub already_connected: bool,
}

pub async fn request(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<PairingRequest>,
) -> ApiResult<PairingResponse> {
    // Older clients send only `phoneNumber`.
    let identity = required_identity(
        req.identity.as_deref().or(req.phone_number.as_deref()),
        "identity",
    )?;
    let phone_number = match req.phone_number.as_deref() {
        Some(raw) => required_identity(Some(raw), "phoneNumber")?,
        None => identity.clone(),
    };

    info!(target: "wagate::api", "Pairing requested for {}", identity);

    let response = match state.registry.request_pairing(&identity, &phone_number).await? {
        PairingOutcome::Code(code) => ApiResponse::ok(
            "Pairing code generated successfully",
            PairingResponse {
                identity,
                pairing_code: Some(code),
                already_connected: false,
            },
        ),
        PairingOutcome::AlreadyConnected => ApiResponse::ok(
            "Already connected",
            PairingResponse {
                identity,
                pairing_code: None,
                already_connected: true,
            },
        ),
    };

    Ok(Json(response))
}
