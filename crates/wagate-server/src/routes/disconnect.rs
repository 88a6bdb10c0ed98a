//! Explicit teardown of a tenant's session.

use super::{required_identity, ApiJson, ApiResult};
use crate::state::AppState;
use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use wagate_types::{ApiResponse, Identity};

#[derive(Debug, Deserialize)]
pub struct DisconnectRequest {
    #[serde(default)]
    pub identity: Option<String>,
    /// Skip the graceful logout and just drop the connection.
    #[serde(default)]
    pub forced: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectResponse {
    pub identity: Identity,
    pub removed: bool,
    pub logged_out: bool,
}

pub async fn disconnect(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<DisconnectRequest>,
) -> ApiResult<DisconnectResponse> {
    let identity = required_identity(req.identity.as_deref(), "identity")?;

    info!(target: "wagate::api", "Disconnect requested for {} (forced: {})", identity, req.forced);
    let outcome = state.registry.disconnect(&identity, req.forced).await?;

    let message = if outcome.removed() {
        "Disconnected and credentials removed"
    } else {
        "No active connection; stored credentials removed"
    };

    Ok(Json(ApiResponse::ok(
        message,
        DisconnectResponse {
            removed: outcome.removed(),
            logged_out: outcome.logged_out,
            identity,
        },
    )))
}
