//! Per-identity connection status.

use super::{required_identity, ApiResult};
use crate::state::AppState;
use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use wagate_types::{AccountUser, ApiResponse, Identity, SessionStatus};

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub identity: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub identity: Identity,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<AccountUser>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
}

/// Report the record for an identity. Unknown identities are `connected: false`, not an error.
pub async fn get(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<StatusResponse> {
    let identity = required_identity(query.identity.as_deref(), "identity")?;

    let response = match state.registry.lookup(&identity) {
        Some(record) => StatusResponse {
            connected: record.is_connected(),
            status: Some(record.status),
            user: record.user,
            pairing_code: record.pending_pairing_code,
            connected_at: record.connected_at,
            identity,
        },
        None => StatusResponse {
            identity,
            connected: false,
            status: None,
            user: None,
            pairing_code: None,
            connected_at: None,
        },
    };

    Ok(Json(ApiResponse::ok("OK", response)))
}
