//! Listing of live connections.

use super::ApiResult;
use crate::state::AppState;
use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;
use wagate_types::{ApiResponse, SessionRecord};

#[derive(Debug, Serialize)]
pub struct ConnectionListResponse {
    pub total: usize,
    pub connections: Vec<SessionRecord>,
}

pub async fn list(State(state): State<Arc<AppState>>) -> ApiResult<ConnectionListResponse> {
    let connections = state.registry.list_active();

    Ok(Json(ApiResponse::ok(
        format!("{} active connections", connections.len()),
        ConnectionListResponse {
            total: connections.len(),
            connections,
        },
    )))
}
