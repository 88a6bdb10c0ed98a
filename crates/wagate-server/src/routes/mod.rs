//! HTTP route handlers.

pub mod connections;
pub mod disconnect;
pub mod message;
pub mod pairing;
pub mod status;

use crate::global_ws;
use crate::state::AppState;
use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use wagate_core::WagateError;
use wagate_types::{ApiResponse, Identity};

/// Handler result: an enveloped payload or an enveloped error.
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Error rendered as `{ success: false, message }` with a matching status.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<WagateError> for ApiError {
    fn from(err: WagateError) -> Self {
        let status = match &err {
            WagateError::InvalidIdentity(_) => StatusCode::BAD_REQUEST,
            WagateError::UnknownIdentity(_) => StatusCode::NOT_FOUND,
            WagateError::NotConnected(_) => StatusCode::CONFLICT,
            WagateError::NotReady { .. } => StatusCode::GATEWAY_TIMEOUT,
            WagateError::ConnectionLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            WagateError::ConnectionInit { .. }
            | WagateError::PairingRequest { .. }
            | WagateError::SendFailed { .. } => StatusCode::BAD_GATEWAY,
            WagateError::Cleanup { .. } | WagateError::IoError(_) | WagateError::JsonError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status.is_server_error() {
            tracing::error!(target: "wagate::api", "{}", err);
        } else {
            tracing::debug!(target: "wagate::api", "Request rejected: {}", err);
        }

        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        tracing::debug!(target: "wagate::api", "Rejected request body: {}", rejection);
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::<()>::error(self.message))).into_response()
    }
}

/// JSON body extractor whose rejections use the `{ success, message }` envelope.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

/// Parse a required identity-like field, naming it in the error.
pub(crate) fn required_identity(value: Option<&str>, field: &str) -> Result<Identity, ApiError> {
    let raw = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("Parameter \"{}\" is required", field)))?;
    Identity::parse(raw).map_err(|e| ApiError::from(WagateError::from(e)))
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Full application router: `/api`, `/ws` and the static fallback.
pub fn router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        .route("/pairing", post(pairing::request))
        .route("/status", get(status::get))
        .route("/connections", get(connections::list))
        .route("/disconnect", post(disconnect::disconnect))
        .route("/message", post(message::send))
        .route("/send-test", get(message::send_test))
        .route("/send-hello", get(message::send_hello))
        .route("/health", get(health));

    let ws_routes = Router::new().route("/events", get(global_ws::upgrade));

    let static_dir = state.config.static_dir.clone();

    Router::new()
        .nest("/api", api_routes)
        .nest("/ws", ws_routes)
        .fallback_service(ServeDir::new(static_dir))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_status_mapping() {
        let id = Identity::parse("628111").unwrap();

        let cases = [
            (WagateError::UnknownIdentity(id.clone()), StatusCode::NOT_FOUND),
            (WagateError::NotConnected(id.clone()), StatusCode::CONFLICT),
            (
                WagateError::NotReady {
                    identity: id.clone(),
                    timeout: Duration::from_secs(5),
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                WagateError::ConnectionLimitExceeded(100),
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                WagateError::Cleanup {
                    identity: id,
                    source: std::io::Error::other("disk gone"),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status, expected);
        }
    }

    #[test]
    fn test_required_identity() {
        assert_eq!(
            required_identity(Some(" +62 811-1 "), "identity").unwrap().as_str(),
            "628111"
        );

        let err = required_identity(None, "identity").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "Parameter \"identity\" is required");

        let err = required_identity(Some("abc"), "identity").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_body_uses_envelope() {
        let request = axum::http::Request::builder()
            .method("POST")
            .header("content-type", "application/json")
            .body(axum::body::Body::from("{\"identity\": "))
            .unwrap();

        let Err(err) = ApiJson::<serde_json::Value>::from_request(request, &()).await else {
            panic!("truncated JSON was accepted");
        };
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(!err.message.is_empty());

        let response = err.into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
    }
}
