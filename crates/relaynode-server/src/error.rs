use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use relaynode_tunnel::TunnelError;
use serde_json::json;

/// Errors returned by HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error(transparent)]
    Any(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status_code = match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Tunnel(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Any(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match &self {
            ApiError::Any(e) => format!("{:#}", e),
            other => other.to_string(),
        };
        (status_code, Json(json!({ "success": false, "error": message }))).into_response()
    }
}
