//! API error envelope: `{error: {kind, message}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use wuhu_domain::Error;

pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "not_found",
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "bad_request",
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let (status, kind) = match &e {
            Error::Config(_) => (StatusCode::BAD_REQUEST, "config"),
            Error::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage"),
            Error::Transport(_) => (StatusCode::BAD_GATEWAY, "transport"),
            Error::Provider { .. } => (StatusCode::BAD_GATEWAY, "provider"),
            Error::Decoding(_) => (StatusCode::BAD_GATEWAY, "decoding"),
            Error::Cancelled => (StatusCode::CONFLICT, "cancelled"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        Self {
            status,
            kind,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({
                "error": { "kind": self.kind, "message": self.message }
            })),
        )
            .into_response()
    }
}
