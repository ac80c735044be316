//! Error types for the REST surface and the push protocol.

use axum::{
    extract::rejection::QueryRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Errors a REST handler can return. Rendered as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Query(#[from] QueryRejection),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) | Self::Query(_) => StatusCode::BAD_REQUEST,
            Self::Internal(e) => {
                error!(error = %e, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Problems with a client message on the push socket. Each becomes a scoped
/// `error` reply; the connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("{0} requires `{1}`")]
    MissingField(&'static str, &'static str),

    #[error("unknown exchange `{0}`")]
    UnknownExchange(String),

    #[error("unknown timeframe `{0}`")]
    UnknownTimeframe(String),

    #[error("subscription limit of {0} reached")]
    TooManySubscriptions(usize),

    #[error("subscription `{0}` already exists")]
    DuplicateSubscription(String),

    #[error("no subscription `{0}`")]
    UnknownSubscription(String),

    #[error("connection closed")]
    ConnectionClosed,
}
