use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::error;

/// Failure of a single outbound call to Bitrix24.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Connection, TLS or timeout failure
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Bitrix24 answered with HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// A 2xx response whose body carries an `error` key
    #[error("Bitrix24 reported an error: {0}")]
    Destination(Value),

    #[error("failed to decode Bitrix24 response: {0}")]
    Decode(String),

    /// Attachment source larger than the download limit
    #[error("attachment exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },
}

impl DeliveryError {
    /// What the caller of the relay gets to see in `details`.
    pub fn details(&self) -> Value {
        match self {
            DeliveryError::Destination(body) => body.clone(),
            DeliveryError::Status { body, .. } => {
                serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.clone()))
            }
            other => Value::String(other.to_string()),
        }
    }
}

/// Everything the relay endpoint can answer with besides a success.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid payload: {0}")]
    Validation(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("Bitrix24 request failed after {attempts} attempt(s): {source}")]
    Upstream {
        attempts: u32,
        #[source]
        source: DeliveryError,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::Unauthorized => StatusCode::UNAUTHORIZED,
            RelayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            RelayError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            RelayError::Validation(message) => json!({ "error": message }),
            RelayError::Unauthorized => json!({ "error": "Unauthorized" }),
            RelayError::MethodNotAllowed => json!({ "error": "Method not allowed" }),
            RelayError::Upstream { attempts, source } => json!({
                "error": "Bitrix24 request failed",
                "attempts": attempts,
                "details": source.details(),
            }),
            RelayError::Internal(message) => {
                error!(error = %message, "internal error while relaying");
                json!({ "error": "Internal error", "details": message })
            }
        };

        (status, Json(body)).into_response()
    }
}
