use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid payload: {0}")]
    Validation(String),

    #[error("rate limit exceeded for {event}")]
    RateLimited {
        event: &'static str,
        retry_after_ms: u64,
        remaining: u32,
    },

    #[error("duplicate event")]
    Spam { event: &'static str },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable error kind used on the wire and in metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Auth(_) => "auth",
            AppError::Validation(_) => "validation",
            AppError::RateLimited { .. } => "rate_limit",
            AppError::Spam { .. } => "spam",
            AppError::Conflict(_) => "conflict",
            AppError::NotFound(_) => "not_found",
            AppError::Store(_) => "store",
            AppError::Internal(_) => "internal",
        }
    }

    /// Message safe to show to a client. Store and internal failures are
    /// reported generically; details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Store(_) => "temporary storage failure, try again".to_string(),
            AppError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::RateLimited { .. } | AppError::Spam { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Store(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.public_message(),
            "kind": self.kind(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::AppError;

    #[test]
    fn store_errors_are_not_leaked_to_clients() {
        let err = AppError::Store(sqlx::Error::PoolClosed);
        assert_eq!(err.kind(), "store");
        assert!(!err.public_message().contains("pool"));
    }

    #[test]
    fn conflict_keeps_its_message() {
        let err = AppError::Conflict("order 7 is no longer available".to_string());
        assert!(err.public_message().contains("order 7"));
    }
}
