use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use parlor_shared::TokenError;
use parlor_store::StoreError;

use crate::protocol::{ErrorEvent, ErrorKind};

/// Failures raised by the realtime hub.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Authentication failed: {0}")]
    Auth(#[from] TokenError),

    #[error("Authentication failed: unknown user")]
    UnknownUser,

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Forbidden: {0}")]
    Permission(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Server is at capacity")]
    Capacity,

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl From<StoreError> for HubError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Validation(m) => HubError::Validation(m),
            StoreError::Permission(m) => HubError::Permission(m),
            StoreError::NotFound(m) => HubError::NotFound(m),
            StoreError::Conflict(m) => HubError::Conflict(m),
            other => HubError::Persistence(other.to_string()),
        }
    }
}

impl HubError {
    /// Stable machine-readable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            HubError::Auth(_) | HubError::UnknownUser => "auth",
            HubError::Validation(_) => "validation",
            HubError::Permission(_) => "permission",
            HubError::NotFound(_) => "not_found",
            HubError::Conflict(_) => "conflict",
            HubError::Capacity => "capacity",
            HubError::Persistence(_) => "persistence",
        }
    }

    /// The `error` event reported to the originating connection.
    ///
    /// Storage failures are not leaked verbatim.
    pub fn to_event(&self) -> ErrorEvent {
        let (kind, message) = match self {
            HubError::Persistence(_) => {
                (ErrorKind::Undeliverable, "storage unavailable, try again".to_string())
            }
            HubError::Capacity => (ErrorKind::Undeliverable, self.to_string()),
            _ => (ErrorKind::Rejected, self.to_string()),
        };
        ErrorEvent {
            kind,
            code: self.code().to_string(),
            message,
        }
    }
}

/// Errors returned by REST handlers.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Too many requests")]
    RateLimited,

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<HubError> for ServerError {
    fn from(e: HubError) -> Self {
        match e {
            HubError::Auth(_) | HubError::UnknownUser => ServerError::Unauthorized(e.to_string()),
            HubError::Validation(m) => ServerError::BadRequest(m),
            HubError::Permission(m) => ServerError::Forbidden(m),
            HubError::NotFound(m) => ServerError::NotFound(m),
            HubError::Conflict(m) => ServerError::Conflict(m),
            HubError::Capacity => ServerError::Unavailable(e.to_string()),
            HubError::Persistence(m) => ServerError::Internal(m),
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        HubError::from(e).into()
    }
}

impl From<TokenError> for ServerError {
    fn from(e: TokenError) -> Self {
        ServerError::Unauthorized(e.to_string())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            ServerError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            ServerError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            ServerError::Internal(detail) => {
                tracing::error!(error = %detail, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_status_codes() {
        let cases = [
            (StoreError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (StoreError::Permission("x".into()), StatusCode::FORBIDDEN),
            (StoreError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (StoreError::Conflict("x".into()), StatusCode::CONFLICT),
            (StoreError::Migration("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            let response = ServerError::from(err).into_response();
            assert_eq!(response.status(), status);
        }
    }

    #[test]
    fn test_token_errors_are_unauthorized() {
        let response = ServerError::from(TokenError::Expired).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_error_event_kinds() {
        let rejected = HubError::Permission("nope".into()).to_event();
        assert_eq!(rejected.kind, ErrorKind::Rejected);
        assert_eq!(rejected.code, "permission");

        let undeliverable = HubError::Persistence("disk full".into()).to_event();
        assert_eq!(undeliverable.kind, ErrorKind::Undeliverable);
        assert!(!undeliverable.message.contains("disk full"));
    }
}
