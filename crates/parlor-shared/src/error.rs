use thiserror::Error;

/// Reasons a session token can be refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("No session token supplied")]
    Missing,

    #[error("Malformed session token: {0}")]
    Malformed(String),

    #[error("Session token signature is invalid")]
    BadSignature,

    #[error("Session token has expired")]
    Expired,

    #[error("Invalid signing key: {0}")]
    InvalidKey(String),
}
