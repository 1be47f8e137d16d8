//! Error kinds surfaced by the routing core

use axum::http::StatusCode;

/// Errors returned by registry and control-plane operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("proxy api key is already assigned to another account")]
    DuplicateProxyKey,

    #[error("invalid upstream url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("account does not exist: {0}")]
    AccountMissing(String),

    #[error("no active upstream node")]
    NoActiveNode,

    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl CoreError {
    pub fn node_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "node",
            id: id.into(),
        }
    }

    pub fn account_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "account",
            id: id.into(),
        }
    }

    /// HTTP status a collaborator should answer with
    pub fn status_code(&self) -> StatusCode {
        match self {
            CoreError::NotFound { .. } | CoreError::AccountMissing(_) => StatusCode::NOT_FOUND,
            CoreError::DuplicateProxyKey => StatusCode::CONFLICT,
            CoreError::InvalidUrl { .. } | CoreError::InvalidConfig(_) | CoreError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            CoreError::NoActiveNode => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
        }
    }
}
