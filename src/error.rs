//! Error types for meli_sync

use thiserror::Error;

/// Authentication failures raised by the credential manager.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No credential source is available for the requested operation class
    #[error("no valid credential available: {0}")]
    NotAuthorized(String),
    /// The marketplace rejected the refresh token or authorization code.
    /// Needs an out-of-band re-authorization, never retried.
    #[error("invalid grant, re-authorization required: {0}")]
    InvalidGrant(String),
    /// The access token was rejected even after a refresh
    #[error("access token expired or rejected")]
    Expired,
    /// Token endpoint answered with an unexpected status
    #[error("token endpoint returned {status}: {body}")]
    TokenEndpoint {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Unified error type for meli_sync operations
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),
    /// Marketplace kept answering 429 past the wait budget
    #[error("rate limited by marketplace (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },
    /// HTTP error status code
    #[error("HTTP error {status}: {body}")]
    HttpStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("request timed out")]
    Timeout,
    /// HTTP request failed (connection refused, reset, DNS, ...)
    #[error("network error: {0}")]
    Network(reqwest::Error),
    /// Malformed item or response payload
    #[error("validation error: {0}")]
    Validation(String),
    /// Failed to parse JSON
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("a sync job is already running")]
    JobAlreadyRunning,
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout
        } else {
            SyncError::Network(err)
        }
    }
}

impl SyncError {
    /// Whether the retry policy may attempt the call again.
    ///
    /// Timeouts, transport failures and 5xx responses are transient.
    /// Auth failures are handled by the refresh path, not by blind retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Timeout | SyncError::Network(_) => true,
            SyncError::HttpStatus { status, .. } => {
                status.is_server_error() || *status == reqwest::StatusCode::REQUEST_TIMEOUT
            }
            _ => false,
        }
    }

    /// Whether an error hit while processing a single item must abort the whole job.
    ///
    /// Everything else is logged and the item is excluded from its batch.
    pub fn is_fatal_for_job(&self) -> bool {
        matches!(
            self,
            SyncError::Auth(AuthError::InvalidGrant(_))
                | SyncError::Auth(AuthError::NotAuthorized(_))
                | SyncError::Database(_)
                | SyncError::Io(_)
        )
    }

    /// True when the operator has to re-authorize the application.
    pub fn requires_reauthorization(&self) -> bool {
        matches!(
            self,
            SyncError::Auth(AuthError::InvalidGrant(_) | AuthError::NotAuthorized(_))
        )
    }
}

/// Result alias for meli_sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn server_errors_are_retryable() {
        let err = SyncError::HttpStatus {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        assert!(err.is_retryable());
        assert!(SyncError::Timeout.is_retryable());
    }

    #[test]
    fn client_errors_are_not_retryable() {
        let err = SyncError::HttpStatus {
            status: StatusCode::NOT_FOUND,
            body: String::new(),
        };
        assert!(!err.is_retryable());
        assert!(!SyncError::Validation("bad".into()).is_retryable());
    }

    #[test]
    fn invalid_grant_is_never_retried_and_aborts_jobs() {
        let err = SyncError::Auth(AuthError::InvalidGrant("expired".into()));
        assert!(!err.is_retryable());
        assert!(err.is_fatal_for_job());
        assert!(err.requires_reauthorization());
    }

    #[test]
    fn item_level_errors_do_not_abort_jobs() {
        assert!(!SyncError::Validation("no title".into()).is_fatal_for_job());
        assert!(!SyncError::Timeout.is_fatal_for_job());
        assert!(!SyncError::RateLimited { retry_after_secs: 5 }.is_fatal_for_job());
    }

    #[test]
    fn display_includes_status() {
        let err = SyncError::HttpStatus {
            status: StatusCode::FORBIDDEN,
            body: "nope".into(),
        };
        assert_eq!(err.to_string(), "HTTP error 403 Forbidden: nope");
    }
}
