//! Credential model and token endpoint DTOs

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default lifetime the marketplace gives access tokens (6 hours)
pub const DEFAULT_EXPIRES_IN_SECS: i64 = 21_600;

/// Class of operation a token is requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpClass {
    /// Catalog reads; an application (client-credentials) token is enough
    Read,
    /// Seller-bound operations; needs the authorization-code credential
    Write,
}

/// Singleton user-bound credential obtained through the authorization-code flow
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub scope: Option<String>,
    pub expires_at: DateTime<Utc>,
    /// Marketplace user the credential belongs to
    pub subject_id: Option<String>,
    /// Set once the marketplace rejected the refresh token
    pub invalid: bool,
    /// When the current refresh token was issued
    pub issued_at: DateTime<Utc>,
}

impl Credential {
    /// Build a credential from a token endpoint answer.
    ///
    /// Refresh responses may omit the refresh token; the previous one is kept then.
    pub fn from_response(
        response: &TokenResponse,
        previous: Option<&Credential>,
        now: DateTime<Utc>,
    ) -> Self {
        let rotated = response.refresh_token.is_some();
        let refresh_token = response
            .refresh_token
            .clone()
            .or_else(|| previous.and_then(|p| p.refresh_token.clone()));
        let issued_at = match previous {
            Some(p) if !rotated => p.issued_at,
            _ => now,
        };

        Self {
            access_token: response.access_token.clone(),
            refresh_token,
            token_type: response.token_type.clone(),
            scope: response
                .scope
                .clone()
                .or_else(|| previous.and_then(|p| p.scope.clone())),
            expires_at: now + Duration::seconds(response.expires_in()),
            subject_id: response
                .subject_id()
                .or_else(|| previous.and_then(|p| p.subject_id.clone())),
            invalid: false,
            issued_at,
        }
    }

    /// Seconds of access-token lifetime left (negative once expired)
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }
}

/// Lifecycle of the stored credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    Absent,
    Valid,
    /// Still usable but inside the safety margin, refresh proactively
    Expiring,
    Expired,
    /// Refresh token rejected, needs re-authorization
    Invalid,
}

impl CredentialState {
    pub fn evaluate(credential: Option<&Credential>, now: DateTime<Utc>, margin: Duration) -> Self {
        match credential {
            None => CredentialState::Absent,
            Some(c) if c.invalid => CredentialState::Invalid,
            Some(c) if now >= c.expires_at => CredentialState::Expired,
            Some(c) if c.remaining(now) < margin => CredentialState::Expiring,
            Some(_) => CredentialState::Valid,
        }
    }
}

/// Successful answer of the OAuth token endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    /// Numeric on Mercado Livre, kept loose so strings also work
    #[serde(default)]
    pub user_id: Option<serde_json::Value>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenResponse {
    pub fn expires_in(&self) -> i64 {
        self.expires_in
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_EXPIRES_IN_SECS)
    }

    pub fn subject_id(&self) -> Option<String> {
        match self.user_id.as_ref()? {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Error body of the OAuth token endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuthErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl OAuthErrorBody {
    pub fn is_invalid_grant(&self) -> bool {
        self.error.as_deref() == Some("invalid_grant")
    }

    pub fn describe(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.error_description.clone())
            .or_else(|| self.error.clone())
            .unwrap_or_else(|| "unknown error".to_string())
    }
}

/// Token preview safe for logs: first 6 characters then `***`
pub fn mask_token(token: &str) -> String {
    let preview: String = token.chars().take(6).collect();
    format!("{}***", preview)
}
