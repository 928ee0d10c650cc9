//! Bearer token provider for the marketplace
//!
//! Reads prefer an application token from the client-credentials grant.
//! Seller-bound operations need the credential obtained through the
//! authorization-code grant, which is refreshed here and persisted in the
//! [`CredentialStore`]. Refreshes and code exchanges run under one lock so
//! concurrent callers never spend the same refresh token twice.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::auth::credential::{
    mask_token, Credential, CredentialState, OAuthErrorBody, OpClass, TokenResponse,
};
use crate::auth::store::CredentialStore;
use crate::clock::Clock;
use crate::config::{OAuthSettings, SyncConfig};
use crate::error::{AuthError, Result, SyncError};
use crate::marketplace::models::UserIdentity;
use crate::retry::RetryPolicy;

/// Cached client-credentials token (kept in memory only)
#[derive(Debug, Clone)]
struct AppToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// Token status read model
#[derive(Debug, Clone, Serialize)]
pub struct TokenStatus {
    pub state: CredentialState,
    pub expires_in_secs: Option<i64>,
    pub has_refresh_token: bool,
    pub subject_id: Option<String>,
    pub app_token_cached: bool,
    /// The refresh token is old enough that a re-authorization should be planned
    pub needs_renewal: bool,
    pub reauthorization_required: bool,
}

/// Outcome of one proactive check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshCheck {
    Fresh,
    Refreshed,
    NoCredential,
}

pub struct CredentialManager {
    http: Client,
    oauth: OAuthSettings,
    token_url: String,
    identity_url: String,
    auth_base_url: String,
    store: CredentialStore,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    safety_margin: Duration,
    renewal_horizon: Duration,
    app_token: Mutex<Option<AppToken>>,
    refresh_lock: Mutex<()>,
}

impl CredentialManager {
    pub fn new(config: &SyncConfig, store: CredentialStore, clock: Arc<dyn Clock>) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.http_timeout)
            .user_agent("meli_sync/1.0")
            .build()?;
        let base = config.api_base_url.trim_end_matches('/');

        Ok(Self {
            http,
            oauth: config.oauth.clone(),
            token_url: format!("{}/oauth/token", base),
            identity_url: format!("{}/users/me", base),
            auth_base_url: config.auth_base_url.trim_end_matches('/').to_string(),
            store,
            clock,
            retry: config.retry.clone(),
            safety_margin: Duration::from_std(config.token_safety_margin)
                .unwrap_or_else(|_| Duration::seconds(300)),
            renewal_horizon: config.refresh_token_renewal_horizon,
            app_token: Mutex::new(None),
            refresh_lock: Mutex::new(()),
        })
    }

    /// URL the seller opens to grant access; the marketplace redirects back with `?code=`
    pub fn authorization_url(&self) -> String {
        format!(
            "{}/authorization?response_type=code&client_id={}&redirect_uri={}",
            self.auth_base_url,
            urlencoding::encode(&self.oauth.client_id),
            urlencoding::encode(&self.oauth.redirect_uri)
        )
    }

    /// Current lifecycle state of the stored credential
    pub fn state(&self) -> Result<CredentialState> {
        let current = self.store.load()?;
        Ok(CredentialState::evaluate(
            current.as_ref(),
            self.clock.now(),
            self.safety_margin,
        ))
    }

    /// A bearer token valid for `op`, refreshing behind the scenes when needed.
    pub async fn get_token(&self, op: OpClass) -> Result<String> {
        match op {
            OpClass::Read => match self.client_credentials_token().await {
                Ok(token) => Ok(token),
                Err(e) => {
                    log::warn!(
                        "Client credentials token unavailable ({}), falling back to user credential",
                        e
                    );
                    self.user_token().await
                }
            },
            OpClass::Write => self.user_token().await,
        }
    }

    async fn user_token(&self) -> Result<String> {
        let current = self.store.load()?;
        let state =
            CredentialState::evaluate(current.as_ref(), self.clock.now(), self.safety_margin);

        match (state, current) {
            (CredentialState::Valid, Some(credential)) => Ok(credential.access_token),
            (CredentialState::Expiring, Some(credential)) => match self.refresh_if_stale().await {
                Ok(fresh) => Ok(fresh.access_token),
                Err(e) if e.is_retryable() => {
                    log::warn!(
                        "Proactive token refresh failed ({}), using current token until expiry",
                        e
                    );
                    Ok(credential.access_token)
                }
                Err(e) => Err(e),
            },
            (CredentialState::Expired, Some(_)) => {
                self.refresh_if_stale().await.map(|c| c.access_token)
            }
            (CredentialState::Invalid, _) => Err(reauthorize_error()),
            _ => Err(AuthError::NotAuthorized(
                "no authorization-code credential stored, run the authorization flow".into(),
            )
            .into()),
        }
    }

    /// Application token from the client-credentials grant, cached until it nears expiry
    pub async fn client_credentials_token(&self) -> Result<String> {
        if self.oauth.client_id.is_empty() || self.oauth.client_secret.is_empty() {
            return Err(
                AuthError::NotAuthorized("client id/secret are not configured".into()).into(),
            );
        }

        let mut cached = self.app_token.lock().await;
        let now = self.clock.now();
        if let Some(token) = cached.as_ref() {
            if token.expires_at - now > self.safety_margin {
                return Ok(token.access_token.clone());
            }
        }

        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.oauth.client_id.as_str()),
            ("client_secret", self.oauth.client_secret.as_str()),
        ];
        let response = self
            .retry
            .run("client credentials grant", || self.request_token(&form))
            .await?;

        let expires_at = now + Duration::seconds(response.expires_in());
        log::info!(
            "Obtained client credentials token {} (expires {})",
            mask_token(&response.access_token),
            expires_at
        );
        *cached = Some(AppToken {
            access_token: response.access_token.clone(),
            expires_at,
        });
        Ok(response.access_token)
    }

    /// Force a refresh of the stored credential
    pub async fn refresh(&self) -> Result<Credential> {
        let _guard = self.refresh_lock.lock().await;
        let current = self.load_usable()?;
        self.refresh_locked(current).await
    }

    /// Refresh only if nobody else did while we waited for the lock
    pub async fn refresh_if_stale(&self) -> Result<Credential> {
        let _guard = self.refresh_lock.lock().await;
        let current = self.load_usable()?;
        match CredentialState::evaluate(Some(&current), self.clock.now(), self.safety_margin) {
            CredentialState::Valid => Ok(current),
            _ => self.refresh_locked(current).await,
        }
    }

    /// The marketplace answered 401 for `rejected`; return a replacement token.
    ///
    /// Refreshes at most once no matter how many callers report the same token.
    pub async fn token_rejected(&self, op: OpClass, rejected: &str) -> Result<String> {
        if op == OpClass::Read {
            let replacement = {
                let mut cached = self.app_token.lock().await;
                match cached.as_ref() {
                    Some(token) if token.access_token == rejected => {
                        log::info!("Application token {} rejected", mask_token(rejected));
                        *cached = None;
                        None
                    }
                    Some(token) => Some(token.access_token.clone()),
                    None => None,
                }
            };
            if let Some(token) = replacement {
                return Ok(token);
            }
            match self.client_credentials_token().await {
                Ok(token) => return Ok(token),
                Err(e) => log::debug!("No application token to replace the rejected one: {}", e),
            }
        }

        let _guard = self.refresh_lock.lock().await;
        let current = self.load_usable()?;
        if current.access_token != rejected {
            log::debug!("Token already rotated by another caller");
            return Ok(current.access_token);
        }
        self.refresh_locked(current).await.map(|c| c.access_token)
    }

    /// One-time exchange of an authorization code for the initial credential pair
    pub async fn exchange_authorization_code(&self, code: &str) -> Result<Credential> {
        let code = code.trim();
        if code.is_empty() {
            return Err(SyncError::Validation("authorization code is empty".into()));
        }

        let _guard = self.refresh_lock.lock().await;
        log::info!("Exchanging authorization code {}", mask_token(code));
        let form = [
            ("grant_type", "authorization_code"),
            ("client_id", self.oauth.client_id.as_str()),
            ("client_secret", self.oauth.client_secret.as_str()),
            ("code", code),
            ("redirect_uri", self.oauth.redirect_uri.as_str()),
        ];
        let response = self
            .retry
            .run("authorization code exchange", || self.request_token(&form))
            .await?;

        let credential = Credential::from_response(&response, None, self.clock.now());
        self.store.save(&credential)?;
        log::info!(
            "Authorization complete for user {} (access {}, refresh {})",
            credential.subject_id.as_deref().unwrap_or("?"),
            mask_token(&credential.access_token),
            credential
                .refresh_token
                .as_deref()
                .map(mask_token)
                .unwrap_or_else(|| "none".into())
        );
        Ok(credential)
    }

    /// Store a refresh token obtained out of band, unless a credential already exists.
    ///
    /// The seeded credential starts expired so the first write-class request refreshes it.
    pub fn seed_refresh_token(&self, refresh_token: &str) -> Result<bool> {
        if refresh_token.trim().is_empty() || self.store.load()?.is_some() {
            return Ok(false);
        }
        let now = self.clock.now();
        self.store.save(&Credential {
            access_token: String::new(),
            refresh_token: Some(refresh_token.trim().to_string()),
            token_type: "Bearer".into(),
            scope: None,
            expires_at: now,
            subject_id: None,
            invalid: false,
            issued_at: now,
        })?;
        log::info!("Seeded credential store with refresh token {}", mask_token(refresh_token));
        Ok(true)
    }

    /// Call the identity endpoint to prove the token for `op` works
    pub async fn verify(&self, op: OpClass) -> Result<UserIdentity> {
        let token = self.get_token(op).await?;
        let response = self
            .http
            .get(&self.identity_url)
            .bearer_auth(&token)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(response.json::<UserIdentity>().await?),
            StatusCode::UNAUTHORIZED => Err(AuthError::Expired.into()),
            status => Err(SyncError::HttpStatus {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    pub async fn status(&self) -> Result<TokenStatus> {
        let current = self.store.load()?;
        let now = self.clock.now();
        let state = CredentialState::evaluate(current.as_ref(), now, self.safety_margin);
        let app_token_cached = self
            .app_token
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| t.expires_at > now);

        Ok(TokenStatus {
            state,
            expires_in_secs: current.as_ref().map(|c| c.remaining(now).num_seconds()),
            has_refresh_token: current.as_ref().is_some_and(|c| c.refresh_token.is_some()),
            subject_id: current.as_ref().and_then(|c| c.subject_id.clone()),
            app_token_cached,
            needs_renewal: current
                .as_ref()
                .is_some_and(|c| now - c.issued_at >= self.renewal_horizon),
            reauthorization_required: state == CredentialState::Invalid,
        })
    }

    /// Proactive check used by the token monitor
    pub async fn check_and_refresh(&self) -> Result<RefreshCheck> {
        let current = self.store.load()?;
        let now = self.clock.now();
        if let Some(ref credential) = current {
            let age = now - credential.issued_at;
            if age >= self.renewal_horizon && !credential.invalid {
                log::warn!(
                    "Refresh token was issued {} days ago, plan a re-authorization",
                    age.num_days()
                );
            }
        }

        match CredentialState::evaluate(current.as_ref(), now, self.safety_margin) {
            CredentialState::Absent => Ok(RefreshCheck::NoCredential),
            CredentialState::Valid => Ok(RefreshCheck::Fresh),
            CredentialState::Invalid => Err(reauthorize_error()),
            CredentialState::Expiring | CredentialState::Expired => {
                self.refresh_if_stale().await?;
                Ok(RefreshCheck::Refreshed)
            }
        }
    }

    fn load_usable(&self) -> Result<Credential> {
        match self.store.load()? {
            None => Err(AuthError::NotAuthorized("no credential stored".into()).into()),
            Some(c) if c.invalid => Err(reauthorize_error()),
            Some(c) => Ok(c),
        }
    }

    /// Caller must hold `refresh_lock`
    async fn refresh_locked(&self, current: Credential) -> Result<Credential> {
        let refresh_token = current.refresh_token.clone().ok_or_else(|| {
            AuthError::NotAuthorized("stored credential has no refresh token".into())
        })?;

        log::info!("Refreshing access token (refresh token {})", mask_token(&refresh_token));
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.oauth.client_id.as_str()),
            ("client_secret", self.oauth.client_secret.as_str()),
            ("refresh_token", refresh_token.as_str()),
        ];

        match self
            .retry
            .run("token refresh", || self.request_token(&form))
            .await
        {
            Ok(response) => {
                let credential =
                    Credential::from_response(&response, Some(&current), self.clock.now());
                self.store.save(&credential)?;
                log::info!(
                    "Token refreshed, new access token {} expires {}",
                    mask_token(&credential.access_token),
                    credential.expires_at
                );
                Ok(credential)
            }
            Err(SyncError::Auth(AuthError::InvalidGrant(message))) => {
                self.store.mark_invalid()?;
                log::error!(
                    "Refresh token rejected ({}), re-authorization required",
                    message
                );
                Err(AuthError::InvalidGrant(message).into())
            }
            Err(e) => Err(e),
        }
    }

    async fn request_token(&self, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self
            .http
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            return Ok(serde_json::from_str(&body)?);
        }

        let error: OAuthErrorBody = serde_json::from_str(&body).unwrap_or_default();
        log::error!("Token endpoint returned {}: {}", status, error.describe());
        if error.is_invalid_grant() {
            return Err(AuthError::InvalidGrant(error.describe()).into());
        }
        if status.is_server_error() {
            return Err(SyncError::HttpStatus { status, body });
        }
        Err(AuthError::TokenEndpoint { status, body }.into())
    }
}

fn reauthorize_error() -> SyncError {
    AuthError::InvalidGrant("refresh token was rejected, re-authorize the application".into())
        .into()
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
