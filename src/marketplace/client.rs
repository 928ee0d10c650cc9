//! Marketplace REST client
//!
//! Every request goes through [`MarketplaceClient::execute`], which owns the
//! cross-cutting behavior: pacing through the shared [`RateLimiter`], bearer
//! token injection, honoring 429 `Retry-After`, a single token refresh on
//! 401 and exponential backoff for transient failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::OnceCell;

use crate::auth::{CredentialManager, OpClass};
use crate::config::SyncConfig;
use crate::error::{AuthError, Result, SyncError};
use crate::marketplace::models::{ItemDetail, SearchPage, SearchQuery, SiteSearchPage, UserIdentity};
use crate::marketplace::rate_limiter::RateLimiter;
use crate::marketplace::MarketplaceApi;
use crate::retry::RetryPolicy;

/// Status, Retry-After and body of one completed HTTP exchange
struct RawResponse {
    status: StatusCode,
    retry_after: Option<Duration>,
    body: String,
}

pub struct MarketplaceClient {
    http: Client,
    base_url: String,
    site_id: String,
    configured_seller: String,
    seller_id: OnceCell<String>,
    credentials: Arc<CredentialManager>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    rate_limit_fallback: Duration,
    max_rate_limit_waits: u32,
}

impl MarketplaceClient {
    pub fn new(
        config: &SyncConfig,
        credentials: Arc<CredentialManager>,
        limiter: RateLimiter,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.http_timeout)
            .user_agent("meli_sync/1.0")
            .build()?;

        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            site_id: config.site_id.clone(),
            configured_seller: config.seller_id.trim().to_string(),
            seller_id: OnceCell::new(),
            credentials,
            limiter,
            retry: config.retry.clone(),
            rate_limit_fallback: config.rate_limit_fallback,
            max_rate_limit_waits: config.max_rate_limit_waits,
        })
    }

    /// Issue one authenticated call and decode the JSON answer.
    ///
    /// 429 waits do not consume retry attempts but are capped by
    /// `max_rate_limit_waits`. A 401 triggers one token refresh; a second
    /// 401 fails with [`AuthError::Expired`]. Other 4xx are returned as-is.
    pub async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(String, String)],
        op: OpClass,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut token = self.credentials.get_token(op).await?;
        let mut refreshed = false;
        let mut rate_waits = 0u32;
        let mut attempt = 0u32;

        loop {
            let error = match self.send_once(&method, &url, params, &token).await {
                Ok(response) if response.status.is_success() => {
                    return Ok(serde_json::from_str(&response.body)?);
                }
                Ok(response) if response.status == StatusCode::TOO_MANY_REQUESTS => {
                    let wait = response.retry_after.unwrap_or(self.rate_limit_fallback);
                    rate_waits += 1;
                    if rate_waits > self.max_rate_limit_waits {
                        log::error!(
                            "{} {}: still rate limited after {} waits",
                            method,
                            endpoint,
                            rate_waits - 1
                        );
                        return Err(SyncError::RateLimited {
                            retry_after_secs: wait.as_secs(),
                        });
                    }
                    log::warn!("{} {}: rate limited, waiting {:?}", method, endpoint, wait);
                    self.limiter.penalize(wait).await;
                    continue;
                }
                Ok(response) if response.status == StatusCode::UNAUTHORIZED => {
                    if refreshed {
                        log::error!("{} {}: token rejected again after refresh", method, endpoint);
                        return Err(AuthError::Expired.into());
                    }
                    log::warn!("{} {}: token rejected, refreshing", method, endpoint);
                    refreshed = true;
                    token = self.credentials.token_rejected(op, &token).await?;
                    continue;
                }
                Ok(response) => SyncError::HttpStatus {
                    status: response.status,
                    body: response.body,
                },
                Err(e) => e,
            };

            if error.is_retryable() && attempt + 1 < self.retry.max_attempts.max(1) {
                let delay = self.retry.delay_for(attempt);
                log::warn!(
                    "{} {}: attempt {} failed ({}), retrying in {:?}",
                    method,
                    endpoint,
                    attempt + 1,
                    error,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            return Err(error);
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        params: &[(String, String)],
        token: &str,
    ) -> Result<RawResponse> {
        let _permit = self.limiter.acquire().await?;
        log::debug!("{} {}", method, url);

        let response = self
            .http
            .request(method.clone(), url)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .query(params)
            .send()
            .await?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await?;
        Ok(RawResponse {
            status,
            retry_after,
            body,
        })
    }

    /// Seller whose inventory is synced: configured id, else the credential owner
    pub async fn seller_id(&self) -> Result<String> {
        self.seller_id
            .get_or_try_init(|| async {
                if !self.configured_seller.is_empty() {
                    return Ok(self.configured_seller.clone());
                }
                let me = self.current_user().await?;
                log::info!("Resolved seller id {} from the authorized user", me.id);
                Ok::<_, SyncError>(me.id.to_string())
            })
            .await
            .cloned()
    }

    pub async fn current_user(&self) -> Result<UserIdentity> {
        self.execute(Method::GET, "/users/me", &[], OpClass::Write).await
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?;
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[async_trait]
impl MarketplaceApi for MarketplaceClient {
    async fn search_seller_items(&self, query: &SearchQuery) -> Result<SearchPage> {
        let seller = self.seller_id().await?;
        let endpoint = format!("/users/{}/items/search", urlencoding::encode(&seller));
        self.execute(Method::GET, &endpoint, &query.to_params(), OpClass::Write)
            .await
    }

    async fn search_site_category(
        &self,
        category_id: &str,
        offset: u32,
        limit: u32,
    ) -> Result<SiteSearchPage> {
        let seller = self.seller_id().await?;
        let endpoint = format!("/sites/{}/search", urlencoding::encode(&self.site_id));
        let params = vec![
            ("category".to_string(), category_id.to_string()),
            ("seller_id".to_string(), seller),
            ("offset".to_string(), offset.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        self.execute(Method::GET, &endpoint, &params, OpClass::Read).await
    }

    async fn item_detail(&self, item_id: &str) -> Result<ItemDetail> {
        let endpoint = format!("/items/{}", urlencoding::encode(item_id));
        self.execute(Method::GET, &endpoint, &[], OpClass::Read).await
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
