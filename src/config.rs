//! Runtime configuration
//!
//! `SyncConfig` is plain data with sensible defaults. The binary fills it
//! from command-line flags (each with an environment fallback); tests build
//! it directly.

use std::time::Duration;

use crate::collector::Strategy;
use crate::error::{Result, SyncError};
use crate::job::JobOptions;
use crate::retry::RetryPolicy;

/// Mercado Livre API root
pub const DEFAULT_API_BASE_URL: &str = "https://api.mercadolibre.com";
/// Mercado Livre authorization root (Brazil)
pub const DEFAULT_AUTH_BASE_URL: &str = "https://auth.mercadolivre.com.br";

/// Longest creation-date history the time partition may walk
pub const MAX_LOOKBACK_DAYS: i64 = 3650;

/// Marketplace application credentials
#[derive(Debug, Clone, Default)]
pub struct OAuthSettings {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

/// Everything the sync engine needs to talk to the marketplace
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub auth_base_url: String,
    /// Marketplace site id used by the category search (e.g. `MLB`)
    pub site_id: String,
    pub oauth: OAuthSettings,
    pub seller_id: String,
    /// Global request budget shared by every caller in the process
    pub requests_per_minute: u32,
    /// Maximum in-flight marketplace requests
    pub max_concurrency: usize,
    pub http_timeout: Duration,
    /// Largest offset the search endpoint accepts
    pub offset_ceiling: u32,
    /// Identifiers per search page (marketplace maximum is 50)
    pub page_size: u32,
    /// Identifiers per checkpointed job batch
    pub batch_size: u32,
    /// Concurrent item-detail fetches inside one batch
    pub detail_fan_out: usize,
    pub max_items: Option<usize>,
    /// Remaining token lifetime under which a proactive refresh happens
    pub token_safety_margin: Duration,
    /// Age of the refresh token after which renewal warnings start
    pub refresh_token_renewal_horizon: chrono::Duration,
    pub monitor_interval: Duration,
    pub monitor_error_interval: Duration,
    pub retry: RetryPolicy,
    /// Fallback wait when a 429 carries no usable Retry-After header
    pub rate_limit_fallback: Duration,
    /// 429 responses tolerated for one call before giving up
    pub max_rate_limit_waits: u32,
    pub strategies: Vec<Strategy>,
    pub lookback_days: i64,
    pub window_days: i64,
    /// Items inspected to discover seller categories
    pub category_sample_size: usize,
    pub incremental_hours: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            auth_base_url: DEFAULT_AUTH_BASE_URL.to_string(),
            site_id: "MLB".to_string(),
            oauth: OAuthSettings::default(),
            seller_id: String::new(),
            requests_per_minute: 250,
            max_concurrency: 8,
            http_timeout: Duration::from_secs(30),
            offset_ceiling: 1000,
            page_size: 50,
            batch_size: 300,
            detail_fan_out: 8,
            max_items: None,
            token_safety_margin: Duration::from_secs(300),
            refresh_token_renewal_horizon: chrono::Duration::days(173),
            monitor_interval: Duration::from_secs(30 * 60),
            monitor_error_interval: Duration::from_secs(5 * 60),
            retry: RetryPolicy::default(),
            rate_limit_fallback: Duration::from_secs(2),
            max_rate_limit_waits: 10,
            strategies: Strategy::all().to_vec(),
            lookback_days: 730,
            window_days: 30,
            category_sample_size: 10,
            incremental_hours: 24,
        }
    }
}

impl SyncConfig {
    /// Reject settings the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.requests_per_minute == 0 {
            return Err(SyncError::Config("requests_per_minute must be > 0".into()));
        }
        if self.max_concurrency == 0 || self.detail_fan_out == 0 {
            return Err(SyncError::Config(
                "max_concurrency and detail_fan_out must be > 0".into(),
            ));
        }
        if self.batch_size == 0 || self.page_size == 0 {
            return Err(SyncError::Config("batch_size and page_size must be > 0".into()));
        }
        if self.page_size > self.offset_ceiling {
            return Err(SyncError::Config(format!(
                "page_size {} exceeds offset ceiling {}",
                self.page_size, self.offset_ceiling
            )));
        }
        if self.window_days <= 0
            || self.lookback_days < self.window_days
            || self.lookback_days > MAX_LOOKBACK_DAYS
        {
            return Err(SyncError::Config(format!(
                "window_days must be > 0 and lookback_days between window_days and {}",
                MAX_LOOKBACK_DAYS
            )));
        }
        let defaults = JobOptions {
            max_items: self.max_items,
            since_hours: Some(self.incremental_hours),
            ..JobOptions::default()
        };
        defaults.validate(self.lookback_days * 24)?;
        if self.strategies.is_empty() {
            return Err(SyncError::Config("at least one collection strategy is required".into()));
        }
        Ok(())
    }
}

/// Parse a comma-separated strategy list such as `status,time,category,scan`.
pub fn parse_strategies(raw: &str) -> Result<Vec<Strategy>> {
    let mut strategies = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let strategy: Strategy = name.parse()?;
        if !strategies.contains(&strategy) {
            strategies.push(strategy);
        }
    }
    if strategies.is_empty() {
        return Err(SyncError::Config(format!("no strategies in '{raw}'")));
    }
    Ok(strategies)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.offset_ceiling, 1000);
        assert_eq!(config.strategies.len(), 4);
    }

    #[test]
    fn zero_rate_limit_is_rejected() {
        let config = SyncConfig {
            requests_per_minute: 0,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn page_size_above_ceiling_is_rejected() {
        let config = SyncConfig {
            page_size: 2000,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn out_of_range_job_defaults_are_rejected() {
        let wide = SyncConfig {
            incremental_hours: 731 * 24,
            ..SyncConfig::default()
        };
        assert!(matches!(wide.validate(), Err(SyncError::Config(_))));

        let unbounded = SyncConfig {
            max_items: Some(usize::MAX),
            ..SyncConfig::default()
        };
        assert!(unbounded.validate().is_err());

        let ancient = SyncConfig {
            lookback_days: i64::MAX / 2,
            ..SyncConfig::default()
        };
        assert!(ancient.validate().is_err());
    }

    #[test]
    fn parse_strategies_deduplicates() {
        let parsed = parse_strategies("status, time,status").unwrap();
        assert_eq!(parsed, vec![Strategy::Status, Strategy::TimeWindow]);
    }

    #[test]
    fn parse_strategies_rejects_unknown() {
        assert!(parse_strategies("status,teleport").is_err());
        assert!(parse_strategies(" , ").is_err());
    }
}
