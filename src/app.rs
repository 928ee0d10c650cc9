//! Wiring of the sync engine components over one database

use std::sync::Arc;

use crate::auth::{CredentialManager, CredentialStore, TokenMonitor};
use crate::catalog::SqliteCatalog;
use crate::clock::Clock;
use crate::collector::{Collector, CollectorSettings};
use crate::config::SyncConfig;
use crate::database::SharedConnection;
use crate::error::Result;
use crate::job::{JobController, JobSettings};
use crate::marketplace::{MarketplaceApi, MarketplaceClient, RateLimiter};
use crate::web::AppState;

/// Every long-lived component of the process, sharing one rate limiter and credential
pub struct App {
    pub config: SyncConfig,
    pub db: SharedConnection,
    pub clock: Arc<dyn Clock>,
    pub credentials: Arc<CredentialManager>,
    pub client: Arc<MarketplaceClient>,
    pub catalog: Arc<SqliteCatalog>,
    pub jobs: Arc<JobController>,
    pub monitor: Arc<TokenMonitor>,
}

impl App {
    pub fn build(config: SyncConfig, db: SharedConnection, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let credentials = Arc::new(CredentialManager::new(
            &config,
            CredentialStore::new(db.clone()),
            clock.clone(),
        )?);
        let limiter = RateLimiter::new(config.requests_per_minute, config.max_concurrency);
        let client = Arc::new(MarketplaceClient::new(&config, credentials.clone(), limiter)?);
        let catalog = Arc::new(SqliteCatalog::new(db.clone()));
        let monitor = Arc::new(TokenMonitor::new(
            credentials.clone(),
            config.monitor_interval,
            config.monitor_error_interval,
        ));

        let api: Arc<dyn MarketplaceApi> = client.clone();
        let settings = CollectorSettings::from(&config);
        let collector = Collector::new(api.clone(), clock.clone(), settings);
        let jobs = Arc::new(JobController::new(
            db.clone(),
            api,
            catalog.clone(),
            collector,
            clock.clone(),
            JobSettings::from(&config),
        ));

        log::info!(
            "Sync engine ready ({} req/min, {} concurrent, batch size {}, strategies {:?})",
            config.requests_per_minute,
            config.max_concurrency,
            config.batch_size,
            config.strategies
        );

        Ok(Self {
            config,
            db,
            clock,
            credentials,
            client,
            catalog,
            jobs,
            monitor,
        })
    }

    /// A standalone collector over the shared client, for collection-only runs
    pub fn collector(&self) -> Collector {
        Collector::new(
            self.client.clone(),
            self.clock.clone(),
            CollectorSettings::from(&self.config),
        )
    }

    pub fn control_state(&self) -> AppState {
        AppState {
            jobs: self.jobs.clone(),
            credentials: self.credentials.clone(),
            monitor: self.monitor.clone(),
        }
    }
}
