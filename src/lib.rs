//! Meli Sync - Mercado Livre catalog synchronization
//!
//! Keeps a local product catalog consistent with a seller's Mercado Livre
//! inventory: OAuth credential lifecycle, a rate-limited marketplace client,
//! ceiling-aware inventory collection, hash-based change detection and a
//! resumable, checkpointed sync job.

pub mod app;
pub mod auth;
pub mod catalog;
pub mod clock;
pub mod collector;
pub mod config;
pub mod database;
pub mod error;
pub mod job;
pub mod marketplace;
pub mod retry;
pub mod snapshot;
pub mod web;

#[cfg(test)]
pub(crate) mod testing;

pub use app::App;
pub use auth::{CredentialManager, CredentialState, OpClass, TokenMonitor};
pub use catalog::{CatalogRecord, CatalogSink, SqliteCatalog};
pub use collector::{CollectionReport, Collector, Strategy};
pub use config::SyncConfig;
pub use database::{init_schema, SharedConnection};
pub use error::{AuthError, Result, SyncError};
pub use job::{JobController, JobOptions, JobStatus, SyncJob, SyncMode};
pub use marketplace::{MarketplaceApi, MarketplaceClient};
