//! Mercado Livre API access
//!
//! [`MarketplaceApi`] is the seam between the sync engine and the remote
//! marketplace. [`MarketplaceClient`] implements it over HTTP; tests use
//! in-memory fakes.

pub mod client;
pub mod models;
pub mod rate_limiter;

use async_trait::async_trait;

use crate::error::Result;

pub use client::MarketplaceClient;
pub use models::{
    ItemDetail, NormalizedItem, Paging, SearchPage, SearchQuery, SiteSearchPage, UserIdentity,
};
pub use rate_limiter::RateLimiter;

/// Read access to a seller's inventory
#[async_trait]
pub trait MarketplaceApi: Send + Sync {
    /// One page of item ids from the seller search endpoint
    async fn search_seller_items(&self, query: &SearchQuery) -> Result<SearchPage>;

    /// One page of the public site search, restricted to the seller and a category
    async fn search_site_category(
        &self,
        category_id: &str,
        offset: u32,
        limit: u32,
    ) -> Result<SiteSearchPage>;

    async fn item_detail(&self, item_id: &str) -> Result<ItemDetail>;
}
