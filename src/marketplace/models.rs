//! Typed DTOs for the marketplace endpoints
//!
//! Every payload is validated at the boundary: optional fields are explicit,
//! and item details are normalized into [`NormalizedItem`] before anything
//! downstream sees them.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Origin tag written on every catalog record coming from the marketplace
pub const ORIGIN: &str = "MERCADO_LIVRE";

/// Pagination block shared by the search endpoints
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Paging {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub limit: u64,
}

/// `GET /users/{seller}/items/search`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SearchPage {
    #[serde(default)]
    pub results: Vec<String>,
    #[serde(default)]
    pub paging: Paging,
    /// Only present in scan mode
    #[serde(default)]
    pub scroll_id: Option<String>,
}

/// One hit of `GET /sites/{site}/search`
#[derive(Debug, Clone, Deserialize)]
pub struct SiteSearchHit {
    pub id: String,
}

/// `GET /sites/{site}/search`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SiteSearchPage {
    #[serde(default)]
    pub results: Vec<SiteSearchHit>,
    #[serde(default)]
    pub paging: Paging,
}

impl SiteSearchPage {
    pub fn into_ids(self) -> Vec<String> {
        self.results.into_iter().map(|hit| hit.id).collect()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Picture {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub secure_url: Option<String>,
}

/// `GET /items/{id}`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ItemDetail {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub available_quantity: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub permalink: Option<String>,
    #[serde(default)]
    pub pictures: Vec<Picture>,
    #[serde(default)]
    pub seller_custom_field: Option<String>,
    #[serde(default)]
    pub date_created: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
    /// Sales counter, not part of the content hash
    #[serde(default)]
    pub sold_quantity: Option<i64>,
}

/// `GET /users/me`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserIdentity {
    pub id: i64,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub site_id: Option<String>,
}

/// Item detail after boundary validation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedItem {
    pub external_id: String,
    pub sku: String,
    pub title: String,
    pub description: String,
    pub price: f64,
    pub stock: i64,
    pub remote_status: String,
    pub images: Vec<String>,
    pub category: String,
    pub condition: String,
}

/// Compact excerpt of the raw payload kept on the snapshot for auditing
#[derive(Debug, Serialize)]
struct PayloadExcerpt<'a> {
    id: &'a str,
    title: Option<&'a str>,
    price: Option<f64>,
    available_quantity: Option<i64>,
    status: Option<&'a str>,
    category_id: Option<&'a str>,
    condition: Option<&'a str>,
    permalink: Option<&'a str>,
    last_updated: Option<&'a str>,
}

impl ItemDetail {
    /// Validate and convert into the internal representation.
    ///
    /// The SKU is the seller's own code when present, otherwise the marketplace id.
    pub fn normalize(&self) -> Result<NormalizedItem> {
        let external_id = self.id.trim();
        if external_id.is_empty() {
            return Err(SyncError::Validation("item without id".into()));
        }

        let title = self
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SyncError::Validation(format!("item {} has no title", external_id)))?;

        let price = self.price.unwrap_or(0.0);
        if !price.is_finite() || price < 0.0 {
            return Err(SyncError::Validation(format!(
                "item {} has invalid price {}",
                external_id, price
            )));
        }

        let sku = self
            .seller_custom_field
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(external_id);

        let images = self
            .pictures
            .iter()
            .filter_map(|p| p.secure_url.as_deref().or(p.url.as_deref()))
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .collect();

        Ok(NormalizedItem {
            external_id: external_id.to_string(),
            sku: sku.to_string(),
            title: title.to_string(),
            description: self.permalink.clone().unwrap_or_default(),
            price,
            stock: self.available_quantity.unwrap_or(0).max(0),
            remote_status: self.status.clone().unwrap_or_else(|| "unknown".to_string()),
            images,
            category: self.category_id.clone().unwrap_or_default(),
            condition: self.condition.clone().unwrap_or_default(),
        })
    }

    /// JSON excerpt stored on the snapshot
    pub fn excerpt(&self) -> String {
        let excerpt = PayloadExcerpt {
            id: &self.id,
            title: self.title.as_deref(),
            price: self.price,
            available_quantity: self.available_quantity,
            status: self.status.as_deref(),
            category_id: self.category_id.as_deref(),
            condition: self.condition.as_deref(),
            permalink: self.permalink.as_deref(),
            last_updated: self.last_updated.as_deref(),
        };
        serde_json::to_string(&excerpt).unwrap_or_default()
    }
}

/// Parameters of one seller item search
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchQuery {
    pub status: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub offset: u32,
    pub limit: u32,
    pub sort: Option<String>,
    /// Scan mode with the cursor returned by the previous page
    pub scan: bool,
    pub scroll_id: Option<String>,
}

impl SearchQuery {
    pub fn page(offset: u32, limit: u32) -> Self {
        Self {
            offset,
            limit,
            sort: Some("date_created_desc".to_string()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: &str) -> Self {
        self.status = Some(status.to_string());
        self
    }

    pub fn with_window(mut self, since: DateTime<Utc>, until: Option<DateTime<Utc>>) -> Self {
        self.since = Some(since);
        self.until = until;
        self
    }

    pub fn with_sort(mut self, sort: &str) -> Self {
        self.sort = Some(sort.to_string());
        self
    }

    pub fn scan(limit: u32, scroll_id: Option<String>) -> Self {
        Self {
            limit,
            scan: true,
            scroll_id,
            ..Self::default()
        }
    }

    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("limit".to_string(), self.limit.to_string())];
        if self.scan {
            params.push(("search_type".to_string(), "scan".to_string()));
            if let Some(ref scroll_id) = self.scroll_id {
                params.push(("scroll_id".to_string(), scroll_id.clone()));
            }
        } else {
            params.push(("offset".to_string(), self.offset.to_string()));
        }
        if let Some(ref status) = self.status {
            params.push(("status".to_string(), status.clone()));
        }
        if let Some(since) = self.since {
            params.push(("since".to_string(), format_timestamp(since)));
        }
        if let Some(until) = self.until {
            params.push(("until".to_string(), format_timestamp(until)));
        }
        if let Some(ref sort) = self.sort {
            params.push(("sort".to_string(), sort.clone()));
        }
        params
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
