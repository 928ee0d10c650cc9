//! In-memory fakes of the marketplace and the catalog sink for tests.
//!
//! Enforces the search offset ceiling like the real endpoint, filters by
//! status and creation window, and can be told to fail specific calls.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use reqwest::StatusCode;

use crate::catalog::{CatalogRecord, CatalogSink};
use crate::error::{AuthError, Result, SyncError};
use crate::marketplace::models::{Paging, Picture, SiteSearchHit};
use crate::marketplace::{ItemDetail, MarketplaceApi, SearchPage, SearchQuery, SiteSearchPage};

pub(crate) const CATEGORIES: [&str; 3] = ["MLB1747", "MLB1071", "MLB5672"];

#[derive(Debug, Clone)]
pub(crate) struct FakeItem {
    pub detail: ItemDetail,
    pub created: DateTime<Utc>,
}

#[derive(Default)]
struct Failures {
    statuses: HashSet<String>,
    windows: HashSet<DateTime<Utc>>,
    site_search: bool,
    poisoned: HashSet<String>,
    malformed: HashSet<String>,
}

pub(crate) struct FakeMarketplace {
    now: DateTime<Utc>,
    ceiling: u32,
    scan_supported: bool,
    items: Mutex<Vec<FakeItem>>,
    failures: Mutex<Failures>,
    detail_calls: AtomicUsize,
    search_calls: AtomicUsize,
}

impl FakeMarketplace {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            ceiling: 1000,
            scan_supported: false,
            items: Mutex::new(Vec::new()),
            failures: Mutex::new(Failures::default()),
            detail_calls: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_scan(mut self) -> Self {
        self.scan_supported = true;
        self
    }

    /// Add `count` items with `status`, created every `spacing` going back from now
    pub fn with_items(self, status: &str, count: usize, spacing: Duration) -> Self {
        self.add_items(status, count, spacing);
        self
    }

    pub fn add_items(&self, status: &str, count: usize, spacing: Duration) {
        let mut items = self.items.lock().unwrap();
        let start = items.len();
        for n in 0..count {
            let index = start + n;
            let created = self.now - spacing * (n as i32 + 1);
            items.push(FakeItem {
                detail: sample_detail(index, status, created),
                created,
            });
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.items
            .lock()
            .unwrap()
            .iter()
            .map(|i| i.detail.id.clone())
            .collect()
    }

    pub fn update(&self, id: &str, change: impl FnOnce(&mut ItemDetail)) {
        let mut items = self.items.lock().unwrap();
        if let Some(item) = items.iter_mut().find(|i| i.detail.id == id) {
            change(&mut item.detail);
        }
    }

    pub fn fail_status(&self, status: &str) {
        self.failures.lock().unwrap().statuses.insert(status.to_string());
    }

    /// Window searches (no status filter) starting at `since` fail with a 500
    pub fn fail_window(&self, since: DateTime<Utc>) {
        self.failures.lock().unwrap().windows.insert(since);
    }

    pub fn fail_site_search(&self) {
        self.failures.lock().unwrap().site_search = true;
    }

    /// Detail fetches for `id` fail with an invalid grant until cleared
    pub fn poison(&self, id: &str) {
        self.failures.lock().unwrap().poisoned.insert(id.to_string());
    }

    pub fn clear_poison(&self) {
        self.failures.lock().unwrap().poisoned.clear();
    }

    /// Detail for `id` comes back without a title
    pub fn malform(&self, id: &str) {
        self.failures.lock().unwrap().malformed.insert(id.to_string());
    }

    pub fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    fn matching(&self, query: &SearchQuery) -> Vec<FakeItem> {
        let mut matched: Vec<FakeItem> = self
            .items
            .lock()
            .unwrap()
            .iter()
            .filter(|i| {
                query
                    .status
                    .as_deref()
                    .map_or(true, |s| i.detail.status.as_deref() == Some(s))
            })
            .filter(|i| query.since.map_or(true, |since| i.created >= since))
            .filter(|i| query.until.map_or(true, |until| i.created < until))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created.cmp(&a.created));
        matched
    }

    fn check_offset(&self, offset: u32, limit: u32) -> Result<()> {
        if offset + limit > self.ceiling {
            return Err(SyncError::HttpStatus {
                status: StatusCode::BAD_REQUEST,
                body: format!("offset {} exceeds the allowed maximum", offset),
            });
        }
        Ok(())
    }
}

fn page_of(ids: Vec<String>, offset: u32, limit: u32) -> (Vec<String>, Paging) {
    let total = ids.len() as u64;
    let results = ids
        .into_iter()
        .skip(offset as usize)
        .take(limit as usize)
        .collect();
    (
        results,
        Paging {
            total,
            offset: u64::from(offset),
            limit: u64::from(limit),
        },
    )
}

pub(crate) fn sample_detail(index: usize, status: &str, created: DateTime<Utc>) -> ItemDetail {
    ItemDetail {
        id: format!("MLB{}", 100_000 + index),
        title: Some(format!("Produto {}", index)),
        price: Some(10.0 + index as f64),
        available_quantity: Some((index % 7) as i64),
        status: Some(status.to_string()),
        category_id: Some(CATEGORIES[index % CATEGORIES.len()].to_string()),
        condition: Some("new".to_string()),
        permalink: Some(format!("https://produto.mercadolivre.com.br/MLB-{}", 100_000 + index)),
        pictures: vec![Picture {
            url: None,
            secure_url: Some(format!("https://http2.mlstatic.com/{}-O.jpg", index)),
        }],
        seller_custom_field: Some(format!("SKU-{}", index)),
        date_created: Some(created.to_rfc3339_opts(SecondsFormat::Secs, true)),
        last_updated: None,
        sold_quantity: Some(0),
    }
}

#[async_trait]
impl MarketplaceApi for FakeMarketplace {
    async fn search_seller_items(&self, query: &SearchQuery) -> Result<SearchPage> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);

        let failing = {
            let failures = self.failures.lock().unwrap();
            match (query.status.as_deref(), query.since) {
                (Some(status), _) => failures.statuses.contains(status),
                (None, Some(since)) => failures.windows.contains(&since),
                (None, None) => false,
            }
        };
        if failing {
            return Err(SyncError::HttpStatus {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: "search backend unavailable".into(),
            });
        }

        let ids: Vec<String> = self.matching(query).into_iter().map(|i| i.detail.id).collect();

        if query.scan {
            if !self.scan_supported {
                return Err(SyncError::HttpStatus {
                    status: StatusCode::BAD_REQUEST,
                    body: "invalid search_type".into(),
                });
            }
            let offset = match query.scroll_id.as_deref() {
                Some(cursor) => cursor.parse::<u32>().unwrap_or(0),
                None => 0,
            };
            let (results, paging) = page_of(ids, offset, query.limit);
            let next = offset + query.limit;
            return Ok(SearchPage {
                results,
                paging,
                scroll_id: Some(next.to_string()),
            });
        }

        self.check_offset(query.offset, query.limit)?;
        let (results, paging) = page_of(ids, query.offset, query.limit);
        Ok(SearchPage {
            results,
            paging,
            scroll_id: None,
        })
    }

    async fn search_site_category(
        &self,
        category_id: &str,
        offset: u32,
        limit: u32,
    ) -> Result<SiteSearchPage> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if self.failures.lock().unwrap().site_search {
            return Err(SyncError::HttpStatus {
                status: StatusCode::FORBIDDEN,
                body: "site search not allowed".into(),
            });
        }
        self.check_offset(offset, limit)?;

        let mut items: Vec<FakeItem> = self
            .items
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.detail.category_id.as_deref() == Some(category_id))
            .filter(|i| i.detail.status.as_deref() == Some("active"))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created.cmp(&a.created));
        let ids = items.into_iter().map(|i| i.detail.id).collect();
        let (results, paging) = page_of(ids, offset, limit);
        Ok(SiteSearchPage {
            results: results.into_iter().map(|id| SiteSearchHit { id }).collect(),
            paging,
        })
    }

    async fn item_detail(&self, item_id: &str) -> Result<ItemDetail> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        {
            let failures = self.failures.lock().unwrap();
            if failures.poisoned.contains(item_id) {
                return Err(AuthError::InvalidGrant("refresh token revoked".into()).into());
            }
            if failures.malformed.contains(item_id) {
                return Ok(ItemDetail {
                    id: item_id.to_string(),
                    title: None,
                    price: None,
                    available_quantity: None,
                    status: None,
                    category_id: None,
                    condition: None,
                    permalink: None,
                    pictures: Vec::new(),
                    seller_custom_field: None,
                    date_created: None,
                    last_updated: None,
                    sold_quantity: None,
                });
            }
        }

        self.items
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.detail.id == item_id)
            .map(|i| i.detail.clone())
            .ok_or_else(|| SyncError::HttpStatus {
                status: StatusCode::NOT_FOUND,
                body: format!("item {} not found", item_id),
            })
    }
}

/// Catalog sink that keeps every upsert in memory
#[derive(Default)]
pub(crate) struct RecordingSink {
    records: Mutex<Vec<CatalogRecord>>,
    failing_skus: Mutex<HashSet<String>>,
}

impl RecordingSink {
    pub fn upserts(&self) -> Vec<CatalogRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn fail_sku(&self, sku: &str) {
        self.failing_skus.lock().unwrap().insert(sku.to_string());
    }
}

#[async_trait]
impl CatalogSink for RecordingSink {
    async fn upsert_by_sku(&self, record: &CatalogRecord) -> Result<()> {
        if self.failing_skus.lock().unwrap().contains(&record.sku) {
            return Err(SyncError::Validation(format!("catalog rejected {}", record.sku)));
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}
