//! Seller inventory enumeration
//!
//! The seller search endpoint refuses offsets past a fixed ceiling, so a
//! single paged query never sees more than `offset_ceiling` items. The
//! collector runs several independent partitioning strategies and keeps the
//! ordered union of everything they return:
//!
//! - **status**: one paged query per item status
//! - **time**: the lookback period split into fixed windows on creation date
//! - **category**: categories discovered from a sample, then a site search per category
//! - **scan**: the cursor-based scan mode, which has no offset ceiling
//!
//! A failing sub-query (one status, window or category) is logged, recorded
//! in the report and skipped; a strategy counts as failed only when every
//! sub-query it issued failed. A failing strategy never stops the others.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::marketplace::{MarketplaceApi, SearchQuery};

/// Item statuses the seller search accepts
pub const ITEM_STATUSES: [&str; 6] = [
    "active",
    "paused",
    "closed",
    "sold",
    "under_review",
    "payment_required",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Status,
    TimeWindow,
    Category,
    Scan,
}

impl Strategy {
    pub fn all() -> &'static [Strategy] {
        &[
            Strategy::Status,
            Strategy::TimeWindow,
            Strategy::Category,
            Strategy::Scan,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Status => "status",
            Strategy::TimeWindow => "time",
            Strategy::Category => "category",
            Strategy::Scan => "scan",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "status" => Ok(Strategy::Status),
            "time" | "time_window" => Ok(Strategy::TimeWindow),
            "category" => Ok(Strategy::Category),
            "scan" | "scroll" => Ok(Strategy::Scan),
            other => Err(SyncError::Config(format!("unknown collection strategy '{other}'"))),
        }
    }
}

/// What one strategy contributed
#[derive(Debug, Clone, Serialize)]
pub struct StrategyOutcome {
    pub strategy: Strategy,
    /// Identifiers returned, duplicates included
    pub found: usize,
    /// Identifiers not seen by an earlier strategy
    pub new: usize,
    /// Set when every sub-query of the strategy failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failed sub-queries as `label: error`
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_partitions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionReport {
    /// Deduplicated identifiers in discovery order
    pub ids: Vec<String>,
    pub outcomes: Vec<StrategyOutcome>,
    /// Sum of the totals the status queries reported, when that strategy ran
    pub reported_total: Option<u64>,
    /// Collection stopped at the item cap
    pub truncated: bool,
}

impl CollectionReport {
    pub fn failed_strategies(&self) -> Vec<Strategy> {
        self.outcomes
            .iter()
            .filter(|o| o.error.is_some())
            .map(|o| o.strategy)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub strategies: Vec<Strategy>,
    pub page_size: u32,
    pub offset_ceiling: u32,
    pub lookback_days: i64,
    pub window_days: i64,
    pub category_sample_size: usize,
}

impl From<&SyncConfig> for CollectorSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            strategies: config.strategies.clone(),
            page_size: config.page_size,
            offset_ceiling: config.offset_ceiling,
            lookback_days: config.lookback_days,
            window_days: config.window_days,
            category_sample_size: config.category_sample_size,
        }
    }
}

/// Ordered, capped identifier union with per-strategy tallies
struct IdSet {
    ids: Vec<String>,
    seen: HashSet<String>,
    cap: Option<usize>,
    found: usize,
    new: usize,
    failed: Vec<String>,
}

impl IdSet {
    fn new(cap: Option<usize>) -> Self {
        Self {
            ids: Vec::new(),
            seen: HashSet::new(),
            cap,
            found: 0,
            new: 0,
            failed: Vec::new(),
        }
    }

    fn begin_strategy(&mut self) {
        self.found = 0;
        self.new = 0;
        self.failed.clear();
    }

    fn extend(&mut self, ids: Vec<String>) {
        for id in ids {
            self.found += 1;
            if self.is_full() {
                continue;
            }
            if self.seen.insert(id.clone()) {
                self.ids.push(id);
                self.new += 1;
            }
        }
    }

    fn is_full(&self) -> bool {
        self.cap.is_some_and(|cap| self.ids.len() >= cap)
    }
}

/// Sub-query bookkeeping for one strategy
#[derive(Default)]
struct Partitions {
    attempted: usize,
    failed: usize,
    last_error: Option<SyncError>,
}

impl Partitions {
    /// Keep the value of a successful sub-query; log and record a failed one
    fn record<T>(&mut self, label: &str, set: &mut IdSet, result: Result<T>) -> Option<T> {
        self.attempted += 1;
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("{} failed, moving on to the next partition: {}", label, e);
                self.failed += 1;
                set.failed.push(format!("{}: {}", label, e));
                self.last_error = Some(e);
                None
            }
        }
    }

    /// The strategy fails only when every sub-query it issued failed
    fn finish(self) -> Result<()> {
        match self.last_error {
            Some(e) if self.failed == self.attempted => Err(e),
            _ => Ok(()),
        }
    }
}

pub struct Collector {
    api: Arc<dyn MarketplaceApi>,
    clock: Arc<dyn Clock>,
    settings: CollectorSettings,
}

impl Collector {
    pub fn new(
        api: Arc<dyn MarketplaceApi>,
        clock: Arc<dyn Clock>,
        settings: CollectorSettings,
    ) -> Self {
        Self {
            api,
            clock,
            settings,
        }
    }

    /// Union of every enabled strategy, deduplicated and capped at `max_items`
    pub async fn collect(&self, max_items: Option<usize>) -> CollectionReport {
        let mut set = IdSet::new(max_items);
        let mut report = CollectionReport::default();

        for &strategy in &self.settings.strategies {
            if set.is_full() {
                log::info!("Item cap reached, skipping strategy {}", strategy);
                break;
            }

            set.begin_strategy();
            let result = match strategy {
                Strategy::Status => self.by_status(&mut set).await.map(|total| {
                    report.reported_total = Some(total);
                }),
                Strategy::TimeWindow => self.by_time_window(&mut set).await,
                Strategy::Category => self.by_category(&mut set).await,
                Strategy::Scan => self.by_scan(&mut set).await,
            };
            report.outcomes.push(self.outcome(strategy, &set, result));
        }

        report.truncated = set.is_full();
        report.ids = set.ids;
        log::info!(
            "Collected {} unique item ids from {} strategies{}",
            report.ids.len(),
            report.outcomes.len(),
            if report.truncated { " (capped)" } else { "" }
        );
        report
    }

    /// Items created since `since`, one paged query per status
    pub async fn collect_since(
        &self,
        since: DateTime<Utc>,
        max_items: Option<usize>,
    ) -> CollectionReport {
        let mut set = IdSet::new(max_items);
        let until = self.clock.now();
        let api = self.api.as_ref();

        let mut total = 0u64;
        let mut partitions = Partitions::default();
        for status in ITEM_STATUSES {
            if set.is_full() {
                break;
            }
            let label = format!("status={} since={}", status, since);
            let fetched = self
                .paginate(&label, &mut set, move |offset, limit| {
                    let query = SearchQuery::page(offset, limit)
                        .with_status(status)
                        .with_window(since, Some(until));
                    async move {
                        api.search_seller_items(&query)
                            .await
                            .map(|page| (page.results, page.paging.total))
                    }
                })
                .await;
            if let Some(reported) = partitions.record(&label, &mut set, fetched) {
                total += reported;
            }
        }

        let outcome = self.outcome(Strategy::TimeWindow, &set, partitions.finish());
        CollectionReport {
            truncated: set.is_full(),
            ids: set.ids,
            outcomes: vec![outcome],
            reported_total: Some(total),
        }
    }

    fn outcome(&self, strategy: Strategy, set: &IdSet, result: Result<()>) -> StrategyOutcome {
        let error = match result {
            Ok(()) => {
                log::info!(
                    "Strategy {}: {} ids found, {} new (union {}), {} sub-queries failed",
                    strategy,
                    set.found,
                    set.new,
                    set.ids.len(),
                    set.failed.len()
                );
                None
            }
            Err(e) => {
                log::warn!(
                    "Strategy {} failed after {} ids ({} new): {}",
                    strategy,
                    set.found,
                    set.new,
                    e
                );
                Some(e.to_string())
            }
        };
        StrategyOutcome {
            strategy,
            found: set.found,
            new: set.new,
            error,
            failed_partitions: set.failed.clone(),
        }
    }

    // ── Strategies ─────────────────────────────────────────────────────

    /// Returns the sum of the per-status totals the marketplace reported
    async fn by_status(&self, set: &mut IdSet) -> Result<u64> {
        let api = self.api.as_ref();
        let mut total = 0;
        let mut partitions = Partitions::default();
        for status in ITEM_STATUSES {
            let label = format!("status={}", status);
            let fetched = self
                .paginate(&label, set, move |offset, limit| {
                    let query = SearchQuery::page(offset, limit).with_status(status);
                    async move {
                        api.search_seller_items(&query)
                            .await
                            .map(|page| (page.results, page.paging.total))
                    }
                })
                .await;
            if let Some(reported) = partitions.record(&label, set, fetched) {
                total += reported;
            }
            if set.is_full() {
                break;
            }
        }
        partitions.finish()?;
        Ok(total)
    }

    async fn by_time_window(&self, set: &mut IdSet) -> Result<()> {
        let api = self.api.as_ref();
        let now = self.clock.now();
        let oldest = now - Duration::days(self.settings.lookback_days);
        let step = Duration::days(self.settings.window_days.max(1));

        let mut partitions = Partitions::default();
        let mut window_end = now;
        while window_end > oldest && !set.is_full() {
            let window_start = (window_end - step).max(oldest);
            let label = format!(
                "window {}..{}",
                window_start.format("%Y-%m-%d"),
                window_end.format("%Y-%m-%d")
            );
            let fetched = self
                .paginate(&label, set, move |offset, limit| {
                    let query = SearchQuery::page(offset, limit)
                        .with_window(window_start, Some(window_end));
                    async move {
                        api.search_seller_items(&query)
                            .await
                            .map(|page| (page.results, page.paging.total))
                    }
                })
                .await;
            partitions.record(&label, set, fetched);
            window_end = window_start;
        }
        partitions.finish()
    }

    async fn by_category(&self, set: &mut IdSet) -> Result<()> {
        let api = self.api.as_ref();
        let sample_query = SearchQuery::page(0, self.settings.page_size)
            .with_status("active")
            .with_sort("relevance");
        let sample = api.search_seller_items(&sample_query).await?;

        let mut categories: Vec<String> = Vec::new();
        for id in sample.results.iter().take(self.settings.category_sample_size) {
            match api.item_detail(id).await {
                Ok(detail) => {
                    if let Some(category) = detail.category_id.filter(|c| !c.is_empty()) {
                        if !categories.contains(&category) {
                            categories.push(category);
                        }
                    }
                }
                Err(e) => log::debug!("Category sample {} skipped: {}", id, e),
            }
        }
        set.extend(sample.results);
        log::info!("Discovered {} categories from the sample", categories.len());

        let mut partitions = Partitions::default();
        for category in &categories {
            if set.is_full() {
                break;
            }
            let category: &str = category;
            let label = format!("category={}", category);
            let fetched = self
                .paginate(&label, set, move |offset, limit| async move {
                    api.search_site_category(category, offset, limit)
                        .await
                        .map(|page| {
                            let total = page.paging.total;
                            (page.into_ids(), total)
                        })
                })
                .await;
            partitions.record(&label, set, fetched);
        }
        partitions.finish()
    }

    /// Follows the scan cursor; any failure means the mode is unavailable
    async fn by_scan(&self, set: &mut IdSet) -> Result<()> {
        let mut scroll_id: Option<String> = None;
        let mut pages = 0usize;

        while !set.is_full() {
            let query = SearchQuery::scan(self.settings.page_size, scroll_id.clone());
            let page = self.api.search_seller_items(&query).await.map_err(|e| {
                log::info!("Scan mode unavailable after {} pages: {}", pages, e);
                e
            })?;
            pages += 1;
            if page.results.is_empty() {
                break;
            }
            set.extend(page.results);

            match page.scroll_id {
                Some(next) if scroll_id.as_deref() != Some(next.as_str()) => scroll_id = Some(next),
                _ => break,
            }
        }
        log::debug!("Scan finished after {} pages", pages);
        Ok(())
    }

    /// Page through one query up to the offset ceiling; returns the reported total
    async fn paginate<F, Fut>(&self, label: &str, set: &mut IdSet, mut fetch: F) -> Result<u64>
    where
        F: FnMut(u32, u32) -> Fut,
        Fut: Future<Output = Result<(Vec<String>, u64)>>,
    {
        let limit = self.settings.page_size;
        let mut offset = 0u32;
        let mut reported = 0u64;

        while offset + limit <= self.settings.offset_ceiling && !set.is_full() {
            let (ids, total) = fetch(offset, limit).await?;
            if offset == 0 {
                reported = total;
            }
            let count = ids.len();
            if count == 0 {
                break;
            }
            set.extend(ids);
            offset += limit;
            if u64::from(offset) >= total || count < limit as usize {
                break;
            }
        }

        if reported > u64::from(self.settings.offset_ceiling) {
            log::warn!(
                "{}: {} items reported, only {} reachable through offsets",
                label,
                reported,
                self.settings.offset_ceiling
            );
        } else {
            log::debug!("{}: {} items reported", label, reported);
        }
        Ok(reported)
    }
}

#[cfg(test)]
#[path = "collector_tests.rs"]
mod tests;
