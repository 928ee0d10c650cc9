//! Resumable full-catalog sync
//!
//! State machine: `idle -> queued -> running -> {done, error}`. A start
//! claims the singleton record (`queued`); the run collects identifiers,
//! persists them as an ordered queue and walks it batch by batch. Item
//! details inside a batch are fetched concurrently; once the whole batch is
//! classified, its snapshot writes and the job counters commit together in
//! one transaction. That commit is the checkpoint a resume continues from.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Duration;
use futures::stream::{self, StreamExt};

use crate::catalog::{CatalogRecord, CatalogSink};
use crate::clock::Clock;
use crate::collector::{CollectionReport, Collector};
use crate::config::SyncConfig;
use crate::database::{self, SharedConnection};
use crate::error::{Result, SyncError};
use crate::job::model::{BatchTally, JobOptions, JobStatus, SyncJob, SyncMode};
use crate::job::store::{self, QueuedJob};
use crate::marketplace::MarketplaceApi;
use crate::snapshot::{self, Classification, SnapshotWrite};

/// Defaults applied to every start
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub batch_size: u32,
    pub detail_fan_out: usize,
    pub max_items: Option<usize>,
    pub incremental_hours: i64,
    /// Widest incremental window a start accepts
    pub max_since_hours: i64,
}

impl From<&SyncConfig> for JobSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            detail_fan_out: config.detail_fan_out,
            max_items: config.max_items,
            incremental_hours: config.incremental_hours,
            max_since_hours: config.lookback_days * 24,
        }
    }
}

struct ItemOutcome {
    classification: Classification,
    write: SnapshotWrite,
}

/// Clears the in-process run flag when a run ends, however it ends
struct ActiveRun<'a>(&'a AtomicBool);

impl<'a> ActiveRun<'a> {
    fn claim(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| SyncError::JobAlreadyRunning)?;
        Ok(Self(flag))
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct JobController {
    db: SharedConnection,
    api: Arc<dyn MarketplaceApi>,
    sink: Arc<dyn CatalogSink>,
    collector: Collector,
    clock: Arc<dyn Clock>,
    settings: JobSettings,
    active: AtomicBool,
}

impl JobController {
    pub fn new(
        db: SharedConnection,
        api: Arc<dyn MarketplaceApi>,
        sink: Arc<dyn CatalogSink>,
        collector: Collector,
        clock: Arc<dyn Clock>,
        settings: JobSettings,
    ) -> Self {
        Self {
            db,
            api,
            sink,
            collector,
            clock,
            settings,
            active: AtomicBool::new(false),
        }
    }

    /// Status read model
    pub fn status(&self) -> Result<SyncJob> {
        let conn = database::lock(&self.db);
        store::load(&conn)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Claim the job for a fresh run; counters and offset reset to zero.
    ///
    /// Fails with [`SyncError::JobAlreadyRunning`] while a job is queued or
    /// running, leaving its counters untouched, and with [`SyncError::Config`]
    /// for out-of-range options. Follow with [`Self::run`].
    pub fn start(&self, options: JobOptions) -> Result<SyncJob> {
        options.validate(self.settings.max_since_hours)?;
        if self.is_active() {
            return Err(SyncError::JobAlreadyRunning);
        }
        let queued = QueuedJob {
            mode: options.mode,
            batch_size: options.batch_size.unwrap_or(self.settings.batch_size).max(1),
            max_items: options.max_items.or(self.settings.max_items),
            since_hours: match options.mode {
                SyncMode::Incremental => {
                    Some(options.since_hours.unwrap_or(self.settings.incremental_hours))
                }
                _ => None,
            },
        };

        let mut conn = database::lock(&self.db);
        let job = store::queue(&mut conn, &queued, self.clock.now())?;
        log::info!(
            "Sync job queued (mode {}, batch size {}, max items {:?})",
            job.mode,
            job.batch_size,
            job.max_items
        );
        Ok(job)
    }

    /// Prepare an interrupted job to continue. Follow with [`Self::run`].
    ///
    /// A job left `running` (crashed process) or in `error` continues from its
    /// checkpoint over the persisted queue. A job that never got its queue is
    /// collected again.
    pub fn prepare_resume(&self) -> Result<SyncJob> {
        if self.is_active() {
            return Err(SyncError::JobAlreadyRunning);
        }
        let conn = database::lock(&self.db);
        let job = store::load(&conn)?;
        match job.status {
            JobStatus::Idle | JobStatus::Done => {
                return Err(SyncError::InvalidState(format!(
                    "nothing to resume, job is {}",
                    job.status
                )))
            }
            JobStatus::Queued => {}
            JobStatus::Running | JobStatus::Error => {
                let has_queue = job.total_expected.is_some() && store::queue_len(&conn)? > 0;
                let next = if has_queue {
                    JobStatus::Running
                } else {
                    JobStatus::Queued
                };
                store::set_status(&conn, next)?;
                log::info!(
                    "Resuming sync job at offset {}/{} ({})",
                    job.current_offset,
                    job.total_expected.unwrap_or(0),
                    next
                );
            }
        }
        store::load(&conn)
    }

    /// Start a fresh job and drive it to the end
    pub async fn sync(&self, options: JobOptions) -> Result<SyncJob> {
        self.start(options)?;
        self.run().await
    }

    /// Resume an interrupted job and drive it to the end
    pub async fn resume(&self) -> Result<SyncJob> {
        self.prepare_resume()?;
        self.run().await
    }

    /// Drive a queued or resumed job until it is done or fails.
    ///
    /// A fatal error is persisted as `status = error` with its message and
    /// returned; the checkpoint of the last completed batch is kept.
    pub async fn run(&self) -> Result<SyncJob> {
        let _run = ActiveRun::claim(&self.active)?;
        let job = self.status()?;

        let result = match job.status {
            JobStatus::Queued => match self.collect_queue(&job).await {
                Ok(()) => self.process_queue().await,
                Err(e) => Err(e),
            },
            JobStatus::Running => self.process_queue().await,
            other => {
                return Err(SyncError::InvalidState(format!(
                    "job is {}, start or resume it first",
                    other
                )))
            }
        };

        match result {
            Ok(job) => Ok(job),
            Err(e) => {
                log::error!("Sync job failed: {}", e);
                let conn = database::lock(&self.db);
                store::mark_error(&conn, &e.to_string(), self.clock.now())?;
                Err(e)
            }
        }
    }

    async fn collect_queue(&self, job: &SyncJob) -> Result<()> {
        let cap = job.max_items.map(|m| m.max(0) as usize);
        let report = match job.mode {
            SyncMode::Incremental => {
                let hours = job.since_hours.unwrap_or(self.settings.incremental_hours);
                let since = Duration::try_hours(hours)
                    .and_then(|window| self.clock.now().checked_sub_signed(window))
                    .ok_or_else(|| {
                        SyncError::Config(format!("since_hours {} is out of range", hours))
                    })?;
                log::info!("Collecting items created since {}", since);
                self.collector.collect_since(since, cap).await
            }
            SyncMode::Full | SyncMode::NewOnly => self.collector.collect(cap).await,
        };
        ensure_collected(&report)?;

        let mut conn = database::lock(&self.db);
        let total = store::store_queue_and_start(&mut conn, &report.ids)?;
        log::info!(
            "Sync job running: {} items queued (marketplace reports {})",
            total,
            report
                .reported_total
                .map_or_else(|| "unknown".to_string(), |t| t.to_string())
        );
        Ok(())
    }

    async fn process_queue(&self) -> Result<SyncJob> {
        loop {
            let job = self.status()?;
            let total = job.total_expected.unwrap_or(0);
            if job.current_offset >= total {
                break;
            }
            if job.max_items.is_some_and(|max| job.current_offset >= max) {
                log::info!("Item cap {:?} reached", job.max_items);
                break;
            }

            let ids = {
                let conn = database::lock(&self.db);
                store::queue_batch(&conn, job.current_offset, job.batch_size.max(1))?
            };
            if ids.is_empty() {
                break;
            }

            let (tally, writes) = self.process_batch(&ids, job.mode).await?;
            let new_offset = job.current_offset + ids.len() as i64;
            self.commit_batch(&tally, &writes, new_offset)?;

            log::info!(
                "Checkpoint at {}/{}: {} new, {} updated, {} unchanged, {} failed",
                new_offset,
                total,
                tally.new,
                tally.updated,
                tally.unchanged,
                tally.failed
            );
        }

        let conn = database::lock(&self.db);
        store::mark_done(&conn, self.clock.now())?;
        let job = store::load(&conn)?;
        log::info!(
            "Sync job done: {} processed ({} new, {} updated, {} unchanged), {} failed",
            job.processed_count,
            job.new_count,
            job.updated_count,
            job.unchanged_count,
            job.failed_count
        );
        Ok(job)
    }

    /// Fetch, classify and forward one batch. Nothing is persisted here.
    async fn process_batch(
        &self,
        ids: &[String],
        mode: SyncMode,
    ) -> Result<(BatchTally, Vec<SnapshotWrite>)> {
        let results: Vec<(String, Result<ItemOutcome>)> = stream::iter(ids.iter().cloned())
            .map(|id| async move {
                let outcome = self.process_item(&id, mode).await;
                (id, outcome)
            })
            .buffer_unordered(self.settings.detail_fan_out.max(1))
            .collect()
            .await;

        let mut tally = BatchTally::default();
        let mut writes = Vec::with_capacity(results.len());
        let mut fatal = None;
        for (id, outcome) in results {
            match outcome {
                Ok(outcome) => {
                    match outcome.classification {
                        Classification::New => tally.new += 1,
                        Classification::Changed => tally.updated += 1,
                        Classification::Unchanged => tally.unchanged += 1,
                    }
                    writes.push(outcome.write);
                }
                Err(e) if e.is_fatal_for_job() => {
                    log::error!("Item {} failed fatally: {}", id, e);
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    log::warn!("Item {} skipped: {}", id, e);
                    tally.failed += 1;
                }
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok((tally, writes)),
        }
    }

    async fn process_item(&self, id: &str, mode: SyncMode) -> Result<ItemOutcome> {
        let detail = self.api.item_detail(id).await?;
        let item = detail.normalize()?;
        let hash = snapshot::content_hash(&item);

        let existing = {
            let conn = database::lock(&self.db);
            snapshot::lookup(&conn, &item.sku, &item.external_id)?
        };
        let classification = snapshot::classify(existing.as_ref(), &hash, mode);
        if classification.forwards() {
            self.sink.upsert_by_sku(&CatalogRecord::from(&item)).await?;
        }

        let write = snapshot::plan_write(
            classification,
            existing.as_ref(),
            &item,
            hash,
            detail.excerpt(),
        );
        Ok(ItemOutcome {
            classification,
            write,
        })
    }

    /// The checkpoint: snapshot writes, counters and offset in one transaction
    fn commit_batch(
        &self,
        tally: &BatchTally,
        writes: &[SnapshotWrite],
        new_offset: i64,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut conn = database::lock(&self.db);
        let tx = conn.transaction()?;
        for write in writes {
            snapshot::apply(&tx, write, now)?;
        }
        store::checkpoint(&tx, tally, new_offset)?;
        tx.commit()?;
        Ok(())
    }
}

/// Fail the run when every strategy failed; an empty but healthy collection is fine
fn ensure_collected(report: &CollectionReport) -> Result<()> {
    let failed = report.failed_strategies();
    let all_failed = !report.outcomes.is_empty() && failed.len() == report.outcomes.len();
    if report.ids.is_empty() && all_failed {
        let reasons: Vec<String> = report
            .outcomes
            .iter()
            .filter_map(|o| o.error.as_ref().map(|e| format!("{}: {}", o.strategy, e)))
            .collect();
        return Err(SyncError::InvalidState(format!(
            "every collection strategy failed ({})",
            reasons.join("; ")
        )));
    }
    Ok(())
}

#[cfg(test)]
#[path = "controller_tests.rs"]
mod tests;
