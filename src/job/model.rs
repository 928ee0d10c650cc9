//! Sync job record and options

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Queued,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

    /// A queued job has been claimed by a start and is about to run
    pub fn is_busy(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(JobStatus::Idle),
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "error" => Ok(JobStatus::Error),
            other => Err(SyncError::InvalidState(format!("unknown job status '{other}'"))),
        }
    }
}

/// How a run selects and forwards items
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Every collected item, forwarding new and changed ones
    #[default]
    Full,
    /// Only items created within the last `since_hours`
    Incremental,
    /// Items without a snapshot; known items are never forwarded
    NewOnly,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
            SyncMode::NewOnly => "new_only",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "full" => Ok(SyncMode::Full),
            "incremental" => Ok(SyncMode::Incremental),
            "new_only" | "new" => Ok(SyncMode::NewOnly),
            other => Err(SyncError::Config(format!("unknown sync mode '{other}'"))),
        }
    }
}

/// Largest item cap a job accepts
pub const MAX_JOB_ITEMS: usize = 10_000_000;

/// Per-start hints; unset fields fall back to the configured defaults
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOptions {
    pub mode: SyncMode,
    pub batch_size: Option<u32>,
    pub max_items: Option<usize>,
    pub since_hours: Option<i64>,
}

impl JobOptions {
    /// Reject hints a run cannot honor; `since_hours` must lie in `1..=max_since_hours`
    pub fn validate(&self, max_since_hours: i64) -> Result<(), SyncError> {
        if self.batch_size == Some(0) {
            return Err(SyncError::Config("batch_size must be positive".into()));
        }
        if let Some(limit) = self.max_items {
            if limit == 0 || limit > MAX_JOB_ITEMS {
                return Err(SyncError::Config(format!(
                    "limit must be between 1 and {MAX_JOB_ITEMS}, got {limit}"
                )));
            }
        }
        if let Some(hours) = self.since_hours {
            if !(1..=max_since_hours).contains(&hours) {
                return Err(SyncError::Config(format!(
                    "since_hours must be between 1 and {max_since_hours}, got {hours}"
                )));
            }
        }
        Ok(())
    }
}

/// Singleton job record; offset and counters are the resumability checkpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncJob {
    pub status: JobStatus,
    pub mode: SyncMode,
    pub total_expected: Option<i64>,
    /// new + updated + unchanged
    pub processed_count: i64,
    pub new_count: i64,
    pub updated_count: i64,
    pub unchanged_count: i64,
    pub failed_count: i64,
    pub current_offset: i64,
    pub batch_size: i64,
    pub max_items: Option<i64>,
    pub since_hours: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Default for SyncJob {
    fn default() -> Self {
        Self {
            status: JobStatus::Idle,
            mode: SyncMode::Full,
            total_expected: None,
            processed_count: 0,
            new_count: 0,
            updated_count: 0,
            unchanged_count: 0,
            failed_count: 0,
            current_offset: 0,
            batch_size: 0,
            max_items: None,
            since_hours: None,
            started_at: None,
            finished_at: None,
            error_message: None,
        }
    }
}

impl SyncJob {
    /// Share of the queue already checkpointed, 0-100
    pub fn progress_percent(&self) -> f64 {
        match self.total_expected {
            Some(total) if total > 0 => {
                (self.current_offset.min(total) as f64 / total as f64 * 100.0).round()
            }
            Some(_) if self.status == JobStatus::Done => 100.0,
            _ => 0.0,
        }
    }
}

/// Counter deltas of one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchTally {
    pub new: i64,
    pub updated: i64,
    pub unchanged: i64,
    pub failed: i64,
}

impl BatchTally {
    pub fn processed(&self) -> i64 {
        self.new + self.updated + self.unchanged
    }
}
