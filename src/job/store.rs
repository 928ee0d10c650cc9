//! Persistence of the job record and its identifier queue
//!
//! Free functions over a `Connection` so callers can compose them inside
//! one transaction (the batch checkpoint does).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::auth::store::parse_timestamp;
use crate::database::DbResult;
use crate::error::{Result, SyncError};
use crate::job::model::{BatchTally, JobStatus, SyncJob, SyncMode};

/// Settings fixed when a job is queued
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueuedJob {
    pub mode: SyncMode,
    pub batch_size: u32,
    pub max_items: Option<usize>,
    pub since_hours: Option<i64>,
}

/// Current job record, `idle` defaults when none was ever written
pub fn load(conn: &Connection) -> Result<SyncJob> {
    let row = conn
        .query_row(
            "SELECT status, mode, total_expected, processed_count, new_count, updated_count,
                    unchanged_count, failed_count, current_offset, batch_size, max_items,
                    since_hours, started_at, finished_at, error_message
             FROM sync_job WHERE id = 1",
            [],
            |row| {
                let started: Option<String> = row.get(12)?;
                let finished: Option<String> = row.get(13)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    SyncJob {
                        total_expected: row.get(2)?,
                        processed_count: row.get(3)?,
                        new_count: row.get(4)?,
                        updated_count: row.get(5)?,
                        unchanged_count: row.get(6)?,
                        failed_count: row.get(7)?,
                        current_offset: row.get(8)?,
                        batch_size: row.get(9)?,
                        max_items: row.get(10)?,
                        since_hours: row.get(11)?,
                        started_at: started.map(|raw| parse_timestamp(raw, 12)).transpose()?,
                        finished_at: finished.map(|raw| parse_timestamp(raw, 13)).transpose()?,
                        error_message: row.get(14)?,
                        ..SyncJob::default()
                    },
                ))
            },
        )
        .optional()?;

    match row {
        Some((status, mode, mut job)) => {
            job.status = status.parse()?;
            job.mode = mode.parse()?;
            Ok(job)
        }
        None => Ok(SyncJob::default()),
    }
}

/// Claim the singleton job: reset counters, clear the queue, status `queued`.
///
/// Runs as one immediate transaction so two concurrent starts cannot both
/// pass the busy check. Rejected with [`SyncError::JobAlreadyRunning`] while
/// a job is queued or running, leaving the record untouched.
pub fn queue(conn: &mut Connection, job: &QueuedJob, now: DateTime<Utc>) -> Result<SyncJob> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let current = load(&tx)?;
    if current.status.is_busy() {
        return Err(SyncError::JobAlreadyRunning);
    }

    tx.execute("DELETE FROM sync_queue", [])?;
    tx.execute(
        "INSERT INTO sync_job
            (id, status, mode, total_expected, processed_count, new_count, updated_count,
             unchanged_count, failed_count, current_offset, batch_size, max_items,
             since_hours, started_at, finished_at, error_message)
         VALUES (1, 'queued', ?1, NULL, 0, 0, 0, 0, 0, 0, ?2, ?3, ?4, ?5, NULL, NULL)
         ON CONFLICT(id) DO UPDATE SET
            status = 'queued',
            mode = excluded.mode,
            total_expected = NULL,
            processed_count = 0,
            new_count = 0,
            updated_count = 0,
            unchanged_count = 0,
            failed_count = 0,
            current_offset = 0,
            batch_size = excluded.batch_size,
            max_items = excluded.max_items,
            since_hours = excluded.since_hours,
            started_at = excluded.started_at,
            finished_at = NULL,
            error_message = NULL",
        params![
            job.mode.as_str(),
            job.batch_size,
            job.max_items.map(|m| i64::try_from(m).unwrap_or(i64::MAX)),
            job.since_hours,
            now.to_rfc3339(),
        ],
    )?;
    let queued = load(&tx)?;
    tx.commit()?;
    Ok(queued)
}

pub fn set_status(conn: &Connection, status: JobStatus) -> DbResult<()> {
    conn.execute(
        "UPDATE sync_job SET status = ?1, error_message = NULL, finished_at = NULL WHERE id = 1",
        params![status.as_str()],
    )?;
    Ok(())
}

/// Persist the collected identifiers in order and start the run
pub fn store_queue_and_start(conn: &mut Connection, ids: &[String]) -> DbResult<i64> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM sync_queue", [])?;
    {
        let mut insert =
            tx.prepare("INSERT INTO sync_queue (position, external_id) VALUES (?1, ?2)")?;
        for (position, id) in ids.iter().enumerate() {
            insert.execute(params![position as i64, id])?;
        }
    }
    let total = queue_len(&tx)?;
    tx.execute(
        "UPDATE sync_job SET status = 'running', total_expected = ?1, current_offset = 0
         WHERE id = 1",
        params![total],
    )?;
    tx.commit()?;
    Ok(total)
}

/// The initial count query
pub fn queue_len(conn: &Connection) -> DbResult<i64> {
    conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))
}

/// Identifiers at positions `[offset, offset + limit)`
pub fn queue_batch(conn: &Connection, offset: i64, limit: i64) -> DbResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT external_id FROM sync_queue
         WHERE position >= ?1 ORDER BY position LIMIT ?2",
    )?;
    let ids = stmt
        .query_map(params![offset, limit], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
}

/// Add a batch's counters and move the offset; part of the checkpoint transaction
pub fn checkpoint(conn: &Connection, tally: &BatchTally, new_offset: i64) -> DbResult<()> {
    conn.execute(
        "UPDATE sync_job SET
            processed_count = processed_count + ?1,
            new_count = new_count + ?2,
            updated_count = updated_count + ?3,
            unchanged_count = unchanged_count + ?4,
            failed_count = failed_count + ?5,
            current_offset = ?6
         WHERE id = 1",
        params![
            tally.processed(),
            tally.new,
            tally.updated,
            tally.unchanged,
            tally.failed,
            new_offset
        ],
    )?;
    Ok(())
}

pub fn mark_done(conn: &Connection, now: DateTime<Utc>) -> DbResult<()> {
    conn.execute(
        "UPDATE sync_job SET status = 'done', finished_at = ?1, error_message = NULL WHERE id = 1",
        params![now.to_rfc3339()],
    )?;
    Ok(())
}

pub fn mark_error(conn: &Connection, message: &str, now: DateTime<Utc>) -> DbResult<()> {
    conn.execute(
        "UPDATE sync_job SET status = 'error', finished_at = ?1, error_message = ?2 WHERE id = 1",
        params![now.to_rfc3339(), message],
    )?;
    Ok(())
}
