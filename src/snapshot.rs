//! Change detection over item snapshots
//!
//! Each remote item keeps one snapshot row holding the content hash of its
//! last synced state. Comparing a fresh hash against it classifies the item
//! as new, changed or unchanged, so unchanged items never reach the catalog.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::auth::store::parse_timestamp;
use crate::database::DbResult;
use crate::job::SyncMode;
use crate::marketplace::NormalizedItem;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemSnapshot {
    pub id: i64,
    pub sku: String,
    pub external_id: String,
    pub content_hash: String,
    pub remote_status: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>,
    pub last_changed_at: Option<DateTime<Utc>>,
    pub raw_payload_excerpt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    New,
    Changed,
    Unchanged,
}

impl Classification {
    /// Whether the item goes to the catalog sink
    pub fn forwards(&self) -> bool {
        !matches!(self, Classification::Unchanged)
    }
}

/// Snapshot mutation decided while processing a batch, applied at its checkpoint
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotWrite {
    New {
        sku: String,
        external_id: String,
        content_hash: String,
        remote_status: String,
        excerpt: String,
    },
    Changed {
        id: i64,
        content_hash: String,
        remote_status: String,
        excerpt: String,
    },
    Unchanged {
        id: i64,
    },
}

/// SHA-256 over the fields that matter to the catalog.
///
/// Image order, surrounding whitespace and counters outside the field set
/// do not influence the result. Prices are formatted with two decimals.
/// Every field is length-prefixed, so no field value can spill into the next.
pub fn content_hash(item: &NormalizedItem) -> String {
    let mut images: Vec<&str> = item
        .images
        .iter()
        .map(|url| url.trim())
        .filter(|url| !url.is_empty())
        .collect();
    images.sort_unstable();

    let price = format!("{:.2}", item.price);
    let fields = [
        item.title.trim(),
        item.description.trim(),
        price.as_str(),
        item.remote_status.trim(),
        item.category.trim(),
        item.condition.trim(),
    ];

    let mut hasher = Sha256::new();
    for field in fields {
        hash_field(&mut hasher, field);
    }
    hasher.update((images.len() as u64).to_be_bytes());
    for url in images {
        hash_field(&mut hasher, url);
    }
    hex::encode(hasher.finalize())
}

fn hash_field(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value.as_bytes());
}

/// Decide what a freshly fetched item means relative to its snapshot
pub fn classify(existing: Option<&ItemSnapshot>, hash: &str, mode: SyncMode) -> Classification {
    match existing {
        None => Classification::New,
        Some(_) if mode == SyncMode::NewOnly => Classification::Unchanged,
        Some(snapshot) if snapshot.content_hash == hash => Classification::Unchanged,
        Some(_) => Classification::Changed,
    }
}

/// Snapshot write matching a classification
pub fn plan_write(
    classification: Classification,
    existing: Option<&ItemSnapshot>,
    item: &NormalizedItem,
    hash: String,
    excerpt: String,
) -> SnapshotWrite {
    match (classification, existing) {
        (Classification::Unchanged, Some(snapshot)) => SnapshotWrite::Unchanged { id: snapshot.id },
        (Classification::Changed, Some(snapshot)) => SnapshotWrite::Changed {
            id: snapshot.id,
            content_hash: hash,
            remote_status: item.remote_status.clone(),
            excerpt,
        },
        _ => SnapshotWrite::New {
            sku: item.sku.clone(),
            external_id: item.external_id.clone(),
            content_hash: hash,
            remote_status: item.remote_status.clone(),
            excerpt,
        },
    }
}

// ── Lookups ────────────────────────────────────────────────────────────

const SNAPSHOT_COLUMNS: &str = "id, sku, external_id, content_hash, remote_status, first_seen_at,
     last_synced_at, last_changed_at, raw_payload_excerpt";

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<ItemSnapshot> {
    let last_changed: Option<String> = row.get(7)?;
    Ok(ItemSnapshot {
        id: row.get(0)?,
        sku: row.get(1)?,
        external_id: row.get(2)?,
        content_hash: row.get(3)?,
        remote_status: row.get(4)?,
        first_seen_at: parse_timestamp(row.get(5)?, 5)?,
        last_synced_at: parse_timestamp(row.get(6)?, 6)?,
        last_changed_at: last_changed.map(|raw| parse_timestamp(raw, 7)).transpose()?,
        raw_payload_excerpt: row.get(8)?,
    })
}

/// Exact identity lookup
pub fn lookup(conn: &Connection, sku: &str, external_id: &str) -> DbResult<Option<ItemSnapshot>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM item_snapshots WHERE sku = ?1 AND external_id = ?2",
            SNAPSHOT_COLUMNS
        ),
        params![sku, external_id],
        snapshot_from_row,
    )
    .optional()
}

/// Most recently synced snapshot for a marketplace id
pub fn lookup_by_external_id(
    conn: &Connection,
    external_id: &str,
) -> DbResult<Option<ItemSnapshot>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM item_snapshots WHERE external_id = ?1
             ORDER BY last_synced_at DESC LIMIT 1",
            SNAPSHOT_COLUMNS
        ),
        params![external_id],
        snapshot_from_row,
    )
    .optional()
}

/// Most recently synced snapshot for a local SKU
pub fn lookup_by_sku(conn: &Connection, sku: &str) -> DbResult<Option<ItemSnapshot>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM item_snapshots WHERE sku = ?1
             ORDER BY last_synced_at DESC LIMIT 1",
            SNAPSHOT_COLUMNS
        ),
        params![sku],
        snapshot_from_row,
    )
    .optional()
}

pub fn count(conn: &Connection) -> DbResult<i64> {
    conn.query_row("SELECT COUNT(*) FROM item_snapshots", [], |row| row.get(0))
}

// ── Writes ─────────────────────────────────────────────────────────────

/// Insert the first snapshot of an item; fails on a duplicate identity
pub fn record_new(
    conn: &Connection,
    sku: &str,
    external_id: &str,
    content_hash: &str,
    remote_status: &str,
    excerpt: &str,
    now: DateTime<Utc>,
) -> DbResult<i64> {
    let ts = now.to_rfc3339();
    conn.execute(
        "INSERT INTO item_snapshots
            (sku, external_id, content_hash, remote_status, first_seen_at,
             last_synced_at, last_changed_at, raw_payload_excerpt)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?5, ?6)",
        params![sku, external_id, content_hash, remote_status, ts, excerpt],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Touch `last_synced_at` only
pub fn mark_unchanged(conn: &Connection, id: i64, now: DateTime<Utc>) -> DbResult<()> {
    conn.execute(
        "UPDATE item_snapshots SET last_synced_at = ?1 WHERE id = ?2",
        params![now.to_rfc3339(), id],
    )?;
    Ok(())
}

pub fn record_changed(
    conn: &Connection,
    id: i64,
    content_hash: &str,
    remote_status: &str,
    excerpt: &str,
    now: DateTime<Utc>,
) -> DbResult<()> {
    let ts = now.to_rfc3339();
    conn.execute(
        "UPDATE item_snapshots
         SET content_hash = ?1, remote_status = ?2, last_synced_at = ?3,
             last_changed_at = ?3, raw_payload_excerpt = ?4
         WHERE id = ?5",
        params![content_hash, remote_status, ts, excerpt, id],
    )?;
    Ok(())
}

pub fn apply(conn: &Connection, write: &SnapshotWrite, now: DateTime<Utc>) -> DbResult<()> {
    match write {
        SnapshotWrite::New {
            sku,
            external_id,
            content_hash,
            remote_status,
            excerpt,
        } => {
            record_new(conn, sku, external_id, content_hash, remote_status, excerpt, now)?;
            Ok(())
        }
        SnapshotWrite::Changed {
            id,
            content_hash,
            remote_status,
            excerpt,
        } => record_changed(conn, *id, content_hash, remote_status, excerpt, now),
        SnapshotWrite::Unchanged { id } => mark_unchanged(conn, *id, now),
    }
}
