//! Database setup for meli_sync
//!
//! Uses parameterized queries exclusively (no SQL string concatenation).
//! Every multi-row write runs inside a transaction so a crash never leaves
//! half-applied state behind.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Result type for database operations
pub type DbResult<T> = rusqlite::Result<T>;

/// Connection shared by every component of the process
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Initialize the database schema
///
/// Creates tables if they don't exist:
/// - `credentials`: singleton OAuth credential
/// - `item_snapshots`: last known content hash per remote item
/// - `sync_job`: singleton job record, the resumability checkpoint
/// - `sync_queue`: ordered identifier list collected for the current job
/// - `products`: local catalog fed by the sync
pub fn init_schema(conn: &Connection) -> DbResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS credentials (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            access_token TEXT NOT NULL,
            refresh_token TEXT,
            token_type TEXT NOT NULL,
            scope TEXT,
            expires_at TEXT NOT NULL,
            subject_id TEXT,
            invalid INTEGER NOT NULL DEFAULT 0,
            issued_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- One row per remote item; (sku, external_id) is the identity
        CREATE TABLE IF NOT EXISTS item_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sku TEXT NOT NULL,
            external_id TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            remote_status TEXT NOT NULL,
            first_seen_at TEXT NOT NULL,
            last_synced_at TEXT NOT NULL,
            last_changed_at TEXT,
            raw_payload_excerpt TEXT,
            UNIQUE (sku, external_id)
        );

        CREATE INDEX IF NOT EXISTS idx_snapshots_external_id ON item_snapshots(external_id);
        CREATE INDEX IF NOT EXISTS idx_snapshots_sku ON item_snapshots(sku);
        CREATE INDEX IF NOT EXISTS idx_snapshots_last_synced ON item_snapshots(last_synced_at);

        CREATE TABLE IF NOT EXISTS sync_job (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            status TEXT NOT NULL DEFAULT 'idle',
            mode TEXT NOT NULL DEFAULT 'full',
            total_expected INTEGER,
            processed_count INTEGER NOT NULL DEFAULT 0,
            new_count INTEGER NOT NULL DEFAULT 0,
            updated_count INTEGER NOT NULL DEFAULT 0,
            unchanged_count INTEGER NOT NULL DEFAULT 0,
            failed_count INTEGER NOT NULL DEFAULT 0,
            current_offset INTEGER NOT NULL DEFAULT 0,
            batch_size INTEGER NOT NULL DEFAULT 0,
            max_items INTEGER,
            since_hours INTEGER,
            started_at TEXT,
            finished_at TEXT,
            error_message TEXT
        );

        CREATE TABLE IF NOT EXISTS sync_queue (
            position INTEGER PRIMARY KEY,
            external_id TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS products (
            sku TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            price REAL NOT NULL,
            stock INTEGER NOT NULL,
            origin TEXT NOT NULL,
            status TEXT NOT NULL,
            images TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        ",
    )?;

    log::info!("Database schema initialized");
    Ok(())
}

/// Open (or create) the database file and make sure the schema exists
pub fn open(path: &Path) -> DbResult<Connection> {
    let conn = Connection::open(path)?;
    init_schema(&conn)?;
    log::info!("Opened database: {}", path.display());
    Ok(conn)
}

/// Wrap a connection for sharing between tasks
pub fn shared(conn: Connection) -> SharedConnection {
    Arc::new(Mutex::new(conn))
}

/// Lock the shared connection, recovering from a poisoned mutex.
///
/// Every write is transactional, so a panic while holding the lock cannot
/// leave partial rows behind.
pub fn lock(db: &SharedConnection) -> MutexGuard<'_, Connection> {
    db.lock().unwrap_or_else(|poisoned| {
        log::warn!("Database mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

#[cfg(test)]
pub(crate) fn test_db() -> SharedConnection {
    let conn = Connection::open_in_memory().unwrap();
    init_schema(&conn).unwrap();
    shared(conn)
}
