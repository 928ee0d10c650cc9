//! Durable storage for the singleton credential

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::auth::credential::Credential;
use crate::database::{self, DbResult, SharedConnection};

/// Persists the credential row (`credentials.id = 1`).
///
/// Every operation is a single statement, so each one is its own critical
/// section on the shared connection.
#[derive(Clone)]
pub struct CredentialStore {
    db: SharedConnection,
}

impl CredentialStore {
    pub fn new(db: SharedConnection) -> Self {
        Self { db }
    }

    pub fn load(&self) -> DbResult<Option<Credential>> {
        let conn = database::lock(&self.db);
        load_credential(&conn)
    }

    /// Replace the stored credential (insert or overwrite; never deleted)
    pub fn save(&self, credential: &Credential) -> DbResult<()> {
        let conn = database::lock(&self.db);
        conn.execute(
            "INSERT INTO credentials
                (id, access_token, refresh_token, token_type, scope, expires_at,
                 subject_id, invalid, issued_at, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                token_type = excluded.token_type,
                scope = excluded.scope,
                expires_at = excluded.expires_at,
                subject_id = excluded.subject_id,
                invalid = excluded.invalid,
                issued_at = excluded.issued_at,
                updated_at = excluded.updated_at",
            params![
                &credential.access_token,
                &credential.refresh_token,
                &credential.token_type,
                &credential.scope,
                credential.expires_at.to_rfc3339(),
                &credential.subject_id,
                credential.invalid,
                credential.issued_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Flag the credential as rejected by the marketplace
    pub fn mark_invalid(&self) -> DbResult<bool> {
        let conn = database::lock(&self.db);
        let updated = conn.execute(
            "UPDATE credentials SET invalid = 1, updated_at = ?1 WHERE id = 1",
            params![Utc::now().to_rfc3339()],
        )?;
        Ok(updated > 0)
    }
}

fn load_credential(conn: &Connection) -> DbResult<Option<Credential>> {
    conn.query_row(
        "SELECT access_token, refresh_token, token_type, scope, expires_at,
                subject_id, invalid, issued_at
         FROM credentials WHERE id = 1",
        [],
        |row| {
            Ok(Credential {
                access_token: row.get(0)?,
                refresh_token: row.get(1)?,
                token_type: row.get(2)?,
                scope: row.get(3)?,
                expires_at: parse_timestamp(row.get::<_, String>(4)?, 4)?,
                subject_id: row.get(5)?,
                invalid: row.get(6)?,
                issued_at: parse_timestamp(row.get::<_, String>(7)?, 7)?,
            })
        },
    )
    .optional()
}

/// Parse an RFC 3339 column into UTC
pub(crate) fn parse_timestamp(raw: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}
