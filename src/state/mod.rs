//! Persistent version registry (`<data_dir>/versions.db`).

use crate::{Result, WardenError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// One known runtime version on one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    pub id: String,
    pub platform: String,
    pub path: Option<PathBuf>,
    pub checksum: Option<String>,
    pub size: Option<u64>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub is_bundled: bool,
}

impl VersionRecord {
    /// Placeholder for a version that exists upstream but is not installed.
    pub fn available(id: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            platform: platform.into(),
            path: None,
            checksum: None,
            size: None,
            downloaded_at: None,
            is_active: false,
            is_bundled: false,
        }
    }

    /// Whether the recorded binary is still present on disk.
    pub fn binary_exists(&self) -> bool {
        self.path.as_ref().is_some_and(|p| p.is_file())
    }
}

/// SQLite-backed version registry, scoped to one platform key.
///
/// The connection sits behind a mutex so the store can be shared between the
/// downloader, the activator and the binary locator.
pub struct VersionStore {
    db_path: PathBuf,
    platform: String,
    conn: Mutex<Connection>,
}

const SELECT_COLUMNS: &str =
    "id, platform, path, checksum, size, downloaded_at, is_active, is_bundled";

impl VersionStore {
    pub fn open(db_path: impl AsRef<Path>, platform: impl Into<String>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&db_path)?;
        Self::with_connection(conn, db_path, platform.into())
    }

    /// In-memory store, used by tests and dry runs.
    pub fn open_in_memory(platform: impl Into<String>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, PathBuf::from(":memory:"), platform.into())
    }

    fn with_connection(conn: Connection, db_path: PathBuf, platform: String) -> Result<Self> {
        let store = Self {
            db_path,
            platform,
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| WardenError::State("version registry lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS schema_migrations (
              version INTEGER PRIMARY KEY,
              applied_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS versions (
              id TEXT NOT NULL,
              platform TEXT NOT NULL,
              path TEXT,
              checksum TEXT,
              size INTEGER,
              downloaded_at TEXT,
              is_active INTEGER NOT NULL DEFAULT 0,
              is_bundled INTEGER NOT NULL DEFAULT 0,
              PRIMARY KEY (id, platform)
            );
            "#,
        )?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES(1, ?1)",
            [Utc::now().to_rfc3339()],
        )?;

        Ok(())
    }

    /// Insert or refresh a version row.
    ///
    /// `is_active` of an existing row is left alone (activation only goes
    /// through [`VersionStore::set_active_exclusive`]) and `is_bundled` never
    /// flips back to false.
    pub fn upsert_version(&self, record: &VersionRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO versions (
              id, platform, path, checksum, size, downloaded_at, is_active, is_bundled
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)
            ON CONFLICT(id, platform) DO UPDATE SET
              path = excluded.path,
              checksum = excluded.checksum,
              size = excluded.size,
              downloaded_at = excluded.downloaded_at,
              is_bundled = MAX(versions.is_bundled, excluded.is_bundled)
            "#,
            params![
                record.id,
                self.platform,
                record.path.as_ref().map(|p| p.to_string_lossy().to_string()),
                record.checksum,
                record.size.map(|s| s as i64),
                record.downloaded_at.map(|t| t.to_rfc3339()),
                record.is_bundled,
            ],
        )?;

        Ok(())
    }

    pub fn get_version(&self, id: &str) -> Result<Option<VersionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM versions WHERE id = ?1 AND platform = ?2",
            SELECT_COLUMNS
        ))?;

        let row = stmt
            .query_row(params![id, self.platform], record_from_row)
            .optional()?;

        Ok(row)
    }

    pub fn get_active_version(&self) -> Result<Option<VersionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM versions WHERE is_active = 1 AND platform = ?1",
            SELECT_COLUMNS
        ))?;

        let row = stmt
            .query_row(params![self.platform], record_from_row)
            .optional()?;

        Ok(row)
    }

    /// All rows for this platform, newest version first.
    pub fn list_versions(&self) -> Result<Vec<VersionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM versions WHERE platform = ?1",
            SELECT_COLUMNS
        ))?;

        let rows = stmt.query_map(params![self.platform], record_from_row)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        out.sort_by(|a, b| crate::versions::compare_versions(&b.id, &a.id));
        Ok(out)
    }

    /// Delete a row, refusing active or bundled versions without mutating.
    pub fn delete_version(&self, id: &str) -> Result<VersionRecord> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let record = tx
            .query_row(
                &format!(
                    "SELECT {} FROM versions WHERE id = ?1 AND platform = ?2",
                    SELECT_COLUMNS
                ),
                params![id, self.platform],
                record_from_row,
            )
            .optional()?
            .ok_or_else(|| WardenError::NotFound(format!("version {}", id)))?;

        if record.is_active || record.is_bundled {
            return Err(WardenError::Guarded(id.to_string()));
        }

        tx.execute(
            "DELETE FROM versions WHERE id = ?1 AND platform = ?2",
            params![id, self.platform],
        )?;
        tx.commit()?;

        Ok(record)
    }

    /// Make `id` the only active row, in a single transaction.
    pub fn set_active_exclusive(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "UPDATE versions SET is_active = 0 WHERE platform = ?1 AND is_active = 1",
            params![self.platform],
        )?;
        let updated = tx.execute(
            "UPDATE versions SET is_active = 1 WHERE id = ?1 AND platform = ?2",
            params![id, self.platform],
        )?;

        if updated == 0 {
            // dropping the transaction rolls back the clear
            return Err(WardenError::NotFound(format!("version {}", id)));
        }

        tx.commit()?;
        Ok(())
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<VersionRecord> {
    let downloaded_at: Option<String> = row.get(5)?;
    Ok(VersionRecord {
        id: row.get(0)?,
        platform: row.get(1)?,
        path: row.get::<_, Option<String>>(2)?.map(PathBuf::from),
        checksum: row.get(3)?,
        size: row.get::<_, Option<i64>>(4)?.map(|s| s as u64),
        downloaded_at: downloaded_at
            .as_deref()
            .map(parse_rfc3339)
            .transpose()
            .map_err(to_sql_err)?,
        is_active: row.get(6)?,
        is_bundled: row.get(7)?,
    })
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| WardenError::State(format!("invalid timestamp '{}': {}", value, e)))
}

fn to_sql_err(err: WardenError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(err))
}
