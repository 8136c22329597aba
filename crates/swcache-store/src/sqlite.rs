//! SQLite-backed response store.
//!
//! One database file holds every generation. Several processes may open the
//! same file; SQLite's own locking (WAL plus a busy timeout) serializes their
//! writes, and each call here is a single statement or transaction.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, HeaderName, HeaderValue};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, info, trace};
use url::Url;

use crate::{RequestIdentity, ResponseStore, StoreError, StoredResponse};

/// Database schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// How long a writer waits for another process holding the lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A [`ResponseStore`] persisted in a SQLite file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        init_database(&conn)?;

        info!(path = %path.display(), "Opened response store");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_database(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Location on disk, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current schema version of the open database.
    pub fn schema_version(&self) -> Result<i32, StoreError> {
        let conn = self.lock()?;
        Ok(read_schema_version(&conn)?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").field("path", &self.path).finish()
    }
}

// ==================== Schema ====================

/// Prepare the connection and bring the schema up to date.
fn init_database(conn: &Connection) -> Result<(), StoreError> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    let version = read_schema_version(conn)?;
    if version < SCHEMA_VERSION {
        migrate_database(conn, version)?;
    }
    Ok(())
}

fn read_schema_version(conn: &Connection) -> Result<i32, rusqlite::Error> {
    let table_exists: bool = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |row| row.get::<_, i32>(0).map(|count| count > 0),
    )?;

    if !table_exists {
        return Ok(0);
    }

    Ok(conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0))
}

/// Run database migrations
fn migrate_database(conn: &Connection, from_version: i32) -> Result<(), StoreError> {
    if from_version < 1 {
        create_schema_v1(conn)?;
    }
    Ok(())
}

/// Create initial schema (version 1)
fn create_schema_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            applied_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS generations (
            name TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entries (
            generation TEXT NOT NULL
                REFERENCES generations(name) ON DELETE CASCADE ON UPDATE CASCADE,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            status INTEGER NOT NULL,
            headers BLOB NOT NULL,
            body BLOB NOT NULL,
            opaque INTEGER NOT NULL,
            stored_at INTEGER NOT NULL,
            PRIMARY KEY (generation, method, url)
        );
        "#,
    )?;

    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
        params![1, Utc::now().timestamp()],
    )?;

    debug!(version = 1, "Created response store schema");
    Ok(())
}

// ==================== Encoding ====================

/// Serialize headers as an HTTP/1 header block, one `name: value\r\n` per
/// header, preserving order and duplicates byte for byte.
fn encode_headers(headers: &HeaderMap) -> Vec<u8> {
    let mut block = Vec::new();
    for (name, value) in headers.iter() {
        block.extend_from_slice(name.as_str().as_bytes());
        block.extend_from_slice(b": ");
        block.extend_from_slice(value.as_bytes());
        block.extend_from_slice(b"\r\n");
    }
    block
}

fn decode_headers(block: &[u8]) -> Result<HeaderMap, StoreError> {
    let mut headers = HeaderMap::new();
    for line in block.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }

        let colon = line
            .iter()
            .position(|b| *b == b':')
            .ok_or_else(|| StoreError::Corrupt("header line without ':'".to_string()))?;
        let value = &line[colon + 1..];
        let value = value.strip_prefix(b" ").unwrap_or(value);

        let name = HeaderName::from_bytes(&line[..colon])
            .map_err(|e| StoreError::Corrupt(format!("header name: {e}")))?;
        let value =
            HeaderValue::from_bytes(value).map_err(|e| StoreError::Corrupt(format!("header value: {e}")))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Map a write failure, surfacing a full disk as a quota error.
fn map_write_error(error: rusqlite::Error) -> StoreError {
    match error.sqlite_error_code() {
        Some(ErrorCode::DiskFull) => StoreError::QuotaExceeded(error.to_string()),
        _ => StoreError::Sqlite(error),
    }
}

// ==================== ResponseStore ====================

impl ResponseStore for SqliteStore {
    fn get(&self, generation: &str, identity: &RequestIdentity) -> Result<Option<StoredResponse>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT status, headers, body, opaque, stored_at FROM entries
                 WHERE generation = ?1 AND method = ?2 AND url = ?3",
                params![generation, identity.method(), identity.url().as_str()],
                |row| {
                    Ok((
                        row.get::<_, u16>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((status, headers, body, opaque, stored_at)) => Ok(Some(StoredResponse {
                status,
                headers: decode_headers(&headers)?,
                body: Bytes::from(body),
                opaque,
                stored_at,
            })),
            None => Ok(None),
        }
    }

    fn put(&self, generation: &str, identity: &RequestIdentity, response: &StoredResponse) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(map_write_error)?;

        let exists: bool = tx.query_row(
            "SELECT COUNT(*) FROM generations WHERE name = ?1",
            params![generation],
            |row| row.get::<_, i32>(0).map(|count| count > 0),
        )?;
        if !exists {
            return Err(StoreError::UnknownGeneration(generation.to_string()));
        }

        tx.execute(
            "INSERT OR REPLACE INTO entries
                (generation, method, url, status, headers, body, opaque, stored_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                generation,
                identity.method(),
                identity.url().as_str(),
                response.status,
                encode_headers(&response.headers),
                response.body.as_ref(),
                response.opaque,
                response.stored_at,
            ],
        )
        .map_err(map_write_error)?;

        tx.commit().map_err(map_write_error)?;
        trace!(generation, %identity, "Stored response");
        Ok(())
    }

    fn create_generation(&self, name: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO generations (name, created_at) VALUES (?1, ?2)",
            params![name, Utc::now().timestamp()],
        )
        .map_err(map_write_error)?;
        Ok(())
    }

    fn delete_generation(&self, name: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM generations WHERE name = ?1", params![name])?;
        if deleted > 0 {
            debug!(generation = name, "Deleted generation");
        }
        Ok(deleted > 0)
    }

    fn list_generations(&self) -> Result<BTreeSet<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT name FROM generations")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(names)
    }

    fn generations_by_age(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT name FROM generations ORDER BY created_at, rowid")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn keys(&self, generation: &str) -> Result<Vec<RequestIdentity>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT method, url FROM entries WHERE generation = ?1 ORDER BY url, method")?;
        let rows = stmt
            .query_map(params![generation], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(method, url)| {
                let url = Url::parse(&url).map_err(|e| StoreError::Corrupt(format!("{url}: {e}")))?;
                Ok(RequestIdentity::new(&method, &url))
            })
            .collect()
    }

    fn entry_count(&self, generation: &str) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE generation = ?1",
            params![generation],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn promote_generation(&self, from: &str, to: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let retired = {
            let mut stmt = tx.prepare("SELECT name FROM generations WHERE name != ?1 ORDER BY name")?;
            let names = stmt
                .query_map(params![from], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            names
        };

        tx.execute("DELETE FROM generations WHERE name != ?1", params![from])?;

        let source_exists: bool = tx.query_row(
            "SELECT COUNT(*) FROM generations WHERE name = ?1",
            params![from],
            |row| row.get::<_, i32>(0).map(|count| count > 0),
        )?;

        if source_exists {
            if from != to {
                tx.execute("UPDATE generations SET name = ?1 WHERE name = ?2", params![to, from])?;
            }
        } else {
            tx.execute(
                "INSERT INTO generations (name, created_at) VALUES (?1, ?2)",
                params![to, Utc::now().timestamp()],
            )
            .map_err(map_write_error)?;
        }

        tx.commit()?;
        debug!(from, to, ?retired, "Promoted generation");
        Ok(retired)
    }
}
