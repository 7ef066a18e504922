//! Durable local store for offline buffering.
//!
//! Uses rusqlite with WAL mode. Holds three independently keyed collections:
//! pending transactions (append-only), generic cached query results with a
//! TTL, and per-customer loyalty transaction caches. One `Store` is opened
//! per process and shared behind an `Arc`.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::error::StoreError;

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

const DB_FILE_NAME: &str = "offline.db";

/// A sale captured while the terminal could not reach the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTransaction {
    pub local_id: i64,
    pub idempotency_key: String,
    pub transaction_payload: Value,
    pub line_items: Vec<Value>,
    pub created_at: i64,
    pub synced: bool,
    pub synced_at: Option<i64>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Insert shape for [`Store::append`]; the key and bookkeeping columns are
/// assigned by the store.
#[derive(Debug, Clone)]
pub struct NewPendingTransaction {
    pub idempotency_key: String,
    pub transaction_payload: Value,
    pub line_items: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedQueryEntry {
    pub key: String,
    pub data: Value,
    pub cached_at: i64,
    pub ttl_millis: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoyaltyTransactionsCacheEntry {
    pub customer_id: i64,
    pub transactions: Vec<Value>,
    pub cached_at: i64,
    pub ttl_millis: i64,
}

/// An entry is stale once `cached_at + ttl_millis < now`.
pub(crate) fn is_expired(cached_at: i64, ttl_millis: i64, now: i64) -> bool {
    cached_at.saturating_add(ttl_millis) < now
}

pub struct Store {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    clock: SharedClock,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) the store at `{data_dir}/offline.db`.
    ///
    /// Creates the directory if needed, opens the connection, sets pragmas,
    /// and runs any pending migrations. On corruption or open failure,
    /// deletes the file and retries once.
    pub fn open(data_dir: &Path, clock: SharedClock) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)
            .map_err(|e| StoreError::Unavailable(format!("create data dir: {e}")))?;

        let db_path = data_dir.join(DB_FILE_NAME);
        info!("Opening offline store at {}", db_path.display());

        let conn = match open_configured(&db_path) {
            Ok(c) => c,
            Err(first_err) => {
                warn!(
                    "Offline store open failed ({}), deleting and retrying once",
                    first_err
                );
                if db_path.exists() {
                    let _ = fs::remove_file(&db_path);
                    let _ = fs::remove_file(db_path.with_extension("db-wal"));
                    let _ = fs::remove_file(db_path.with_extension("db-shm"));
                }
                open_configured(&db_path).map_err(|e| {
                    StoreError::Unavailable(format!("open failed after retry: {e}"))
                })?
            }
        };

        // Outside the retry: a file we cannot migrate still holds unsynced
        // sales and must be left on disk.
        if let Err(e) = run_migrations(&conn) {
            error!("Offline store migration failed, file kept: {e}");
            return Err(StoreError::Unavailable(e));
        }

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
            clock,
        })
    }

    /// In-memory store with the full schema. Nothing survives a restart.
    pub fn open_in_memory(clock: SharedClock) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Unavailable(format!("sqlite open: {e}")))?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .map_err(|e| StoreError::Unavailable(format!("pragma setup: {e}")))?;
        run_migrations(&conn).map_err(StoreError::Unavailable)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
            clock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Io(format!("store lock poisoned: {e}")))
    }

    // -----------------------------------------------------------------------
    // Pending transactions
    // -----------------------------------------------------------------------

    /// Append a pending transaction. The local id is assigned by SQLite and
    /// is strictly increasing, so it doubles as the insertion order.
    pub fn append(&self, new: NewPendingTransaction) -> Result<PendingTransaction, StoreError> {
        let payload = serde_json::to_string(&new.transaction_payload)?;
        let items = serde_json::to_string(&new.line_items)?;
        let created_at = self.clock.now_ms();

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO pending_transactions (
                 idempotency_key, transaction_payload, line_items, created_at, synced
             ) VALUES (?1, ?2, ?3, ?4, 0)",
            params![new.idempotency_key, payload, items, created_at],
        )?;
        let local_id = conn.last_insert_rowid();
        debug!(local_id, "pending transaction appended");

        Ok(PendingTransaction {
            local_id,
            idempotency_key: new.idempotency_key,
            transaction_payload: new.transaction_payload,
            line_items: new.line_items,
            created_at,
            synced: false,
            synced_at: None,
            attempts: 0,
            last_error: None,
        })
    }

    /// Lazy cursor over unsynced rows in insertion order.
    pub fn pending_cursor(&self, page_size: usize) -> PendingCursor<'_> {
        PendingCursor {
            store: self,
            page_size: page_size.max(1),
            last_seen: 0,
            page: VecDeque::new(),
            exhausted: false,
        }
    }

    fn pending_page(
        &self,
        after_local_id: i64,
        limit: usize,
    ) -> Result<Vec<RawPending>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT local_id, idempotency_key, transaction_payload, line_items,
                    created_at, synced, synced_at, attempts, last_error
             FROM pending_transactions
             WHERE synced = 0 AND local_id > ?1
             ORDER BY local_id ASC
             LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![after_local_id, limit], RawPending::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_pending(&self, local_id: i64) -> Result<Option<PendingTransaction>, StoreError> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                "SELECT local_id, idempotency_key, transaction_payload, line_items,
                        created_at, synced, synced_at, attempts, last_error
                 FROM pending_transactions
                 WHERE local_id = ?1",
                params![local_id],
                RawPending::from_row,
            )
            .optional()?;
        raw.map(RawPending::decode).transpose().map_err(StoreError::from)
    }

    /// Flip `synced` to true. A second call on the same row is a no-op.
    pub fn mark_synced(&self, local_id: i64) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let conn = self.conn()?;
        conn.execute(
            "UPDATE pending_transactions
             SET synced = 1, synced_at = COALESCE(synced_at, ?2), last_error = NULL
             WHERE local_id = ?1",
            params![local_id, now],
        )?;
        Ok(())
    }

    /// Record a failed submit attempt. The row stays unsynced.
    pub fn record_failure(&self, local_id: i64, error: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE pending_transactions
             SET attempts = attempts + 1, last_error = ?2
             WHERE local_id = ?1 AND synced = 0",
            params![local_id, error],
        )?;
        Ok(())
    }

    /// Replace a row's stored payload text verbatim.
    #[cfg(test)]
    pub(crate) fn overwrite_raw_payload(&self, local_id: i64, raw: &str) {
        self.conn()
            .unwrap()
            .execute(
                "UPDATE pending_transactions SET transaction_payload = ?2 WHERE local_id = ?1",
                params![local_id, raw],
            )
            .unwrap();
    }

    pub fn pending_count(&self) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pending_transactions WHERE synced = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    // -----------------------------------------------------------------------
    // Generic query cache
    // -----------------------------------------------------------------------

    pub fn put_cache_entry(&self, key: &str, data: &Value, ttl_millis: i64) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(data)?;
        let now = self.clock.now_ms();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO query_cache (cache_key, data, cached_at, ttl_millis)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(cache_key) DO UPDATE SET
                data = excluded.data,
                cached_at = excluded.cached_at,
                ttl_millis = excluded.ttl_millis",
            params![key, encoded, now, ttl_millis],
        )?;
        Ok(())
    }

    /// Read a cached query result. Stale entries are reported as a miss but
    /// left in place until the next write overwrites them.
    pub fn get_cache_entry(&self, key: &str) -> Result<Option<CachedQueryEntry>, StoreError> {
        let row: Option<(String, i64, i64)> = {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT data, cached_at, ttl_millis FROM query_cache WHERE cache_key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
        };

        let Some((data, cached_at, ttl_millis)) = row else {
            return Ok(None);
        };
        if is_expired(cached_at, ttl_millis, self.clock.now_ms()) {
            debug!(key, "cache entry stale");
            return Ok(None);
        }
        Ok(Some(CachedQueryEntry {
            key: key.to_string(),
            data: serde_json::from_str(&data)?,
            cached_at,
            ttl_millis,
        }))
    }

    // -----------------------------------------------------------------------
    // Loyalty transaction cache
    // -----------------------------------------------------------------------

    pub fn put_loyalty_transactions(
        &self,
        customer_id: i64,
        transactions: &[Value],
        ttl_millis: i64,
    ) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(transactions)?;
        let now = self.clock.now_ms();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO loyalty_cache (customer_id, transactions, cached_at, ttl_millis)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(customer_id) DO UPDATE SET
                transactions = excluded.transactions,
                cached_at = excluded.cached_at,
                ttl_millis = excluded.ttl_millis",
            params![customer_id, encoded, now, ttl_millis],
        )?;
        Ok(())
    }

    pub fn get_loyalty_transactions(
        &self,
        customer_id: i64,
    ) -> Result<Option<LoyaltyTransactionsCacheEntry>, StoreError> {
        let row: Option<(String, i64, i64)> = {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT transactions, cached_at, ttl_millis
                 FROM loyalty_cache WHERE customer_id = ?1",
                params![customer_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
        };

        let Some((transactions, cached_at, ttl_millis)) = row else {
            return Ok(None);
        };
        if is_expired(cached_at, ttl_millis, self.clock.now_ms()) {
            return Ok(None);
        }
        Ok(Some(LoyaltyTransactionsCacheEntry {
            customer_id,
            transactions: serde_json::from_str(&transactions)?,
            cached_at,
            ttl_millis,
        }))
    }
}

/// Lazy, keyset-paginated iterator over unsynced rows.
///
/// Only one page is held in memory. Rows marked synced while iterating are
/// simply not returned by later pages. A row whose JSON columns no longer
/// decode is yielded as [`StoreError::Corrupt`] and the cursor moves past it.
pub struct PendingCursor<'a> {
    store: &'a Store,
    page_size: usize,
    last_seen: i64,
    page: VecDeque<RawPending>,
    exhausted: bool,
}

impl Iterator for PendingCursor<'_> {
    type Item = Result<PendingTransaction, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            match self.store.pending_page(self.last_seen, self.page_size) {
                Ok(rows) => {
                    if rows.len() < self.page_size {
                        self.exhausted = true;
                    }
                    self.page.extend(rows);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        let raw = self.page.pop_front()?;
        let local_id = raw.local_id;
        self.last_seen = local_id;
        Some(raw.decode().map_err(|e| StoreError::Corrupt {
            local_id,
            detail: e.to_string(),
        }))
    }
}

struct RawPending {
    local_id: i64,
    idempotency_key: String,
    transaction_payload: String,
    line_items: String,
    created_at: i64,
    synced: bool,
    synced_at: Option<i64>,
    attempts: i64,
    last_error: Option<String>,
}

impl RawPending {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            local_id: row.get(0)?,
            idempotency_key: row.get(1)?,
            transaction_payload: row.get(2)?,
            line_items: row.get(3)?,
            created_at: row.get(4)?,
            synced: row.get::<_, i64>(5)? != 0,
            synced_at: row.get(6)?,
            attempts: row.get(7)?,
            last_error: row.get(8)?,
        })
    }

    fn decode(self) -> Result<PendingTransaction, serde_json::Error> {
        Ok(PendingTransaction {
            local_id: self.local_id,
            idempotency_key: self.idempotency_key,
            transaction_payload: serde_json::from_str(&self.transaction_payload)?,
            line_items: serde_json::from_str(&self.line_items)?,
            created_at: self.created_at,
            synced: self.synced,
            synced_at: self.synced_at,
            attempts: u32::try_from(self.attempts).unwrap_or(u32::MAX),
            last_error: self.last_error,
        })
    }
}

/// Open the database file and apply pragmas.
fn open_configured(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(|e| format!("read schema_version: {e}"))?;

    if current > CURRENT_SCHEMA_VERSION {
        return Err(format!(
            "offline store schema v{current} is newer than supported v{CURRENT_SCHEMA_VERSION}"
        ));
    }
    if current == CURRENT_SCHEMA_VERSION {
        debug!("Offline store schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating offline store from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: pending queue and the two caches.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        BEGIN;

        -- pending_transactions (append-only)
        CREATE TABLE IF NOT EXISTS pending_transactions (
            local_id INTEGER PRIMARY KEY AUTOINCREMENT,
            idempotency_key TEXT UNIQUE NOT NULL,
            transaction_payload TEXT NOT NULL,
            line_items TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            synced INTEGER NOT NULL DEFAULT 0,
            synced_at INTEGER
        );

        -- query_cache (generic cached query results)
        CREATE TABLE IF NOT EXISTS query_cache (
            cache_key TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            cached_at INTEGER NOT NULL,
            ttl_millis INTEGER NOT NULL
        );

        -- loyalty_cache (one row per customer)
        CREATE TABLE IF NOT EXISTS loyalty_cache (
            customer_id INTEGER PRIMARY KEY,
            transactions TEXT NOT NULL DEFAULT '[]',
            cached_at INTEGER NOT NULL,
            ttl_millis INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_pending_synced ON pending_transactions(synced, local_id);

        INSERT INTO schema_version (version) VALUES (1);

        COMMIT;
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        format!("migration v1: {e}")
    })
}

/// Migration v2: per-row attempt bookkeeping.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        BEGIN;
        ALTER TABLE pending_transactions ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE pending_transactions ADD COLUMN last_error TEXT;
        INSERT INTO schema_version (version) VALUES (2);
        COMMIT;
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        format!("migration v2: {e}")
    })
}

// ===========================================================================
// Tests
// ===========================================================================
