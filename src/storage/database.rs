//! `SQLite` database handle shared by the queue store and the cache.
//!
//! Connections come from a bounded `r2d2` pool. Every statement runs through
//! [`Database::with_connection`], which retries lock contention with
//! exponential backoff before giving up with [`RollsyncError::StoreBusy`].

use std::path::Path;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, ErrorCode};
use tracing::{debug, warn};

use crate::config::{Paths, StorageConfig};
use crate::error::RollsyncError;

use super::migrations;

/// How long `SQLite` itself waits on a lock before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

/// How long a caller waits for a free pooled connection.
const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Pooled database handle. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    busy_retries: u32,
    busy_backoff: Duration,
}

impl Database {
    /// Open the database at the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub fn open(config: &StorageConfig) -> Result<Self, RollsyncError> {
        let paths = Paths::new()?;
        paths.ensure_dirs()?;
        Self::open_at(&paths.database, config)
    }

    /// Open the database at a specific path.
    ///
    /// Creates the database file and runs migrations if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub fn open_at(path: &Path, config: &StorageConfig) -> Result<Self, RollsyncError> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            configure_connection(conn)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
        });

        let pool = Pool::builder()
            .max_size(config.pool_size.max(1))
            .connection_timeout(CHECKOUT_TIMEOUT)
            .build(manager)
            .map_err(|e| {
                RollsyncError::Database(format!("Failed to open database {}: {e}", path.display()))
            })?;

        Self::from_pool(pool, config)
    }

    /// Open an in-memory database (useful for testing).
    ///
    /// The pool is pinned to one long-lived connection, since every in-memory
    /// connection is its own database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub fn open_in_memory() -> Result<Self, RollsyncError> {
        let manager = SqliteConnectionManager::memory().with_init(configure_connection);

        let pool = Pool::builder()
            .max_size(1)
            .min_idle(Some(1))
            .idle_timeout(None)
            .max_lifetime(None)
            .connection_timeout(CHECKOUT_TIMEOUT)
            .build(manager)
            .map_err(|e| {
                RollsyncError::Database(format!("Failed to open in-memory database: {e}"))
            })?;

        Self::from_pool(pool, &StorageConfig::default())
    }

    fn from_pool(
        pool: Pool<SqliteConnectionManager>,
        config: &StorageConfig,
    ) -> Result<Self, RollsyncError> {
        let db = Self {
            pool,
            busy_retries: config.busy_retries.max(1),
            busy_backoff: config.busy_backoff(),
        };

        {
            let conn = db.pool.get()?;
            migrations::run(&conn)?;
        }

        Ok(db)
    }

    /// Get the current schema version.
    ///
    /// # Errors
    ///
    /// Returns an error if the version cannot be read.
    pub fn schema_version(&self) -> Result<i32, RollsyncError> {
        let conn = self.pool.get()?;
        migrations::get_version(&conn)
    }

    /// Run `f` on a pooled connection.
    ///
    /// `f` may be invoked more than once: when it fails with `SQLITE_BUSY` or
    /// `SQLITE_LOCKED` the connection is returned, the caller sleeps, and `f`
    /// is retried with a doubled backoff. Any open transaction inside `f` must
    /// therefore be begun and finished within a single invocation.
    ///
    /// # Errors
    ///
    /// Returns `RollsyncError::StoreBusy` when every attempt hit contention and
    /// `RollsyncError::Database` for any other `SQLite` failure.
    pub fn with_connection<T, F>(&self, context: &str, mut f: F) -> Result<T, RollsyncError>
    where
        F: FnMut(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut backoff = self.busy_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut conn = self.pool.get()?;

            match f(&mut conn) {
                Ok(value) => return Ok(value),
                Err(e) if is_contention(&e) => {
                    drop(conn);
                    if attempt >= self.busy_retries {
                        warn!(context, attempts = attempt, "database stayed locked");
                        return Err(RollsyncError::StoreBusy { attempts: attempt });
                    }
                    debug!(
                        context,
                        attempt,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        "database busy, backing off"
                    );
                    std::thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => return Err(RollsyncError::Database(format!("{context}: {e}"))),
            }
        }
    }
}

fn configure_connection(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
}

/// Whether an error is lock contention rather than a real failure.
fn is_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if matches!(inner.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}
