//! SQLite-backed policy storage.
//!
//! `SqlitePolicyBackend` persists **all** policy items in a single SQLite database,
//! one row per visited origin. The item itself is stored as its JSON serialization, so
//! the schema does not need to follow every field of the policy model.
//!
//! Database access is via an `r2d2` pool for safe multi-threaded use.

use std::path::Path;
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::rusqlite::{params, OpenFlags};
use r2d2_sqlite::SqliteConnectionManager;

use crate::engine::errors::StoreError;
use crate::engine::policy::CookiePolicyItem;
use crate::engine::storage::PolicyBackend;

impl From<r2d2::Error> for StoreError {
    fn from(e: r2d2::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<r2d2_sqlite::rusqlite::Error> for StoreError {
    fn from(e: r2d2_sqlite::rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// A SQLite-based policy backend that persists items across sessions.
pub struct SqlitePolicyBackend {
    /// Connection pool for SQLite database (so it can run multithreaded)
    pool: Pool<SqliteConnectionManager>,
}

impl SqlitePolicyBackend {
    /// Opens (or creates) a SQLite database at `path` and ensures the schema exists.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(path.as_ref())
            .with_flags(OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_URI)
            .with_init(|c| {
                c.busy_timeout(Duration::from_millis(500))?;
                c.pragma_update(None, "journal_mode", "WAL")?;
                c.execute_batch(
                    "CREATE TABLE IF NOT EXISTS cookie_policies (
                        source_url TEXT PRIMARY KEY NOT NULL,
                        item TEXT NOT NULL,
                        updated_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
                    );",
                )?;
                Ok(())
            });

        let pool = Pool::builder()
            .max_size(4)
            .connection_timeout(Duration::from_secs(5))
            .build(manager)?;

        Ok(Self { pool })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StoreError> {
        Ok(self.pool.get()?)
    }
}

impl PolicyBackend for SqlitePolicyBackend {
    fn load_all(&self) -> Result<Vec<CookiePolicyItem>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT source_url, item FROM cookie_policies ORDER BY source_url")?;

        let rows = stmt.query_map([], |row| {
            let source_url: String = row.get(0)?;
            let item: String = row.get(1)?;
            Ok((source_url, item))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (source_url, json) = row?;
            match serde_json::from_str(&json) {
                Ok(item) => items.push(item),
                Err(e) => log::warn!("skipping unreadable policy row for {source_url}: {e}"),
            }
        }

        Ok(items)
    }

    fn save(&self, item: &CookiePolicyItem) -> Result<(), StoreError> {
        let json = serde_json::to_string(item)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO cookie_policies(source_url, item) VALUES (?1, ?2)
             ON CONFLICT(source_url) DO UPDATE
             SET item=excluded.item, updated_at=strftime('%s','now')",
            params![item.source_url(), json],
        )?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM cookie_policies", [])?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::policy::fixtures::policy;
    use crate::engine::policy::{merge_policy, PolicyUpdate};

    #[test]
    fn save_load_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policies.db");

        let first = merge_policy(None, PolicyUpdate::negotiated("https://example.com", policy())).unwrap();
        let unsupported = merge_policy(None, PolicyUpdate::unsupported("https://nopolicy.test", false)).unwrap();

        {
            let backend = SqlitePolicyBackend::new(&path).unwrap();
            backend.save(&first).unwrap();
            backend.save(&unsupported).unwrap();
        }

        let backend = SqlitePolicyBackend::new(&path).unwrap();
        assert_eq!(backend.load_all().unwrap(), vec![first.clone(), unsupported]);

        let replaced = merge_policy(Some(&first), PolicyUpdate::unsupported("https://example.com", true)).unwrap();
        backend.save(&replaced).unwrap();
        assert_eq!(backend.load_all().unwrap().len(), 2);
        assert!(backend.load_all().unwrap().contains(&replaced));

        backend.clear().unwrap();
        assert!(backend.load_all().unwrap().is_empty());
    }
}
