//! Persistent key-value store - SQLite-backed ordered byte map
//!
//! All persisted objects live in one `WITHOUT ROWID` table keyed by a
//! namespaced byte key, so SQLite's B-tree gives us ordered prefix scans
//! for free. Writes are durable once they return: the database runs in
//! WAL mode with `synchronous = FULL`.
//!
//! # Performance
//! - Get / put: O(log n)
//! - Prefix scan: O(log n + k) where k = matches

use crate::storage::error::StorageResult;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};

/// Database file name inside the data directory
const DB_FILE: &str = "profiles.db";

/// Durable ordered byte map
pub struct KvStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl KvStore {
    /// Create or open the store under `data_dir`
    pub fn open(data_dir: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(DB_FILE);

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA cache_size = 10000;
            PRAGMA temp_store = MEMORY;
            ",
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key BLOB PRIMARY KEY,
                value BLOB NOT NULL
            ) WITHOUT ROWID",
            [],
        )?;

        tracing::debug!(path = %path.display(), "Opened profile store");

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read a value
    pub fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT value FROM kv WHERE key = ?")?;
        let value = stmt
            .query_row(params![key], |row| row.get::<_, Vec<u8>>(0))
            .optional()?;
        Ok(value)
    }

    /// Insert or replace a value
    pub fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached("INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)")?
            .execute(params![key, value])?;
        Ok(())
    }

    /// Write several values in one transaction
    pub fn put_batch<'a, I>(&self, entries: I) -> StorageResult<usize>
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut written = 0;
        {
            let mut stmt =
                tx.prepare_cached("INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)")?;
            for (key, value) in entries {
                stmt.execute(params![key, value])?;
                written += 1;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    /// Remove a value; missing keys are not an error
    pub fn delete(&self, key: &[u8]) -> StorageResult<bool> {
        let conn = self.conn.lock();
        let removed = conn
            .prepare_cached("DELETE FROM kv WHERE key = ?")?
            .execute(params![key])?;
        Ok(removed > 0)
    }

    /// Visit every entry whose key starts with `prefix`, in key order
    ///
    /// The visitor returns `false` to stop early.
    pub fn scan_prefix<F>(&self, prefix: &[u8], mut visit: F) -> StorageResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let conn = self.conn.lock();
        let mut rows = match prefix_successor(prefix) {
            Some(upper) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT key, value FROM kv WHERE key >= ? AND key < ? ORDER BY key",
                )?;
                let rows = collect_rows(stmt.query(params![prefix, upper])?)?;
                rows
            }
            None => {
                let mut stmt =
                    conn.prepare_cached("SELECT key, value FROM kv WHERE key >= ? ORDER BY key")?;
                let rows = collect_rows(stmt.query(params![prefix])?)?;
                rows
            }
        };
        drop(conn);

        for (key, value) in rows.drain(..) {
            if !visit(&key, &value) {
                break;
            }
        }
        Ok(())
    }

    /// Number of stored entries
    pub fn len(&self) -> StorageResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM kv", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Make every later write fail until switched back
    #[cfg(test)]
    pub(crate) fn set_read_only(&self, read_only: bool) -> StorageResult<()> {
        let conn = self.conn.lock();
        conn.pragma_update(None, "query_only", read_only)?;
        Ok(())
    }

    /// Fold the WAL back into the main database file
    pub fn checkpoint(&self) -> StorageResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

fn collect_rows(mut rows: rusqlite::Rows<'_>) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push((row.get(0)?, row.get(1)?));
    }
    Ok(out)
}

/// Smallest key greater than every key starting with `prefix`
///
/// `None` when the prefix is all `0xFF` bytes (no upper bound).
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}
