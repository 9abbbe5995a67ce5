//! Transactional key-ordered store backing the census tree.
//!
//! Transactions are scoped by closures: the changes made by a write closure
//! are committed when it returns `Ok` and discarded when it returns `Err`.

use std::{
    collections::BTreeMap,
    path::Path,
    sync::Mutex,
};

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::{db, errors::VoteError};

pub trait KvRead {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, VoteError>;
    /// Entries whose key starts with `prefix`, in ascending key order
    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, VoteError>;
}

pub trait KvWrite: KvRead {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), VoteError>;
}

pub trait KvStore: Send + Sync {
    fn read_tx<T, F>(&self, f: F) -> Result<T, VoteError>
    where
        F: FnOnce(&dyn KvRead) -> Result<T, VoteError>;

    /// Write transactions of one store never interleave.
    fn write_tx<T, F>(&self, f: F) -> Result<T, VoteError>
    where
        F: FnOnce(&mut dyn KvWrite) -> Result<T, VoteError>;
}

/// Key-value store kept in a `kv` table of a SQLite database
#[derive(Clone)]
pub struct SqliteKv {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteKv {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, VoteError> {
        Self::with_pool(db::file_pool(path)?)
    }

    pub fn memory() -> Result<Self, VoteError> {
        Self::with_pool(db::memory_pool()?)
    }

    pub fn with_pool(pool: Pool<SqliteConnectionManager>) -> Result<Self, VoteError> {
        let connection = pool.get()?;
        connection.execute(
            "CREATE TABLE IF NOT EXISTS kv(
            key BLOB PRIMARY KEY NOT NULL,
            value BLOB NOT NULL) WITHOUT ROWID",
            [],
        )?;
        drop(connection);
        Ok(SqliteKv { pool })
    }
}

struct SqliteTx<'a>(&'a Connection);

impl KvRead for SqliteTx<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, VoteError> {
        let v = self
            .0
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |r| {
                r.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(v)
    }

    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, VoteError> {
        let mut s = self.0.prepare_cached(
            "SELECT key, value FROM kv WHERE substr(key, 1, ?2) = ?1 ORDER BY key",
        )?;
        let rows = s.query_map(params![prefix, prefix.len() as i64], |r| {
            Ok((r.get::<_, Vec<u8>>(0)?, r.get::<_, Vec<u8>>(1)?))
        })?;
        let entries = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

impl KvWrite for SqliteTx<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), VoteError> {
        self.0.execute(
            "INSERT INTO kv(key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

impl KvStore for SqliteKv {
    fn read_tx<T, F>(&self, f: F) -> Result<T, VoteError>
    where
        F: FnOnce(&dyn KvRead) -> Result<T, VoteError>,
    {
        let mut connection = self.pool.get()?;
        let tx = connection.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let r = f(&SqliteTx(&tx));
        tx.rollback()?;
        r
    }

    fn write_tx<T, F>(&self, f: F) -> Result<T, VoteError>
    where
        F: FnOnce(&mut dyn KvWrite) -> Result<T, VoteError>,
    {
        let mut connection = self.pool.get()?;
        // IMMEDIATE takes the database write lock up front
        let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let r = f(&mut SqliteTx(&tx))?;
        tx.commit()?;
        Ok(r)
    }
}

/// In-memory store. A write transaction works on a copy of the map which
/// replaces the original on commit.
#[derive(Default)]
pub struct MemoryKv {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvRead for BTreeMap<Vec<u8>, Vec<u8>> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, VoteError> {
        Ok(BTreeMap::get(self, key).cloned())
    }

    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, VoteError> {
        let entries = self
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(entries)
    }
}

impl KvWrite for BTreeMap<Vec<u8>, Vec<u8>> {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), VoteError> {
        self.insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

impl KvStore for MemoryKv {
    fn read_tx<T, F>(&self, f: F) -> Result<T, VoteError>
    where
        F: FnOnce(&dyn KvRead) -> Result<T, VoteError>,
    {
        let map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        f(&*map)
    }

    fn write_tx<T, F>(&self, f: F) -> Result<T, VoteError>
    where
        F: FnOnce(&mut dyn KvWrite) -> Result<T, VoteError>,
    {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        let mut copy = map.clone();
        let r = f(&mut copy)?;
        *map = copy;
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise<K: KvStore>(kv: &K) {
        kv.write_tx(|tx| {
            tx.put(b"a/2", b"two")?;
            tx.put(b"a/1", b"one")?;
            tx.put(b"b/1", b"other")?;
            Ok(())
        })
        .unwrap();

        let entries = kv.read_tx(|tx| tx.iter_prefix(b"a/")).unwrap();
        assert_eq!(
            entries,
            vec![
                (b"a/1".to_vec(), b"one".to_vec()),
                (b"a/2".to_vec(), b"two".to_vec())
            ]
        );

        // a failing transaction leaves no trace
        let r: Result<(), VoteError> = kv.write_tx(|tx| {
            tx.put(b"a/3", b"three")?;
            tx.put(b"a/1", b"overwritten")?;
            Err(VoteError::CensusClosed)
        });
        assert!(r.is_err());
        assert_eq!(kv.read_tx(|tx| tx.get(b"a/3")).unwrap(), None);
        assert_eq!(kv.read_tx(|tx| tx.get(b"a/1")).unwrap(), Some(b"one".to_vec()));

        kv.write_tx(|tx| {
            tx.put(b"a/1", b"uno")?;
            // reads inside a write transaction see its own writes
            assert_eq!(tx.get(b"a/1")?, Some(b"uno".to_vec()));
            Ok(())
        })
        .unwrap();
        let entries = kv.read_tx(|tx| tx.iter_prefix(b"a/")).unwrap();
        assert_eq!(
            entries,
            vec![
                (b"a/1".to_vec(), b"uno".to_vec()),
                (b"a/2".to_vec(), b"two".to_vec())
            ]
        );
    }

    #[test]
    fn sqlite_kv() {
        exercise(&SqliteKv::memory().unwrap());
    }

    #[test]
    fn memory_kv() {
        exercise(&MemoryKv::new());
    }
}
