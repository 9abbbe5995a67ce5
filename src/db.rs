use std::path::Path;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{ffi, params, Connection, OptionalExtension, Row};

use crate::{
    errors::VoteError,
    events::EventNewProcess,
    types::{Process, ProcessId, ProcessStatus},
};

const INIT_CONNECTION: &str = "PRAGMA foreign_keys = ON;
    PRAGMA busy_timeout = 5000;";

pub fn file_pool<P: AsRef<Path>>(path: P) -> Result<Pool<SqliteConnectionManager>, VoteError> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(INIT_CONNECTION)?;
        c.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
    });
    Ok(Pool::new(manager)?)
}

/// Every connection to `:memory:` opens a new database, the pool is limited
/// to a single connection.
pub fn memory_pool() -> Result<Pool<SqliteConnectionManager>, VoteError> {
    let manager = SqliteConnectionManager::memory().with_init(|c| c.execute_batch(INIT_CONNECTION));
    Ok(Pool::builder().max_size(1).build(manager)?)
}

pub fn create_tables(connection: &Connection) -> Result<(), VoteError> {
    connection.execute(
        "CREATE TABLE IF NOT EXISTS meta(
        id INTEGER PRIMARY KEY CHECK (id = 0),
        last_sync_block_num INTEGER NOT NULL)",
        [],
    )?;
    connection.execute(
        "INSERT OR IGNORE INTO meta(id, last_sync_block_num) VALUES (0, 0)",
        [],
    )?;
    connection.execute(
        "CREATE TABLE IF NOT EXISTS processes(
        id INTEGER PRIMARY KEY NOT NULL,
        census_root BLOB NOT NULL,
        census_size INTEGER NOT NULL,
        eth_block_num INTEGER NOT NULL,
        res_pub_start_block INTEGER NOT NULL,
        res_pub_window INTEGER NOT NULL,
        min_participation INTEGER NOT NULL,
        typ INTEGER NOT NULL,
        status INTEGER NOT NULL,
        inserted_datetime DATETIME NOT NULL)",
        [],
    )?;
    connection.execute(
        "CREATE TABLE IF NOT EXISTS votepackages(
        id BLOB PRIMARY KEY NOT NULL,
        indx INTEGER NOT NULL,
        public_key BLOB NOT NULL,
        weight BLOB NOT NULL,
        merkleproof BLOB NOT NULL,
        signature BLOB NOT NULL,
        vote BLOB NOT NULL,
        inserted_datetime DATETIME NOT NULL,
        process_id INTEGER NOT NULL,
        FOREIGN KEY(process_id) REFERENCES processes(id))",
        [],
    )?;
    connection.execute(
        "CREATE INDEX IF NOT EXISTS votepackages_process ON votepackages(process_id, indx)",
        [],
    )?;
    Ok(())
}

pub fn drop_tables(connection: &Connection) -> Result<(), VoteError> {
    connection.execute("DROP TABLE IF EXISTS votepackages", [])?;
    connection.execute("DROP TABLE IF EXISTS processes", [])?;
    connection.execute("DROP TABLE IF EXISTS meta", [])?;
    Ok(())
}

pub fn get_connection(
    pool: &Pool<SqliteConnectionManager>,
) -> Result<crate::Connection, VoteError> {
    let connection = pool.get()?;
    Ok(connection)
}

pub(crate) fn is_constraint(err: &rusqlite::Error, extended_code: i32) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.extended_code == extended_code)
}

pub fn get_last_sync_block_num(connection: &Connection) -> Result<u64, VoteError> {
    let n = connection.query_row("SELECT last_sync_block_num FROM meta WHERE id = 0", [], |r| {
        r.get::<_, u64>(0)
    })?;
    Ok(n)
}

/// The checkpoint never moves backwards
pub fn update_last_sync_block_num(
    connection: &Connection,
    block_num: u64,
) -> Result<(), VoteError> {
    connection.execute(
        "UPDATE meta SET last_sync_block_num = MAX(last_sync_block_num, ?1) WHERE id = 0",
        [block_num],
    )?;
    Ok(())
}

pub fn store_process(
    connection: &Connection,
    e: &EventNewProcess,
    eth_block_num: u64,
) -> Result<(), VoteError> {
    let r = connection.execute(
        "INSERT INTO processes(
        id,
        census_root,
        census_size,
        eth_block_num,
        res_pub_start_block,
        res_pub_window,
        min_participation,
        typ,
        status,
        inserted_datetime) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, CURRENT_TIMESTAMP)",
        params![
            e.process_id,
            &e.census_root[..],
            e.census_size,
            eth_block_num,
            e.res_pub_start_block,
            e.res_pub_window,
            e.min_participation,
            e.typ,
            ProcessStatus::On.to_i64()
        ],
    );
    match r {
        Ok(_) => Ok(()),
        Err(err) if is_constraint(&err, ffi::SQLITE_CONSTRAINT_PRIMARYKEY) => {
            Err(VoteError::ProcessAlreadyExists(e.process_id))
        }
        Err(err) => Err(err.into()),
    }
}

pub fn update_process_status(
    connection: &Connection,
    process_id: ProcessId,
    status: ProcessStatus,
) -> Result<(), VoteError> {
    let n = connection.execute(
        "UPDATE processes SET status = ?2 WHERE id = ?1",
        params![process_id, status.to_i64()],
    )?;
    if n == 0 {
        return Err(VoteError::ProcessNotFound(process_id));
    }
    Ok(())
}

/// Freezes the processes still `On` whose results publishing phase has
/// started at `block_num`. Returns how many were frozen.
pub fn froze_processes_by_current_block_num(
    connection: &Connection,
    block_num: u64,
) -> Result<usize, VoteError> {
    let n = connection.execute(
        "UPDATE processes SET status = ?1 WHERE status = ?2 AND res_pub_start_block <= ?3",
        params![
            ProcessStatus::Frozen.to_i64(),
            ProcessStatus::On.to_i64(),
            block_num
        ],
    )?;
    Ok(n)
}

fn row_to_process(r: &Row) -> rusqlite::Result<Process> {
    let status = r.get::<_, i64>(8)?;
    let process = Process {
        id: r.get(0)?,
        census_root: r.get::<_, [u8; 32]>(1)?,
        census_size: r.get(2)?,
        eth_block_num: r.get(3)?,
        res_pub_start_block: r.get(4)?,
        res_pub_window: r.get(5)?,
        min_participation: r.get(6)?,
        typ: r.get(7)?,
        status: ProcessStatus::from_i64(status)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(8, status))?,
        inserted_at: r.get(9)?,
    };
    Ok(process)
}

const SELECT_PROCESS: &str = "SELECT id, census_root, census_size, eth_block_num,
    res_pub_start_block, res_pub_window, min_participation, typ, status,
    inserted_datetime FROM processes";

pub fn read_process(connection: &Connection, process_id: ProcessId) -> Result<Process, VoteError> {
    let process = connection
        .query_row(&format!("{SELECT_PROCESS} WHERE id = ?1"), [process_id], row_to_process)
        .optional()?;
    process.ok_or(VoteError::ProcessNotFound(process_id))
}

pub fn read_processes(connection: &Connection) -> Result<Vec<Process>, VoteError> {
    let mut s = connection.prepare(&format!("{SELECT_PROCESS} ORDER BY id"))?;
    let rows = s.query_map([], row_to_process)?;
    let processes = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(processes)
}

/// Relational store shared by the synchronizer and the vote package store
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, VoteError> {
        Self::with_pool(file_pool(path)?)
    }

    pub fn memory() -> Result<Self, VoteError> {
        Self::with_pool(memory_pool()?)
    }

    pub fn with_pool(pool: Pool<SqliteConnectionManager>) -> Result<Self, VoteError> {
        let connection = get_connection(&pool)?;
        create_tables(&connection)?;
        drop(connection);
        Ok(SqliteStore { pool })
    }

    pub fn connection(&self) -> Result<crate::Connection, VoteError> {
        get_connection(&self.pool)
    }

    pub fn read_process(&self, process_id: ProcessId) -> Result<Process, VoteError> {
        read_process(&*self.connection()?, process_id)
    }

    pub fn read_processes(&self) -> Result<Vec<Process>, VoteError> {
        read_processes(&*self.connection()?)
    }
}
