pub type Hash = [u8; 32];
/// Depth of the census tree, the leaf position is the 64 bit census index
pub const DEPTH: usize = 64;

pub mod errors;
pub mod types;
pub mod events;
pub mod kv;
mod hash;
pub mod path;
mod trees;
pub mod census;
pub mod db;
pub mod votes;
pub mod chain;
pub mod sync;
pub mod config;

pub use errors::VoteError;
pub use types::{
    CensusProof, Process, ProcessId, ProcessStatus, PublicKey, StoredVotePackage, VotePackage,
};
pub use census::{check_proof, Census, CensusInfo};
pub use chain::{Address, ChainClient};
pub use config::Config;
pub use db::SqliteStore;
pub use kv::{KvStore, MemoryKv, SqliteKv};
pub use sync::{SyncHandle, SyncStore, Synchronizer};

pub type Connection = r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager>;
