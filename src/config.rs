use std::str::FromStr;

use crate::{
    census::Census,
    chain::Address,
    db::SqliteStore,
    errors::VoteError,
    kv::SqliteKv,
    sync::SyncStore,
};

/// Node settings, read from the environment or a `.env` file
#[derive(Clone, Debug)]
pub struct Config {
    pub db_path: String,
    pub census_db_path: String,
    pub eth_url: String,
    pub contract: Address,
    /// Overrides the persisted checkpoint for the first backfill
    pub start_block: Option<u64>,
}

impl Config {
    pub fn from_env() -> Result<Self, VoteError> {
        if dotenv::dotenv().is_err() {
            log::debug!("no .env file");
        }
        Self::from_vars(|name| dotenv::var(name).ok())
    }

    pub fn from_vars<F: Fn(&str) -> Option<String>>(var: F) -> Result<Self, VoteError> {
        let required = |name: &str| {
            var(name).ok_or_else(|| VoteError::Config(format!("{name} is not set")))
        };
        let contract = Address::from_str(&required("CONTRACT_ADDR")?)
            .map_err(|e| VoteError::Config(format!("CONTRACT_ADDR: {e}")))?;
        let start_block = var("START_BLOCK")
            .map(|s| {
                u64::from_str(s.trim()).map_err(|e| VoteError::Config(format!("START_BLOCK: {e}")))
            })
            .transpose()?;
        Ok(Config {
            db_path: required("DB_PATH")?,
            census_db_path: required("CENSUS_DB_PATH")?,
            eth_url: required("ETH_URL")?,
            contract,
            start_block,
        })
    }

    pub fn open_stores(&self) -> Result<(SqliteStore, Census<SqliteKv>), VoteError> {
        let store = SqliteStore::open(&self.db_path)?;
        let census = Census::open(SqliteKv::open(&self.census_db_path)?)?;
        log::info!("opened {} and census {}", self.db_path, self.census_db_path);
        Ok((store, census))
    }

    /// First block of the historical sync
    pub fn first_block<S: SyncStore>(&self, store: &S) -> Result<u64, VoteError> {
        match self.start_block {
            Some(start_block) => Ok(start_block),
            None => store.get_last_sync_block_num(),
        }
    }
}
