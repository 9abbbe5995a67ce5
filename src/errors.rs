use thiserror::Error;

use crate::types::ProcessId;

#[derive(Error, Debug)]
pub enum VoteError {
    #[error("Census is closed")]
    CensusClosed,
    #[error("Public key {0} is not in the census")]
    IdentityNotFound(String),
    #[error("Invalid merkle proof encoding: {0}")]
    InvalidProof(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Process {0} already exists")]
    ProcessAlreadyExists(ProcessId),
    #[error("Can not store VotePackage, ProcessID={0} does not exist")]
    ProcessNotFound(ProcessId),
    #[error("Process {0} is frozen, votes are no longer accepted")]
    ProcessFrozen(ProcessId),
    #[error("Process {0} is closed")]
    ProcessClosed(ProcessId),
    #[error("Vote already stored for index {index} in process {process_id}")]
    DuplicateVote { index: u64, process_id: ProcessId },
    #[error("Census proof does not match the census root of process {0}")]
    InvalidCensusProof(ProcessId),

    #[error("Unrecognized event log with length {len}")]
    UnrecognizedEvent { len: usize },
    #[error("Invalid event data: {0}")]
    EventDecode(String),
    #[error("blocknum: {block_number}, event log {}: {source}", hex::encode(.data))]
    EventLog {
        block_number: u64,
        data: Vec<u8>,
        #[source]
        source: Box<VoteError>,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("Chain client error: {0}")]
    Chain(#[from] anyhow::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Pool(#[from] r2d2::Error),
    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl VoteError {
    /// Attaches the block number and raw payload of the log being applied.
    pub fn in_event_log(self, block_number: u64, data: &[u8]) -> Self {
        VoteError::EventLog {
            block_number,
            data: data.to_vec(),
            source: Box::new(self),
        }
    }
}
