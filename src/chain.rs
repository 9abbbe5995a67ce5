use std::{fmt, str::FromStr};

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::errors::VoteError;

/// Address of the voting contract
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(pub [u8; 20]);

impl FromStr for Address {
    type Err = VoteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim_start_matches("0x"))?;
        let address: [u8; 20] = bytes.try_into().map_err(|b: Vec<u8>| {
            VoteError::InvalidInput(format!("address of {} bytes", b.len()))
        })?;
        Ok(Address(address))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEvent {
    pub block_number: u64,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Address,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
}

impl LogFilter {
    pub fn new(address: Address) -> Self {
        LogFilter {
            address,
            from_block: None,
            to_block: None,
        }
    }

    pub fn range(address: Address, from_block: u64, to_block: u64) -> Self {
        LogFilter {
            address,
            from_block: Some(from_block),
            to_block: Some(to_block),
        }
    }
}

/// Items of a subscription. An `Err` item reports a subscription error,
/// the subscription ends when the stream does.
pub type Subscription<T> = BoxStream<'static, anyhow::Result<T>>;

/// Access to the chain node
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    async fn chain_id(&self) -> anyhow::Result<u64>;

    /// Height of the latest block
    async fn block_number(&self) -> anyhow::Result<u64>;

    async fn subscribe_new_heads(&self) -> anyhow::Result<Subscription<BlockHeader>>;

    async fn subscribe_logs(&self, filter: &LogFilter) -> anyhow::Result<Subscription<LogEvent>>;

    /// Logs matching `filter`, in chain order
    async fn filter_logs(&self, filter: &LogFilter) -> anyhow::Result<Vec<LogEvent>>;
}
