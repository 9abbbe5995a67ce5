use std::fmt;

use crate::{errors::VoteError, types::ProcessId, Hash};

pub const WORD_LEN: usize = 32;
/// 32*9
pub const EVENT_NEW_PROCESS_LEN: usize = 288;
/// 32*5
pub const EVENT_RESULT_PUBLISHED_LEN: usize = 160;
/// 32*3
pub const EVENT_PROCESS_CLOSED_LEN: usize = 96;

pub type Word = [u8; WORD_LEN];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventNewProcess {
    pub process_id: ProcessId,
    pub census_root: Hash,
    pub census_size: u64,
    pub res_pub_start_block: u64,
    pub res_pub_window: u64,
    pub min_participation: u8,
    pub typ: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventResultPublished {
    pub process_id: ProcessId,
    pub result: [Word; 4],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventProcessClosed {
    pub process_id: ProcessId,
    pub rest: [Word; 2],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContractEvent {
    NewProcess(EventNewProcess),
    ResultPublished(EventResultPublished),
    ProcessClosed(EventProcessClosed),
}

/// Decodes a contract log payload. The payload length identifies the event.
pub fn decode_event(data: &[u8]) -> Result<ContractEvent, VoteError> {
    match data.len() {
        EVENT_NEW_PROCESS_LEN => Ok(ContractEvent::NewProcess(EventNewProcess {
            process_id: word_u64(data, 0, "processID")?,
            census_root: word(data, 1),
            census_size: word_u64(data, 2, "censusSize")?,
            res_pub_start_block: word_u64(data, 3, "resPubStartBlock")?,
            res_pub_window: word_u64(data, 4, "resPubWindow")?,
            min_participation: word_u8(data, 5, "minParticipation")?,
            typ: word_u8(data, 6, "type")?,
        })),
        EVENT_RESULT_PUBLISHED_LEN => Ok(ContractEvent::ResultPublished(EventResultPublished {
            process_id: word_u64(data, 0, "processID")?,
            result: [word(data, 1), word(data, 2), word(data, 3), word(data, 4)],
        })),
        EVENT_PROCESS_CLOSED_LEN => Ok(ContractEvent::ProcessClosed(EventProcessClosed {
            process_id: word_u64(data, 0, "processID")?,
            rest: [word(data, 1), word(data, 2)],
        })),
        len => Err(VoteError::UnrecognizedEvent { len }),
    }
}

fn word(data: &[u8], i: usize) -> Word {
    let mut w = [0u8; WORD_LEN];
    w.copy_from_slice(&data[i * WORD_LEN..(i + 1) * WORD_LEN]);
    w
}

/// Big-endian word that must fit in the trailing `N` bytes
fn word_be<const N: usize>(data: &[u8], i: usize, field: &str) -> Result<[u8; N], VoteError> {
    let w = word(data, i);
    let (high, low) = w.split_at(WORD_LEN - N);
    if high.iter().any(|b| *b != 0) {
        return Err(VoteError::EventDecode(format!(
            "{field} overflows {} bytes: {}",
            N,
            hex::encode(w)
        )));
    }
    let mut v = [0u8; N];
    v.copy_from_slice(low);
    Ok(v)
}

fn word_u64(data: &[u8], i: usize, field: &str) -> Result<u64, VoteError> {
    Ok(u64::from_be_bytes(word_be::<8>(data, i, field)?))
}

fn word_u8(data: &[u8], i: usize, field: &str) -> Result<u8, VoteError> {
    Ok(word_be::<1>(data, i, field)?[0])
}

impl fmt::Display for EventNewProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NewProcess {{ processID: {}, censusRoot: {}, censusSize: {}, resPubStartBlock: {}, resPubWindow: {}, minParticipation: {}, type: {} }}",
            self.process_id,
            hex::encode(self.census_root),
            self.census_size,
            self.res_pub_start_block,
            self.res_pub_window,
            self.min_participation,
            self.typ
        )
    }
}

impl fmt::Display for EventResultPublished {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResultPublished {{ processID: {}, result: [", self.process_id)?;
        for (i, w) in self.result.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", hex::encode(w))?;
        }
        write!(f, "] }}")
    }
}

impl fmt::Display for EventProcessClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessClosed {{ processID: {} }}", self.process_id)
    }
}

impl fmt::Display for ContractEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractEvent::NewProcess(e) => e.fmt(f),
            ContractEvent::ResultPublished(e) => e.fmt(f),
            ContractEvent::ProcessClosed(e) => e.fmt(f),
        }
    }
}
