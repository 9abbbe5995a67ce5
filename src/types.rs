use std::fmt;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::{errors::VoteError, Hash};

pub type ProcessId = u64;

/// Lifecycle of a voting process. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStatus {
    On,
    Frozen,
    ContractClosed,
}

impl ProcessStatus {
    pub fn to_i64(self) -> i64 {
        match self {
            ProcessStatus::On => 0,
            ProcessStatus::Frozen => 1,
            ProcessStatus::ContractClosed => 2,
        }
    }

    pub fn from_i64(v: i64) -> Result<Self, VoteError> {
        match v {
            0 => Ok(ProcessStatus::On),
            1 => Ok(ProcessStatus::Frozen),
            2 => Ok(ProcessStatus::ContractClosed),
            _ => Err(VoteError::InvalidInput(format!("unknown process status {v}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub id: ProcessId,
    #[serde(with = "hex")]
    pub census_root: Hash,
    pub census_size: u64,
    pub eth_block_num: u64,
    pub res_pub_start_block: u64,
    pub res_pub_window: u64,
    pub min_participation: u8,
    pub typ: u8,
    pub status: ProcessStatus,
    pub inserted_at: String,
}

impl Process {
    /// The contract emits the census root as a big-endian integer, the tree
    /// works with little-endian field representations.
    pub fn census_root_le(&self) -> Hash {
        let mut root = self.census_root;
        root.reverse();
        root
    }
}

/// Compressed public key of a census member
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "hex")] pub [u8; 32]);

impl PublicKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, VoteError> {
        let pk: [u8; 32] = bytes.try_into().map_err(|_| {
            VoteError::InvalidInput(format!("public key must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(PublicKey(pk))
    }

    pub fn from_hex(s: &str) -> Result<Self, VoteError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

/// Absent weights count as zero everywhere they are hashed or stored.
pub fn weight_or_zero(weight: Option<&BigUint>) -> BigUint {
    weight.cloned().unwrap_or_default()
}

/// Canonical bytes of a weight: minimal big-endian, empty for zero.
pub fn weight_to_bytes(weight: &BigUint) -> Vec<u8> {
    if weight == &BigUint::default() {
        vec![]
    } else {
        weight.to_bytes_be()
    }
}

pub fn weight_from_bytes(bytes: &[u8]) -> BigUint {
    BigUint::from_bytes_be(bytes)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CensusProof {
    pub index: u64,
    pub public_key: PublicKey,
    #[serde(default)]
    pub weight: Option<BigUint>,
    #[serde(with = "hex")]
    pub merkle_proof: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotePackage {
    #[serde(with = "hex")]
    pub signature: Vec<u8>,
    pub census_proof: CensusProof,
    #[serde(with = "hex")]
    pub vote: Vec<u8>,
}

impl VotePackage {
    pub fn from_json(json: &str) -> Result<VotePackage, VoteError> {
        let vote: VotePackage = serde_json::from_str(json)?;
        Ok(vote)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StoredVotePackage {
    pub process_id: ProcessId,
    pub package: VotePackage,
    pub inserted_at: String,
}
