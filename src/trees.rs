//! Sparse Merkle tree addressed by the leaf index.
//!
//! Only non-empty nodes are persisted, under `node/<level><position LE>`.
//! Level 0 holds the leaves and the path of a leaf follows the bits of its
//! index from the least significant one.

use pasta_curves::Fp;

use crate::{
    errors::VoteError,
    hash::{from_hash, node_hash, to_hash},
    kv::{KvRead, KvWrite},
    path::MerklePath,
    Hash, DEPTH,
};

const NODE_PREFIX: &[u8] = b"node/";
const ROOT_KEY: &[u8] = b"root";

pub fn index_to_key(index: u64) -> [u8; 8] {
    index.to_le_bytes()
}

pub fn key_to_index(key: &[u8]) -> Result<u64, VoteError> {
    let key: [u8; 8] = key
        .try_into()
        .map_err(|_| VoteError::InvalidInput(format!("index key of {} bytes", key.len())))?;
    Ok(u64::from_le_bytes(key))
}

fn node_key(level: usize, position: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(NODE_PREFIX.len() + 9);
    key.extend_from_slice(NODE_PREFIX);
    key.push(level as u8);
    key.extend_from_slice(&index_to_key(position));
    key
}

fn read_hash<R: KvRead + ?Sized>(tx: &R, key: &[u8]) -> Result<Hash, VoteError> {
    match tx.get(key)? {
        Some(v) => v
            .try_into()
            .map_err(|v: Vec<u8>| {
                VoteError::InvalidInput(format!("stored hash of {} bytes", v.len()))
            }),
        None => Ok(Hash::default()),
    }
}

pub fn root<R: KvRead + ?Sized>(tx: &R) -> Result<Hash, VoteError> {
    read_hash(tx, ROOT_KEY)
}

/// Writes `leaf` at `index` and recomputes the path up to the root.
pub fn insert_leaf<W: KvWrite + ?Sized>(
    tx: &mut W,
    index: u64,
    leaf: Fp,
) -> Result<Hash, VoteError> {
    let mut value = leaf;
    let mut position = index;
    for level in 0..DEPTH {
        tx.put(&node_key(level, position), &to_hash(value))?;
        let sibling = from_hash(&read_hash(&*tx, &node_key(level, position ^ 1))?)?;
        value = if position & 1 == 0 {
            node_hash(value, sibling)
        } else {
            node_hash(sibling, value)
        };
        position >>= 1;
    }
    let root = to_hash(value);
    tx.put(ROOT_KEY, &root)?;
    Ok(root)
}

pub fn merkle_path<R: KvRead + ?Sized>(tx: &R, index: u64) -> Result<MerklePath, VoteError> {
    let mut siblings = [Hash::default(); DEPTH];
    for (level, s) in siblings.iter_mut().enumerate() {
        let position = (index >> level) ^ 1;
        *s = read_hash(tx, &node_key(level, position))?;
    }
    Ok(MerklePath { siblings })
}
