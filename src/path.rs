use pasta_curves::Fp;

use crate::{
    errors::VoteError,
    hash::{from_hash, node_hash, to_hash},
    Hash, DEPTH,
};

/// Sibling hashes from the leaf level up to the child of the root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerklePath {
    pub siblings: [Hash; DEPTH],
}

impl MerklePath {
    /// Encoding: a little-endian `u64` bitmap of the non-empty siblings
    /// followed by those siblings, leaf level first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bitmap = 0u64;
        let mut bytes = vec![0u8; 8];
        for (level, s) in self.siblings.iter().enumerate() {
            if s != &Hash::default() {
                bitmap |= 1 << level;
                bytes.extend_from_slice(s);
            }
        }
        bytes[0..8].copy_from_slice(&bitmap.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VoteError> {
        if bytes.len() < 8 {
            return Err(VoteError::InvalidProof(format!("proof too short: {} bytes", bytes.len())));
        }
        let (head, mut rest) = bytes.split_at(8);
        let mut bitmap = [0u8; 8];
        bitmap.copy_from_slice(head);
        let bitmap = u64::from_le_bytes(bitmap);
        if rest.len() != bitmap.count_ones() as usize * 32 {
            return Err(VoteError::InvalidProof(format!(
                "expected {} siblings, got {} bytes",
                bitmap.count_ones(),
                rest.len()
            )));
        }
        let mut siblings = [Hash::default(); DEPTH];
        for (level, s) in siblings.iter_mut().enumerate() {
            if bitmap & (1 << level) != 0 {
                s.copy_from_slice(&rest[0..32]);
                rest = &rest[32..];
            }
        }
        Ok(MerklePath { siblings })
    }

    pub fn root(&self, index: u64, leaf: Fp) -> Result<Fp, VoteError> {
        let mut value = leaf;
        for (level, s) in self.siblings.iter().enumerate() {
            let sibling = from_hash(s)?;
            value = if (index >> level) & 1 == 0 {
                node_hash(value, sibling)
            } else {
                node_hash(sibling, value)
            };
        }
        Ok(value)
    }

    pub fn verify(&self, root: &Hash, index: u64, leaf: Fp) -> Result<bool, VoteError> {
        let computed = self.root(index, leaf)?;
        Ok(&to_hash(computed) == root)
    }
}
