//! Weighted census of public keys committed in a sparse Merkle tree.

use num_bigint::BigUint;
use serde::Serialize;

use crate::{
    errors::VoteError,
    hash::leaf_hash,
    kv::{KvRead, KvStore, KvWrite},
    path::MerklePath,
    trees::{self, index_to_key, key_to_index},
    types::{weight_from_bytes, weight_or_zero, weight_to_bytes, PublicKey},
    Hash,
};

const NEXT_INDEX_KEY: &[u8] = b"nextIndex";
const CLOSED_KEY: &[u8] = b"closed";
const ERR_MSG_KEY: &[u8] = b"errMsg";
const PUBLIC_KEY_PREFIX: &[u8] = b"pk/";
const LEAF_PREFIX: &[u8] = b"leaf/";

/// Root reported for a census without members
pub const EMPTY_ROOT: Hash = [0u8; 32];

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CensusInfo {
    pub size: u64,
    pub closed: bool,
    #[serde(with = "hex")]
    pub root: Hash,
    pub err_msg: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CensusLeaf {
    pub index: u64,
    pub public_key: PublicKey,
    pub weight: BigUint,
}

pub struct Census<K: KvStore> {
    db: K,
}

fn public_key_key(pk: &PublicKey) -> Vec<u8> {
    [PUBLIC_KEY_PREFIX, &pk.0[..]].concat()
}

fn leaf_key(index: u64) -> Vec<u8> {
    [LEAF_PREFIX, &index_to_key(index)[..]].concat()
}

fn get_next_index<R: KvRead + ?Sized>(tx: &R) -> Result<u64, VoteError> {
    match tx.get(NEXT_INDEX_KEY)? {
        Some(v) => key_to_index(&v),
        None => Ok(0),
    }
}

fn set_next_index<W: KvWrite + ?Sized>(tx: &mut W, index: u64) -> Result<(), VoteError> {
    tx.put(NEXT_INDEX_KEY, &index_to_key(index))
}

fn is_closed<R: KvRead + ?Sized>(tx: &R) -> Result<bool, VoteError> {
    Ok(tx.get(CLOSED_KEY)?.map(|v| v == [1u8]).unwrap_or(false))
}

fn decode_leaf(index: u64, v: &[u8]) -> Result<CensusLeaf, VoteError> {
    if v.len() < 32 {
        return Err(VoteError::InvalidInput(format!("leaf {index} of {} bytes", v.len())));
    }
    let (pk, weight) = v.split_at(32);
    Ok(CensusLeaf {
        index,
        public_key: PublicKey::from_slice(pk)?,
        weight: weight_from_bytes(weight),
    })
}

fn get_leaf<R: KvRead + ?Sized>(tx: &R, index: u64) -> Result<Option<CensusLeaf>, VoteError> {
    tx.get(&leaf_key(index))?
        .map(|v| decode_leaf(index, &v))
        .transpose()
}

impl<K: KvStore> Census<K> {
    /// Attaches to the census kept in `db`, initializing it when empty
    pub fn open(db: K) -> Result<Self, VoteError> {
        db.write_tx(|tx| {
            if tx.get(NEXT_INDEX_KEY)?.is_none() {
                set_next_index(tx, 0)?;
            }
            if tx.get(CLOSED_KEY)?.is_none() {
                tx.put(CLOSED_KEY, &[0u8])?;
            }
            Ok(())
        })?;
        Ok(Census { db })
    }

    /// Adds the public keys with their weights and returns the ones that
    /// were already in the census. Missing weights are zero.
    pub fn add_public_keys(
        &self,
        pks: &[PublicKey],
        weights: &[Option<BigUint>],
    ) -> Result<Vec<PublicKey>, VoteError> {
        if !weights.is_empty() && weights.len() != pks.len() {
            return Err(VoteError::InvalidInput(format!(
                "{} public keys but {} weights",
                pks.len(),
                weights.len()
            )));
        }
        let r = self.db.write_tx(|tx| {
            if is_closed(&*tx)? {
                return Err(VoteError::CensusClosed);
            }
            let mut next_index = get_next_index(&*tx)?;
            let mut invalids = vec![];
            for (i, pk) in pks.iter().enumerate() {
                let pk_key = public_key_key(pk);
                if tx.get(&pk_key)?.is_some() {
                    invalids.push(*pk);
                    continue;
                }
                let weight = weight_or_zero(weights.get(i).and_then(|w| w.as_ref()));
                let leaf = leaf_hash(next_index, pk, &weight);
                trees::insert_leaf(tx, next_index, leaf)?;
                tx.put(&pk_key, &index_to_key(next_index))?;
                let mut record = pk.0.to_vec();
                record.extend_from_slice(&weight_to_bytes(&weight));
                tx.put(&leaf_key(next_index), &record)?;
                next_index = next_index
                    .checked_add(1)
                    .ok_or_else(|| VoteError::InvalidInput("census index space exhausted".into()))?;
            }
            set_next_index(tx, next_index)?;
            tx.put(ERR_MSG_KEY, b"")?;
            Ok((invalids, next_index))
        });
        match r {
            Ok((invalids, size)) => {
                log::debug!(
                    "census: added {} public keys, size {}, {} invalid",
                    pks.len() - invalids.len(),
                    size,
                    invalids.len()
                );
                Ok(invalids)
            }
            Err(err @ (VoteError::CensusClosed | VoteError::InvalidInput(_))) => Err(err),
            Err(err) => {
                log::error!("census: failed to add public keys: {}", err);
                if let Err(e) = self.record_error(&err.to_string()) {
                    log::error!("census: cannot record error message: {}", e);
                }
                Err(err)
            }
        }
    }

    /// Index, weight and encoded Merkle proof of an enrolled public key
    pub fn get_proof(&self, pk: &PublicKey) -> Result<(u64, BigUint, Vec<u8>), VoteError> {
        self.db.read_tx(|tx| {
            let index = match tx.get(&public_key_key(pk))? {
                Some(v) => key_to_index(&v)?,
                None => return Err(VoteError::IdentityNotFound(pk.to_string())),
            };
            let leaf = get_leaf(tx, index)?
                .ok_or_else(|| VoteError::IdentityNotFound(pk.to_string()))?;
            let path = trees::merkle_path(tx, index)?;
            Ok((index, leaf.weight, path.to_bytes()))
        })
    }

    pub fn close(&self) -> Result<(), VoteError> {
        self.db.write_tx(|tx| tx.put(CLOSED_KEY, &[1u8]))?;
        log::info!("census closed");
        Ok(())
    }

    pub fn is_closed(&self) -> Result<bool, VoteError> {
        self.db.read_tx(|tx| is_closed(tx))
    }

    pub fn root(&self) -> Result<Hash, VoteError> {
        self.db.read_tx(|tx| trees::root(tx))
    }

    pub fn size(&self) -> Result<u64, VoteError> {
        self.db.read_tx(|tx| get_next_index(tx))
    }

    pub fn info(&self) -> Result<CensusInfo, VoteError> {
        self.db.read_tx(|tx| {
            let size = get_next_index(tx)?;
            let root = if size == 0 { EMPTY_ROOT } else { trees::root(tx)? };
            let err_msg = tx
                .get(ERR_MSG_KEY)?
                .map(|v| String::from_utf8_lossy(&v).into_owned())
                .unwrap_or_default();
            Ok(CensusInfo {
                size,
                closed: is_closed(tx)?,
                root,
                err_msg,
            })
        })
    }

    /// Keeps the failure message of a background operation for `info`
    pub fn record_error(&self, msg: &str) -> Result<(), VoteError> {
        self.db.write_tx(|tx| tx.put(ERR_MSG_KEY, msg.as_bytes()))
    }

    /// Every leaf of the census in index order
    pub fn list_public_keys(&self) -> Result<Vec<CensusLeaf>, VoteError> {
        self.db.read_tx(|tx| {
            let mut leaves = vec![];
            for (key, value) in tx.iter_prefix(LEAF_PREFIX)? {
                let index = key_to_index(&key[LEAF_PREFIX.len()..])?;
                leaves.push(decode_leaf(index, &value)?);
            }
            // keys are little-endian
            leaves.sort_by_key(|l| l.index);
            Ok(leaves)
        })
    }
}

/// Checks that `proof` proves the leaf (index, pk, weight) under `root`.
/// Mismatches return `Ok(false)`, undecodable proofs an error.
pub fn check_proof(
    root: &Hash,
    proof: &[u8],
    index: u64,
    pk: &PublicKey,
    weight: Option<&BigUint>,
) -> Result<bool, VoteError> {
    let path = MerklePath::from_bytes(proof)?;
    let leaf = leaf_hash(index, pk, &weight_or_zero(weight));
    path.verify(root, index, leaf)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use rand::{rngs::OsRng, RngCore};

    use super::*;
    use crate::kv::{MemoryKv, SqliteKv};

    fn random_pks(n: usize) -> Vec<PublicKey> {
        (0..n)
            .map(|_| {
                let mut pk = [0u8; 32];
                OsRng.fill_bytes(&mut pk);
                PublicKey(pk)
            })
            .collect()
    }

    fn ones(n: usize) -> Vec<Option<BigUint>> {
        vec![Some(BigUint::from(1u32)); n]
    }

    #[test]
    fn next_index() {
        let census = Census::open(MemoryKv::new()).unwrap();
        assert_eq!(census.size().unwrap(), 0);
        census.db.write_tx(|tx| set_next_index(tx, 10)).unwrap();
        assert_eq!(census.size().unwrap(), 10);
        census.db.write_tx(|tx| set_next_index(tx, u64::MAX)).unwrap();
        assert_eq!(census.size().unwrap(), u64::MAX);
    }

    #[test]
    fn reopen_keeps_state() {
        let kv = SqliteKv::memory().unwrap();
        let census = Census::open(kv.clone()).unwrap();
        let invalids = census.add_public_keys(&random_pks(3), &[]).unwrap();
        assert!(invalids.is_empty());
        let root = census.root().unwrap();
        let census = Census::open(kv).unwrap();
        assert_eq!(census.size().unwrap(), 3);
        assert_eq!(census.root().unwrap(), root);
    }

    #[test]
    fn add_public_keys() {
        let census = Census::open(SqliteKv::memory().unwrap()).unwrap();
        let pks = random_pks(30);

        let invalids = census.add_public_keys(&pks[..20], &ones(20)).unwrap();
        assert!(invalids.is_empty());
        assert_eq!(census.size().unwrap(), 20);

        let invalids = census.add_public_keys(&pks[20..], &ones(10)).unwrap();
        assert!(invalids.is_empty());
        assert_eq!(census.size().unwrap(), 30);

        census
            .db
            .read_tx(|tx| {
                for (i, pk) in pks.iter().enumerate() {
                    let v = tx.get(&public_key_key(pk))?.unwrap();
                    assert_eq!(key_to_index(&v)?, i as u64);
                }
                Ok(())
            })
            .unwrap();

        let leaves = census.list_public_keys().unwrap();
        assert_eq!(leaves.len(), 30);
        for (i, leaf) in leaves.iter().enumerate() {
            assert_eq!(leaf.index, i as u64);
            assert_eq!(leaf.public_key, pks[i]);
            assert_eq!(leaf.weight, BigUint::from(1u32));
        }
    }

    #[test]
    fn duplicates_are_invalid() {
        let census = Census::open(MemoryKv::new()).unwrap();
        let pks = random_pks(4);
        census.add_public_keys(&pks[..2], &[]).unwrap();
        let (index, _, _) = census.get_proof(&pks[1]).unwrap();
        let root = census.root().unwrap();

        let batch = vec![pks[1], pks[2], pks[2], pks[3], pks[0]];
        let invalids = census.add_public_keys(&batch, &[]).unwrap();
        assert_eq!(invalids, vec![pks[1], pks[2], pks[0]]);
        assert_eq!(census.size().unwrap(), 4);
        assert_eq!(census.get_proof(&pks[1]).unwrap().0, index);
        assert_ne!(census.root().unwrap(), root);

        let invalids = census.add_public_keys(&pks, &[]).unwrap();
        assert_eq!(invalids, pks);
        assert_eq!(census.size().unwrap(), 4);
    }

    #[test]
    fn weights_length_mismatch() {
        let census = Census::open(MemoryKv::new()).unwrap();
        let r = census.add_public_keys(&random_pks(3), &ones(2));
        assert!(matches!(r, Err(VoteError::InvalidInput(_))));
        assert_eq!(census.size().unwrap(), 0);
    }

    #[test]
    fn get_proof_and_check_proof() {
        let census = Census::open(SqliteKv::memory().unwrap()).unwrap();
        let pks = random_pks(16);
        let weights: Vec<Option<BigUint>> =
            (0..16u32).map(|i| if i % 4 == 0 { None } else { Some(BigUint::from(i)) }).collect();
        let invalids = census.add_public_keys(&pks, &weights).unwrap();
        assert!(invalids.is_empty());
        census.close().unwrap();
        let root = census.root().unwrap();

        for (i, pk) in pks.iter().enumerate() {
            let (index, weight, proof) = census.get_proof(pk).unwrap();
            assert_eq!(index, i as u64);
            assert_eq!(weight, weight_or_zero(weights[i].as_ref()));
            assert!(check_proof(&root, &proof, index, pk, weights[i].as_ref()).unwrap());
            assert!(check_proof(&root, &proof, index, pk, Some(&weight)).unwrap());

            // any altered field breaks the proof
            assert!(!check_proof(&root, &proof, index + 1, pk, Some(&weight)).unwrap());
            assert!(!check_proof(&root, &proof, index, &pks[(i + 1) % 16], Some(&weight)).unwrap());
            let heavier = &weight + 1u32;
            assert!(!check_proof(&root, &proof, index, pk, Some(&heavier)).unwrap());
        }
    }

    #[test]
    fn unknown_public_key() {
        let census = Census::open(MemoryKv::new()).unwrap();
        census.add_public_keys(&random_pks(2), &[]).unwrap();
        let r = census.get_proof(&PublicKey([9u8; 32]));
        assert!(matches!(r, Err(VoteError::IdentityNotFound(_))));
    }

    #[test]
    fn info() {
        let census = Census::open(MemoryKv::new()).unwrap();
        let info = census.info().unwrap();
        assert_eq!(
            info,
            CensusInfo { size: 0, closed: false, root: EMPTY_ROOT, err_msg: String::new() }
        );

        census.add_public_keys(&random_pks(10), &ones(10)).unwrap();
        let info = census.info().unwrap();
        assert_eq!(info.size, 10);
        assert!(!info.closed);
        assert_eq!(info.root, census.root().unwrap());
        assert_ne!(info.root, EMPTY_ROOT);

        census.record_error("import failed").unwrap();
        assert_eq!(census.info().unwrap().err_msg, "import failed");

        census.close().unwrap();
        census.close().unwrap();
        let root = census.root().unwrap();
        let info = census.info().unwrap();
        assert_eq!(info.err_msg, "import failed");
        assert_eq!(info.size, 10);
        assert!(info.closed);
        assert_eq!(info.root, root);
    }

    #[test]
    fn closed_census_scenario() {
        let census = Census::open(SqliteKv::memory().unwrap()).unwrap();
        let pks = random_pks(3);
        let (a, b, c) = (pks[0], pks[1], pks[2]);
        let invalids = census
            .add_public_keys(&[a, b], &[Some(BigUint::from(5u32)), Some(BigUint::default())])
            .unwrap();
        assert!(invalids.is_empty());
        assert_eq!(census.get_proof(&a).unwrap().0, 0);
        assert_eq!(census.get_proof(&b).unwrap().0, 1);
        let r1 = census.root().unwrap();

        census.close().unwrap();
        let info = census.info().unwrap();
        assert!(info.closed);
        assert_eq!(info.size, 2);
        assert_eq!(info.root, r1);

        let r = census.add_public_keys(&[c], &[]);
        assert!(matches!(r, Err(VoteError::CensusClosed)));
        assert_eq!(census.info().unwrap(), info);
        assert_eq!(census.info().unwrap().err_msg, "");

        let (index, weight, proof) = census.get_proof(&a).unwrap();
        assert_eq!(weight, BigUint::from(5u32));
        assert!(check_proof(&r1, &proof, index, &a, Some(&weight)).unwrap());
        assert!(!check_proof(&EMPTY_ROOT, &proof, index, &a, Some(&weight)).unwrap());
    }

    #[test]
    fn malformed_proof() {
        let r = check_proof(&EMPTY_ROOT, &[0u8; 3], 0, &PublicKey([1u8; 32]), None);
        assert!(matches!(r, Err(VoteError::InvalidProof(_))));
    }

    /// Store whose writes fail on one key while `failing` is set
    struct FailingKv {
        inner: MemoryKv,
        fail_key: Vec<u8>,
        failing: AtomicBool,
    }

    struct FailingTx<'a> {
        inner: &'a mut dyn KvWrite,
        fail_key: Option<&'a [u8]>,
    }

    impl KvRead for FailingTx<'_> {
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, VoteError> {
            self.inner.get(key)
        }

        fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, VoteError> {
            self.inner.iter_prefix(prefix)
        }
    }

    impl KvWrite for FailingTx<'_> {
        fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), VoteError> {
            if self.fail_key == Some(key) {
                let err = rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL);
                let msg = Some("disk full".to_string());
                return Err(rusqlite::Error::SqliteFailure(err, msg).into());
            }
            self.inner.put(key, value)
        }
    }

    impl KvStore for FailingKv {
        fn read_tx<T, F>(&self, f: F) -> Result<T, VoteError>
        where
            F: FnOnce(&dyn KvRead) -> Result<T, VoteError>,
        {
            self.inner.read_tx(f)
        }

        fn write_tx<T, F>(&self, f: F) -> Result<T, VoteError>
        where
            F: FnOnce(&mut dyn KvWrite) -> Result<T, VoteError>,
        {
            let fail_key = self.failing.load(Ordering::SeqCst).then_some(&self.fail_key[..]);
            self.inner.write_tx(|tx| f(&mut FailingTx { inner: tx, fail_key }))
        }
    }

    #[test]
    fn storage_failure_consumes_no_index() {
        let census = Census::open(FailingKv {
            inner: MemoryKv::new(),
            fail_key: leaf_key(1),
            failing: AtomicBool::new(true),
        })
        .unwrap();
        let pks = random_pks(3);

        let r = census.add_public_keys(&pks, &ones(3));
        assert!(matches!(r, Err(VoteError::Sqlite(_))));
        assert_eq!(census.size().unwrap(), 0);
        assert_eq!(census.root().unwrap(), EMPTY_ROOT);
        for pk in pks.iter() {
            assert!(matches!(census.get_proof(pk), Err(VoteError::IdentityNotFound(_))));
        }
        let info = census.info().unwrap();
        assert!(info.err_msg.contains("disk full"));
        assert_eq!(info.size, 0);

        census.db.failing.store(false, Ordering::SeqCst);
        let invalids = census.add_public_keys(&pks, &ones(3)).unwrap();
        assert!(invalids.is_empty());
        assert_eq!(census.size().unwrap(), 3);
        for (i, pk) in pks.iter().enumerate() {
            assert_eq!(census.get_proof(pk).unwrap().0, i as u64);
        }
        // a successful call clears the recorded failure
        assert_eq!(census.info().unwrap().err_msg, "");
    }

    #[test]
    fn concurrent_writers_get_disjoint_indices() {
        let dir = std::env::temp_dir().join(format!("census-{}.db", OsRng.next_u64()));
        let census = std::sync::Arc::new(Census::open(SqliteKv::open(&dir).unwrap()).unwrap());
        let batches: Vec<Vec<PublicKey>> = (0..4).map(|_| random_pks(5)).collect();
        let handles: Vec<_> = batches
            .clone()
            .into_iter()
            .map(|batch| {
                let census = census.clone();
                std::thread::spawn(move || census.add_public_keys(&batch, &[]).unwrap())
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap().is_empty());
        }
        assert_eq!(census.size().unwrap(), 20);
        let mut indices: Vec<u64> = batches
            .iter()
            .flatten()
            .map(|pk| census.get_proof(pk).unwrap().0)
            .collect();
        indices.sort();
        assert_eq!(indices, (0..20).collect::<Vec<_>>());
        let _ = std::fs::remove_file(&dir);
    }
}
