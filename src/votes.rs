use rusqlite::{ffi, params, Connection};

use crate::{
    census::check_proof,
    db::{is_constraint, read_process, SqliteStore},
    errors::VoteError,
    types::{
        weight_from_bytes, weight_or_zero, weight_to_bytes, CensusProof, ProcessId, ProcessStatus,
        PublicKey, StoredVotePackage, VotePackage,
    },
};

/// index + publicKey + processID, unique across every process of the table
/// 48 = 8 + 32 + 8
fn vote_id(process_id: ProcessId, vote: &VotePackage) -> [u8; 48] {
    let mut id = [0u8; 48];
    id[0..8].copy_from_slice(&vote.census_proof.index.to_le_bytes());
    id[8..40].copy_from_slice(&vote.census_proof.public_key.0);
    id[40..48].copy_from_slice(&process_id.to_le_bytes());
    id
}

pub fn store_vote_package(
    connection: &Connection,
    process_id: ProcessId,
    vote: &VotePackage,
) -> Result<(), VoteError> {
    let proof = &vote.census_proof;
    let weight = weight_or_zero(proof.weight.as_ref());
    let r = connection.execute(
        "INSERT INTO votepackages(
        id,
        indx,
        public_key,
        weight,
        merkleproof,
        signature,
        vote,
        inserted_datetime,
        process_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, CURRENT_TIMESTAMP, ?8)",
        params![
            &vote_id(process_id, vote)[..],
            proof.index,
            &proof.public_key.0[..],
            weight_to_bytes(&weight),
            proof.merkle_proof,
            vote.signature,
            vote.vote,
            process_id
        ],
    );
    match r {
        Ok(_) => Ok(()),
        Err(err) if is_constraint(&err, ffi::SQLITE_CONSTRAINT_PRIMARYKEY) => {
            Err(VoteError::DuplicateVote {
                index: proof.index,
                process_id,
            })
        }
        Err(err) if is_constraint(&err, ffi::SQLITE_CONSTRAINT_FOREIGNKEY) => {
            Err(VoteError::ProcessNotFound(process_id))
        }
        Err(err) => Err(err.into()),
    }
}

/// Vote packages of a process sorted by census index, then public key
pub fn read_vote_packages_by_process_id(
    connection: &Connection,
    process_id: ProcessId,
) -> Result<Vec<StoredVotePackage>, VoteError> {
    let mut s = connection.prepare(
        "SELECT signature, indx, public_key, weight, merkleproof, vote, inserted_datetime
        FROM votepackages WHERE process_id = ?1 ORDER BY indx ASC, public_key ASC",
    )?;
    let rows = s.query_map([process_id], |r| {
        let signature = r.get::<_, Vec<u8>>(0)?;
        let index = r.get::<_, u64>(1)?;
        let public_key = r.get::<_, [u8; 32]>(2)?;
        let weight = r.get::<_, Vec<u8>>(3)?;
        let merkle_proof = r.get::<_, Vec<u8>>(4)?;
        let vote = r.get::<_, Vec<u8>>(5)?;
        let inserted_at = r.get::<_, String>(6)?;
        Ok(StoredVotePackage {
            process_id,
            package: VotePackage {
                signature,
                census_proof: CensusProof {
                    index,
                    public_key: PublicKey(public_key),
                    weight: Some(weight_from_bytes(&weight)),
                    merkle_proof,
                },
                vote,
            },
            inserted_at,
        })
    })?;
    let votes = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(votes)
}

/// Stores a vote after checking that the process still accepts votes and
/// that the census proof belongs to the census of the process.
pub fn submit_vote(
    connection: &Connection,
    process_id: ProcessId,
    vote: &VotePackage,
) -> Result<(), VoteError> {
    let process = read_process(connection, process_id)?;
    match process.status {
        ProcessStatus::On => {}
        ProcessStatus::Frozen => return Err(VoteError::ProcessFrozen(process_id)),
        ProcessStatus::ContractClosed => return Err(VoteError::ProcessClosed(process_id)),
    }
    let proof = &vote.census_proof;
    let valid = check_proof(
        &process.census_root_le(),
        &proof.merkle_proof,
        proof.index,
        &proof.public_key,
        proof.weight.as_ref(),
    )?;
    if !valid {
        return Err(VoteError::InvalidCensusProof(process_id));
    }
    store_vote_package(connection, process_id, vote)
}

impl SqliteStore {
    pub fn store_vote_package(
        &self,
        process_id: ProcessId,
        vote: &VotePackage,
    ) -> Result<(), VoteError> {
        store_vote_package(&*self.connection()?, process_id, vote)
    }

    pub fn read_vote_packages_by_process_id(
        &self,
        process_id: ProcessId,
    ) -> Result<Vec<StoredVotePackage>, VoteError> {
        read_vote_packages_by_process_id(&*self.connection()?, process_id)
    }

    pub fn submit_vote(&self, process_id: ProcessId, vote: &VotePackage) -> Result<(), VoteError> {
        submit_vote(&*self.connection()?, process_id, vote)
    }
}
