use blake2b_simd::Params;
use ff::{FromUniformBytes, PrimeField};
use halo2_gadgets::poseidon::primitives::{self as poseidon, ConstantLength, P128Pow5T3};
use num_bigint::BigUint;
use pasta_curves::Fp;

use crate::{
    errors::VoteError,
    types::{weight_to_bytes, PublicKey},
    Hash,
};

fn hash_to_field(personal: &[u8], bytes: &[u8]) -> Fp {
    let h: [u8; 64] = *Params::new()
        .hash_length(64)
        .personal(personal)
        .hash(bytes)
        .as_array();
    Fp::from_uniform_bytes(&h)
}

pub fn public_key_to_field(pk: &PublicKey) -> Fp {
    hash_to_field(b"CensusPublicKey_", &pk.0)
}

pub fn weight_to_field(weight: &BigUint) -> Fp {
    hash_to_field(b"CensusWeight____", &weight_to_bytes(weight))
}

/// Commitment of a census leaf
pub fn leaf_hash(index: u64, pk: &PublicKey, weight: &BigUint) -> Fp {
    poseidon::Hash::<_, P128Pow5T3, ConstantLength<3>, 3, 2>::init().hash([
        Fp::from(index),
        public_key_to_field(pk),
        weight_to_field(weight),
    ])
}

/// Inner node hash. Two empty children make an empty parent so that the
/// root of an empty tree is zero.
pub fn node_hash(left: Fp, right: Fp) -> Fp {
    if left == Fp::zero() && right == Fp::zero() {
        return Fp::zero();
    }
    poseidon::Hash::<_, P128Pow5T3, ConstantLength<2>, 3, 2>::init().hash([left, right])
}

pub fn to_hash(v: Fp) -> Hash {
    v.to_repr()
}

pub fn from_hash(h: &Hash) -> Result<Fp, VoteError> {
    Option::from(Fp::from_repr(*h))
        .ok_or_else(|| VoteError::InvalidProof(format!("non canonical hash {}", hex::encode(h))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_hash_binds_every_field() {
        let pk = PublicKey([7u8; 32]);
        let w = BigUint::from(5u32);
        let h = leaf_hash(1, &pk, &w);
        assert_eq!(h, leaf_hash(1, &pk, &BigUint::from(5u64)));
        assert_ne!(h, leaf_hash(2, &pk, &w));
        assert_ne!(h, leaf_hash(1, &PublicKey([8u8; 32]), &w));
        assert_ne!(h, leaf_hash(1, &pk, &BigUint::from(6u32)));
        assert_ne!(h, Fp::zero());
    }

    #[test]
    fn empty_nodes() {
        assert_eq!(node_hash(Fp::zero(), Fp::zero()), Fp::zero());
        let one = Fp::one();
        assert_ne!(node_hash(one, Fp::zero()), node_hash(Fp::zero(), one));
    }

    #[test]
    fn hash_repr() {
        let v = leaf_hash(0, &PublicKey([1u8; 32]), &BigUint::default());
        assert_eq!(from_hash(&to_hash(v)).unwrap(), v);
        assert!(from_hash(&[0xFF; 32]).is_err());
    }
}
