// src/utils/serialization.rs
//! Serialization utilities.
//!
//! Provides serialization and deserialization functions for:
//! - JSON data structures (credential bundles, proof metadata)
//! - Groth16 proofs (compressed, Base64-encoded)

use ark_bn254::Bn254;
use ark_groth16::Proof;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use serde::{Deserialize, Serialize};

use crate::error::ProofError;

/// Serializes a value to a JSON string.
///
/// Struct fields serialize in declaration order and maps are `BTreeMap`s, so
/// equal values always produce identical text.
pub fn serialize<T: Serialize>(data: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(data)
}

/// Deserializes a value from a JSON string.
pub fn deserialize<'a, T: Deserialize<'a>>(data: &'a str) -> Result<T, serde_json::Error> {
    serde_json::from_str(data)
}

/// Serializes a Groth16 proof to a Base64-encoded string of its compressed form.
pub fn encode_proof(proof: &Proof<Bn254>) -> Result<String, ProofError> {
    let mut bytes = Vec::new();
    proof.serialize_compressed(&mut bytes)?;
    Ok(base64::encode(bytes))
}

/// Reconstructs a Groth16 proof from [`encode_proof`] output.
pub fn decode_proof(data: &str) -> Result<Proof<Bn254>, ProofError> {
    let bytes = base64::decode(data)
        .map_err(|e| ProofError::Serialization(format!("Base64 decoding failed: {}", e)))?;
    Ok(Proof::<Bn254>::deserialize_compressed(&bytes[..])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn map_serialization_is_order_independent() {
        let mut a = BTreeMap::new();
        a.insert("b", 2);
        a.insert("a", 1);
        let mut b = BTreeMap::new();
        b.insert("a", 1);
        b.insert("b", 2);
        assert_eq!(serialize(&a).unwrap(), serialize(&b).unwrap());
    }

    #[test]
    fn decode_proof_rejects_garbage() {
        assert!(decode_proof("!!not base64!!").is_err());
        assert!(decode_proof(&base64::encode([1u8, 2, 3])).is_err());
    }
}
