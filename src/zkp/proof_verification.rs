// src/zkp/proof_verification.rs
//! # Zero-Knowledge Proof Verification
//!
//! Checks a [`ProofArtifact`] against the verifying key cached for its kind.
//!
//! ## Security Considerations
//! - Keys are generated in-process; an artifact produced by another process
//!   (with different keys) does not verify here.
//! - Public signals are taken from the artifact, so callers that care about a
//!   particular leaf or nullifier must compare those values themselves.

use ark_bn254::{Bn254, Fr};
use ark_groth16::Groth16;
use ark_snark::SNARK;
use log::warn;

use crate::error::ProofError;
use crate::models::proof::ProofArtifact;
use crate::utils::crypto::parse_field;
use crate::utils::serialization::decode_proof;
use crate::zkp::proof_generation::circuit_keys;

/// Verifies a Groth16 proof artifact.
///
/// # Returns
/// - `Ok(true)` if the proof is valid for its public signals
/// - `Ok(false)` if it is not
///
/// # Errors
/// - Base64 or proof deserialization failure
/// - A public signal that is not a field element
pub fn verify_artifact(artifact: &ProofArtifact) -> Result<bool, ProofError> {
    let proof = decode_proof(&artifact.proof)?;
    let public_inputs = artifact
        .public_signals
        .iter()
        .map(|signal| parse_field(signal))
        .collect::<Result<Vec<Fr>, _>>()?;

    let keys = circuit_keys(artifact.proof_type)?;
    let valid = Groth16::<Bn254>::verify(&keys.verifying_key, &public_inputs, &proof)?;
    if !valid {
        warn!("{} proof failed verification", artifact.proof_type);
    }
    Ok(valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::credential::fixtures::{record, GOV_ID_ISSUER};
    use crate::zkp::circuits::ProofCircuit;
    use crate::zkp::proof_generation::{Groth16Prover, Prover};

    #[test]
    fn generated_proofs_verify_and_tampering_is_detected() {
        let preimage = record(GOV_ID_ISSUER, Some("0x10"), "0x15").creds.serialized_as_preimage;
        let artifact = Groth16Prover
            .prove(ProofCircuit::uniqueness(&preimage, "0x01", "123456789").unwrap())
            .unwrap();
        assert!(verify_artifact(&artifact).unwrap());

        let mut tampered = artifact.clone();
        tampered.public_signals[2] = "987654321".to_string();
        assert!(!verify_artifact(&tampered).unwrap());
    }

    #[test]
    fn malformed_artifacts_are_errors() {
        let preimage = record(GOV_ID_ISSUER, None, "0x15").creds.serialized_as_preimage;
        let mut artifact = Groth16Prover.prove(ProofCircuit::kolp(&preimage).unwrap()).unwrap();
        artifact.public_signals[0] = "not a number".to_string();
        assert!(verify_artifact(&artifact).is_err());

        artifact.proof = "%%%".to_string();
        assert!(verify_artifact(&artifact).is_err());
    }
}
