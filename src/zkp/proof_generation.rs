// src/zkp/proof_generation.rs
//! Zero-Knowledge Proof generation.
//!
//! Proofs are Groth16 over BN254. Keys are generated once per proof kind, on
//! first use, from an all-zero instance of the circuit and shared by the prover
//! and [`crate::zkp::proof_verification`] for the rest of the process.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use ark_bn254::{Bn254, Fr};
use ark_groth16::{Groth16, ProvingKey, VerifyingKey};
use ark_relations::r1cs::{ConstraintSynthesizer, ConstraintSystem};
use ark_snark::{CircuitSpecificSetupSNARK, SNARK};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use rand::rngs::OsRng;

use crate::error::ProofError;
use crate::models::proof::{ProofArtifact, ProofKind};
use crate::utils::crypto::field_to_decimal;
use crate::utils::serialization::encode_proof;
use crate::zkp::circuits::ProofCircuit;

/// Proving and verifying key for one circuit.
pub struct CircuitKeys {
    pub proving_key: ProvingKey<Bn254>,
    pub verifying_key: VerifyingKey<Bn254>,
}

/// Keys per proof kind, filled lazily.
static CIRCUIT_KEYS: Lazy<Mutex<HashMap<ProofKind, Arc<CircuitKeys>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Returns the keys for `kind`, running the setup the first time.
///
/// The cache lock is held during setup so concurrent callers wait for one
/// setup rather than racing several.
pub fn circuit_keys(kind: ProofKind) -> Result<Arc<CircuitKeys>, ProofError> {
    let mut keys = CIRCUIT_KEYS
        .lock()
        .map_err(|_| ProofError::Worker("circuit key cache lock poisoned".into()))?;
    if let Some(existing) = keys.get(&kind) {
        return Ok(existing.clone());
    }

    info!("Generating Groth16 keys for {} circuit", kind);
    let (proving_key, verifying_key) = Groth16::<Bn254>::setup(ProofCircuit::blank(kind), &mut OsRng)?;
    let generated = Arc::new(CircuitKeys {
        proving_key,
        verifying_key,
    });
    keys.insert(kind, generated.clone());
    Ok(generated)
}

/// Anything that can turn a witnessed circuit into a [`ProofArtifact`].
///
/// Implementations are blocking; callers run them off the async executor.
pub trait Prover: Send + Sync {
    fn prove(&self, circuit: ProofCircuit) -> Result<ProofArtifact, ProofError>;
}

/// Synthesizes `circuit` with its witness and checks every constraint.
///
/// Groth16 itself does not reject an unsatisfied witness in release builds; it
/// returns a proof that never verifies.
pub fn check_witness(circuit: &ProofCircuit) -> Result<(), ProofError> {
    let cs = ConstraintSystem::<Fr>::new_ref();
    circuit.clone().generate_constraints(cs.clone())?;
    if !cs.is_satisfied()? {
        let kind = circuit.kind();
        let constraint = cs.which_is_unsatisfied()?.unwrap_or_default();
        warn!("Witness does not satisfy the {} circuit ({})", kind, constraint);
        return Err(ProofError::Synthesis(format!(
            "witness does not satisfy the {} circuit",
            kind
        )));
    }
    Ok(())
}

/// Groth16 prover backed by the shared key cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct Groth16Prover;

impl Prover for Groth16Prover {
    fn prove(&self, circuit: ProofCircuit) -> Result<ProofArtifact, ProofError> {
        let kind = circuit.kind();
        check_witness(&circuit)?;
        let keys = circuit_keys(kind)?;
        let public_inputs = circuit.public_inputs();

        let proof = Groth16::<Bn254>::prove(&keys.proving_key, circuit, &mut OsRng)?;
        debug!("Generated {} proof", kind);

        Ok(ProofArtifact {
            proof_type: kind,
            proof: encode_proof(&proof)?,
            public_signals: public_inputs.iter().map(|(_, v)| field_to_decimal(v)).collect(),
            inputs: public_inputs
                .iter()
                .map(|(name, v)| (name.to_string(), field_to_decimal(v)))
                .collect::<BTreeMap<_, _>>(),
        })
    }
}
