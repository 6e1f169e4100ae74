// src/models/proof.rs
//! Proof artifacts and on-chain proof metadata.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Every proof the wallet knows how to produce.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProofKind {
    /// Anti-sybil proof bound to an action id
    #[serde(rename = "uniqueness")]
    Uniqueness,
    #[serde(rename = "us-residency")]
    UsResidency,
    #[serde(rename = "medical-specialty")]
    MedicalSpecialty,
    #[serde(rename = "gov-id-firstname-lastname")]
    GovIdFirstNameLastName,
    /// Knowledge of leaf preimage; authenticates backup writes
    #[serde(rename = "kolp")]
    Kolp,
    /// Old-leaf to new-leaf transition submitted through the relayer
    #[serde(rename = "add-leaf")]
    LeafInsertion,
}

impl ProofKind {
    pub const ALL: [ProofKind; 6] = [
        ProofKind::Uniqueness,
        ProofKind::UsResidency,
        ProofKind::MedicalSpecialty,
        ProofKind::GovIdFirstNameLastName,
        ProofKind::Kolp,
        ProofKind::LeafInsertion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProofKind::Uniqueness => "uniqueness",
            ProofKind::UsResidency => "us-residency",
            ProofKind::MedicalSpecialty => "medical-specialty",
            ProofKind::GovIdFirstNameLastName => "gov-id-firstname-lastname",
            ProofKind::Kolp => "kolp",
            ProofKind::LeafInsertion => "add-leaf",
        }
    }

    /// Kinds that mint a soul-bound token; once one is on chain (recorded in
    /// proof metadata) there is no need to generate it again.
    pub fn is_soul_bound(&self) -> bool {
        matches!(
            self,
            ProofKind::Uniqueness | ProofKind::UsResidency | ProofKind::MedicalSpecialty
        )
    }
}

impl fmt::Display for ProofKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A generated proof with the values a verifier needs.
///
/// `public_signals` are the circuit public inputs in allocation order, as
/// decimal strings. `inputs` names the same values for API consumers (the
/// relayer reads them as `zkpInputs`).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProofArtifact {
    pub proof_type: ProofKind,
    /// Base64 of the compressed Groth16 proof
    pub proof: String,
    pub public_signals: Vec<String>,
    pub inputs: BTreeMap<String, String>,
}

/// Public record of a proof submitted on chain.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProofMetadataItem {
    pub proof_type: String,
    /// Only present for uniqueness proofs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    #[serde(rename = "address")]
    pub submitter_address: String,
    pub chain_id: u64,
    pub block_number: u64,
    pub tx_hash: String,
}

/// The parts of a mined transaction a metadata item is built from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub chain_id: u64,
    pub block_number: u64,
    pub transaction_hash: String,
}
