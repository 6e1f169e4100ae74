// src/services/relayer.rs
//! Leaf insertion through the gas-paying relayer.
//!
//! The relayer takes the leaf-insertion proof plus the issuer's signature over
//! the old leaf, submits it on chain and, in the same request, receives the
//! encrypted bundle so it can be backed up alongside the new leaf.
//!
//! Submission is single-attempt. The request carries no idempotency key, so a
//! caller retrying after an ambiguous failure may insert the leaf twice.

use std::str::FromStr;

use async_trait::async_trait;
use ethers_core::types::Signature;
use ethers_core::utils::hex;
use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::error::{TransportError, ValidationError};
use crate::models::credential::IssuerSignature;
use crate::models::proof::ProofArtifact;
use crate::utils::http::execute;

/// On-chain arguments of `addLeaf`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddLeafArgs {
    pub issuer: String,
    pub v: u64,
    pub r: String,
    pub s: String,
    /// Base64 Groth16 proof
    pub zkp: String,
    /// Public inputs, decimal
    pub zkp_inputs: Vec<String>,
}

/// Encrypted bundle the relayer forwards to the backup.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CredsToStore {
    pub sig_digest: String,
    pub encrypted_credentials: String,
    /// Legacy field kept for the wire format; always null
    pub encrypted_symmetric_key: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddLeafRequest {
    pub add_leaf_args: AddLeafArgs,
    pub creds_to_store: CredsToStore,
}

impl AddLeafRequest {
    /// Builds the request from a leaf-insertion proof.
    ///
    /// # Errors
    /// `ValidationError::UnsupportedSignature` unless the issuer signed with a
    /// 65-byte secp256k1 signature.
    pub fn new(
        issuer: &str,
        signature: &IssuerSignature,
        proof: &ProofArtifact,
        creds_to_store: CredsToStore,
    ) -> Result<Self, ValidationError> {
        let (v, r, s) = split_signature(signature)?;
        Ok(Self {
            add_leaf_args: AddLeafArgs {
                issuer: issuer.to_string(),
                v,
                r,
                s,
                zkp: proof.proof.clone(),
                zkp_inputs: proof.public_signals.clone(),
            },
            creds_to_store,
        })
    }
}

/// Splits a 65-byte signature into `v` (27 or 28) and 32-byte hex `r`, `s`.
fn split_signature(signature: &IssuerSignature) -> Result<(u64, String, String), ValidationError> {
    let IssuerSignature::Ecdsa(encoded) = signature else {
        return Err(ValidationError::UnsupportedSignature("EdDSA signature".to_string()));
    };
    let parsed =
        Signature::from_str(encoded).map_err(|e| ValidationError::UnsupportedSignature(e.to_string()))?;
    let v = if parsed.v < 27 { parsed.v + 27 } else { parsed.v };

    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    parsed.r.to_big_endian(&mut r);
    parsed.s.to_big_endian(&mut s);
    Ok((v, format!("0x{}", hex::encode(r)), format!("0x{}", hex::encode(s))))
}

/// Anything that accepts leaf insertions.
#[async_trait]
pub trait Relayer: Send + Sync {
    /// Resolves once the relayer answered 200.
    async fn add_leaf(&self, request: &AddLeafRequest) -> Result<(), TransportError>;
}

/// HTTP relayer client.
#[derive(Clone)]
pub struct RelayerClient {
    client: reqwest::Client,
    base_url: String,
}

impl RelayerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Relayer for RelayerClient {
    async fn add_leaf(&self, request: &AddLeafRequest) -> Result<(), TransportError> {
        let url = format!("{}/addLeaf", self.base_url);
        info!("Submitting leaf for issuer {} to relayer", request.add_leaf_args.issuer);
        execute(self.client.post(&url).json(request), &url).await?;
        Ok(())
    }
}

/// Submits `request` once and reports the outcome through exactly one of the
/// callbacks.
pub async fn submit_with_callbacks<A, E>(relayer: &dyn Relayer, request: &AddLeafRequest, on_accepted: A, on_error: E)
where
    A: FnOnce(),
    E: FnOnce(TransportError),
{
    match relayer.add_leaf(request).await {
        Ok(()) => {
            info!("Relayer accepted leaf");
            on_accepted();
        }
        Err(e) => {
            error!("Relayer rejected leaf: {}", e);
            on_error(e);
        }
    }
}
