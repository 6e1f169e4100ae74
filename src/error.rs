// src/error.rs
//! Error types for the credential vault.
//!
//! Each layer owns one enum. The coordinator wraps them in [`IssuanceError`] so
//! a failure anywhere in the issuance sequence surfaces with its original cause.

use crate::models::proof::ProofKind;
use thiserror::Error;

/// Static pointer shown next to every user-visible failure.
pub const SUPPORT_CONTACT: &str =
    "Please open a ticket in the #support-tickets channel in the Holonym Discord (https://discord.gg/2CFwcPW3Bh) with a description of the error.";

/// Network or non-200 failure from a vendor, the relayer or the backup server.
///
/// The body text of a non-200 response is carried verbatim in `message`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("request to {url} failed (status {status:?}): {message}")]
pub struct TransportError {
    /// Endpoint the request was sent to
    pub url: String,
    /// HTTP status, absent for connection-level failures
    pub status: Option<u16>,
    /// Response body text or transport error description
    pub message: String,
}

impl TransportError {
    pub fn new(url: impl Into<String>, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status,
            message: message.into(),
        }
    }

    pub(crate) fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        Self::new(url, err.status().map(|s| s.as_u16()), err.to_string())
    }
}

/// Input rejected before any side effect happens.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Issuer {0} is not whitelisted.")]
    IssuerNotWhitelisted(String),
    #[error("missing required digest: {0}")]
    MissingDigest(&'static str),
    #[error("invalid field element {value:?}: {reason}")]
    InvalidFieldElement { value: String, reason: String },
    #[error("leaf preimage has {0} entries, expected {1}")]
    PreimageLength(usize, usize),
    #[error("record is missing {0}")]
    MissingField(&'static str),
    #[error("issuer signature is not a 65-byte ECDSA signature: {0}")]
    UnsupportedSignature(String),
}

/// Failures of the symmetric bundle codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("ciphertext is not valid hex: {0}")]
    Hex(String),
    #[error("key digest must be at least 32 bytes of hex, got {0} bytes")]
    KeyLength(usize),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures of the dual-backed stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("local storage failure: {0}")]
    Local(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Failures while building or proving a circuit.
#[derive(Debug, Error)]
pub enum ProofError {
    #[error("a {0} proof is already being generated")]
    AlreadyLoading(ProofKind),
    #[error("circuit synthesis failed: {0}")]
    Synthesis(String),
    #[error("proof serialization failed: {0}")]
    Serialization(String),
    #[error("proof worker stopped: {0}")]
    Worker(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl From<ark_relations::r1cs::SynthesisError> for ProofError {
    fn from(err: ark_relations::r1cs::SynthesisError) -> Self {
        ProofError::Synthesis(err.to_string())
    }
}

impl From<ark_serialize::SerializationError> for ProofError {
    fn from(err: ark_serialize::SerializationError) -> Self {
        ProofError::Serialization(err.to_string())
    }
}

/// Everything that can stop an issuance flow.
#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Proof(#[from] ProofError),
    #[error("secret generation failed: {0}")]
    Randomness(String),
    #[error("Could not send credentials to server.")]
    BackupFailed,
}
