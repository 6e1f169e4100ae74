// src/wallet/key_management.rs
//! Wallet key management.
//!
//! The vault never stores a password. Instead, the user's wallet signs two fixed
//! messages and the SHA-256 digests of those signatures become:
//! - the **key-generation digest**, which keys the AES bundle cipher, and
//! - the **auth digest**, which identifies the user's rows on the backup server.
//!
//! ECDSA over secp256k1 is deterministic (RFC 6979), so the same wallet always
//! re-derives the same digests on any device.

use ethers_core::types::Address;
use ethers_core::utils::{hash_message, hex};
use k256::ecdsa::{RecoveryId, Signature, SigningKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::SecretKey;
use rand::rngs::OsRng;

use crate::error::ValidationError;
use crate::utils::crypto::{hash_data, sha256_hex};

/// Message whose signature derives the bundle encryption key.
pub const KEY_GEN_MESSAGE: &str =
    "Sign this message to generate the key that encrypts your Holonym credentials. This is free and will not make a transaction.";

/// Message whose signature identifies the user to the backup server.
pub const AUTH_MESSAGE: &str =
    "Sign this message to authenticate to the Holonym backup server. This is free and will not make a transaction.";

/// Digests derived from the wallet's signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureDigests {
    pub key_gen: String,
    pub auth: String,
}

/// Secp256k1 wallet that signs with Ethereum personal-message semantics.
#[derive(Clone)]
pub struct WalletSigner {
    signing_key: SigningKey,
}

impl WalletSigner {
    /// Generates a new wallet from the system RNG.
    pub fn new() -> Self {
        let secret_key = SecretKey::random(&mut OsRng);
        Self {
            signing_key: SigningKey::from(&secret_key),
        }
    }

    /// Loads a wallet from a hex private key (with or without `0x`).
    pub fn from_private_key_hex(private_key: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidFieldElement {
            value: "<private key>".to_string(),
            reason,
        };
        let bytes = hex::decode(private_key.trim_start_matches("0x")).map_err(|e| invalid(e.to_string()))?;
        let signing_key = SigningKey::from_slice(&bytes).map_err(|e| invalid(e.to_string()))?;
        Ok(Self { signing_key })
    }

    /// Signs `message` as an Ethereum personal message.
    ///
    /// # Returns
    /// 65-byte signature (R || S || V, V in {27, 28}) as `0x`-prefixed hex
    pub fn sign_message(&self, message: &str) -> Result<String, ValidationError> {
        let hash = hash_message(message);
        let (signature, recovery_id): (Signature, RecoveryId) = self
            .signing_key
            .sign_prehash_recoverable(hash.as_bytes())
            .map_err(|e| ValidationError::UnsupportedSignature(e.to_string()))?;
        let mut bytes = signature.to_vec();
        bytes.push(27 + recovery_id.to_byte());
        Ok(format!("0x{}", hex::encode(bytes)))
    }

    /// Signs both fixed messages and hashes the signatures.
    pub fn derive_digests(&self) -> Result<SignatureDigests, ValidationError> {
        Ok(SignatureDigests {
            key_gen: sha256_hex(&self.sign_message(KEY_GEN_MESSAGE)?),
            auth: sha256_hex(&self.sign_message(AUTH_MESSAGE)?),
        })
    }

    /// Ethereum address of the wallet (Keccak-256 of the uncompressed key).
    pub fn address(&self) -> Address {
        let public_key = self.signing_key.verifying_key().to_encoded_point(false);
        let hash = hash_data(&public_key.as_bytes()[1..]);
        Address::from_slice(&hash[12..])
    }
}

impl Default for WalletSigner {
    fn default() -> Self {
        Self::new()
    }
}
