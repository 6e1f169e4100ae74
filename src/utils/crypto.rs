// src/utils/crypto.rs
//! Hashing and field-element helpers shared by the wallet and the ZK layer.
//!
//! Digests follow the formats the backup server and relayer expect: SHA-256 as
//! lowercase hex for signature digests, Keccak-256 for Ethereum addresses, and
//! `0x`-prefixed hex for BN254 scalars.

use crate::error::ValidationError;
use ark_bn254::Fr;
use ark_ff::{BigInteger, PrimeField};
use ethers_core::utils::{hex, keccak256};
use num_bigint::BigUint;
use sha2::{Digest, Sha256};

/// Computes a Keccak-256 hash of the input data (Ethereum-compatible).
pub fn hash_data(data: &[u8]) -> [u8; 32] {
    keccak256(data)
}

/// SHA-256 of a UTF-8 string, returned as lowercase hex without prefix.
///
/// Used to turn a wallet signature into the digest that keys the AES cipher
/// and identifies the user to the backup server.
pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)
}

/// The BN254 scalar field modulus as a big integer.
pub fn field_modulus() -> BigUint {
    Fr::MODULUS.into()
}

/// Parses a hex (`0x`-prefixed) or decimal string into a field element.
///
/// Values at or above the modulus are rejected instead of silently reduced;
/// leaves and preimages must already be canonical.
pub fn parse_field(value: &str) -> Result<Fr, ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidFieldElement {
        value: value.to_string(),
        reason: reason.to_string(),
    };
    let trimmed = value.trim();
    let parsed = if let Some(hex_digits) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        if hex_digits.is_empty() {
            BigUint::default()
        } else {
            BigUint::parse_bytes(hex_digits.as_bytes(), 16).ok_or_else(|| invalid("not hex"))?
        }
    } else if trimmed.is_empty() {
        BigUint::default()
    } else {
        BigUint::parse_bytes(trimmed.as_bytes(), 10).ok_or_else(|| invalid("not decimal"))?
    };
    if parsed >= field_modulus() {
        return Err(invalid("exceeds field modulus"));
    }
    Ok(Fr::from(parsed))
}

/// Formats a field element as 32-byte, `0x`-prefixed lowercase hex.
pub fn field_to_hex(value: &Fr) -> String {
    let bytes = value.into_bigint().to_bytes_be();
    format!("0x{}", hex::encode(bytes))
}

/// Formats a field element as a decimal string (circuit public-input format).
pub fn field_to_decimal(value: &Fr) -> String {
    let big: BigUint = value.into_bigint().into();
    big.to_str_radix(10)
}

/// Encodes short text (at most 31 UTF-8 bytes) as the big-endian integer of
/// its bytes, the way issuers commit to names.
pub fn text_to_field(text: &str) -> Result<Fr, ValidationError> {
    let bytes = text.as_bytes();
    if bytes.len() > 31 {
        return Err(ValidationError::InvalidFieldElement {
            value: text.to_string(),
            reason: "text longer than 31 bytes".to_string(),
        });
    }
    Ok(Fr::from(BigUint::from_bytes_be(bytes)))
}

/// Interprets a string (hex or decimal) as an unsigned integer of any size.
pub fn parse_uint(value: &str) -> Option<BigUint> {
    let trimmed = value.trim();
    match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some("") => Some(BigUint::default()),
        Some(digits) => BigUint::parse_bytes(digits.as_bytes(), 16),
        None if trimmed.is_empty() => None,
        None => BigUint::parse_bytes(trimmed.as_bytes(), 10),
    }
}
