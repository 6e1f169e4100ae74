// src/zkp/leaf.rs
//! Leaf construction.
//!
//! A leaf is the Poseidon hash of a six-element preimage:
//!
//! | slot | content                 |
//! |------|-------------------------|
//! | 0    | issuer                  |
//! | 1    | secret                  |
//! | 2    | custom field 0          |
//! | 3    | custom field 1          |
//! | 4    | issued-at               |
//! | 5    | scope                   |
//!
//! The ordering is shared with the issuing and verifying circuits. Reordering
//! yields a leaf nobody can verify.

use ark_bn254::Fr;

use crate::error::ValidationError;
use crate::models::credential::CredentialRecord;
use crate::utils::crypto::{field_to_hex, parse_field};
use crate::zkp::poseidon::poseidon_hash;

pub const PREIMAGE_LEN: usize = 6;
pub const ISSUER_SLOT: usize = 0;
pub const SECRET_SLOT: usize = 1;
pub const CUSTOM_FIELD_SLOTS: [usize; 2] = [2, 3];
pub const IAT_SLOT: usize = 4;
pub const SCOPE_SLOT: usize = 5;

/// Parses a serialized preimage into field elements, checking its length.
pub fn parse_preimage(preimage: &[String]) -> Result<[Fr; PREIMAGE_LEN], ValidationError> {
    if preimage.len() != PREIMAGE_LEN {
        return Err(ValidationError::PreimageLength(preimage.len(), PREIMAGE_LEN));
    }
    let mut out = [Fr::from(0u64); PREIMAGE_LEN];
    for (slot, value) in preimage.iter().enumerate() {
        out[slot] = parse_field(value)?;
    }
    Ok(out)
}

/// Copies `preimage`, replacing only the secret slot.
pub fn build_new_preimage(preimage: &[String], new_secret: &str) -> Result<Vec<String>, ValidationError> {
    if preimage.len() != PREIMAGE_LEN {
        return Err(ValidationError::PreimageLength(preimage.len(), PREIMAGE_LEN));
    }
    parse_field(new_secret)?;
    let mut new_preimage = preimage.to_vec();
    new_preimage[SECRET_SLOT] = new_secret.to_string();
    Ok(new_preimage)
}

/// Commitment over an ordered preimage, as `0x`-prefixed hex.
pub fn compute_leaf(preimage: &[String]) -> Result<String, ValidationError> {
    let fields = parse_preimage(preimage)?;
    Ok(field_to_hex(&poseidon_hash(&fields)))
}

/// Returns a copy of `record` carrying `new_secret`, the new preimage and the
/// new leaf. Everything the issuer signed is left as it was.
pub fn attach_new_secret(record: &CredentialRecord, new_secret: &str) -> Result<CredentialRecord, ValidationError> {
    let new_preimage = build_new_preimage(&record.creds.serialized_as_preimage, new_secret)?;
    let new_leaf = compute_leaf(&new_preimage)?;

    let mut updated = record.clone();
    updated.creds.new_secret = Some(new_secret.to_string());
    updated.creds.serialized_as_new_preimage = Some(new_preimage);
    updated.new_leaf = Some(new_leaf);
    Ok(updated)
}
