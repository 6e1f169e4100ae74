// src/storage/proof_metadata.rs
//! Encrypted record of the proofs a user has submitted on chain.
//!
//! Stored like the credential bundle (AES ciphertext, locally and in the
//! backup) but without the KOLP requirement: the backup accepts metadata
//! writes from anyone holding the auth digest. The pipeline reads it to skip
//! soul-bound proofs that are already on chain.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::{StoreError, ValidationError};
use crate::models::proof::{ProofKind, ProofMetadataItem, TxReceipt};
use crate::storage::backup_client::BackupServer;
use crate::storage::kv::{self, keys, KeyValueStore};
use crate::utils::crypto::parse_uint;
use crate::wallet::codec::{CredentialCodec, Decrypted};

/// Builds a metadata item from a mined transaction.
///
/// The sender address is left-padded to 20 bytes of lowercase hex. Only
/// uniqueness proofs carry an action id, falling back to `default_action_id`.
pub fn item_from_tx(
    tx: &TxReceipt,
    sender_address: Option<&str>,
    proof_type: ProofKind,
    action_id: Option<&str>,
    default_action_id: &str,
) -> Result<ProofMetadataItem, ValidationError> {
    let sender = sender_address.unwrap_or("0x00");
    let invalid = |reason: &str| ValidationError::InvalidFieldElement {
        value: sender.to_string(),
        reason: reason.to_string(),
    };
    let digits = parse_uint(sender).ok_or_else(|| invalid("not an address"))?.to_str_radix(16);
    if digits.len() > 40 {
        return Err(invalid("address longer than 20 bytes"));
    }

    let action_id = match proof_type {
        ProofKind::Uniqueness => Some(action_id.filter(|id| !id.is_empty()).unwrap_or(default_action_id).to_string()),
        _ => None,
    };
    Ok(ProofMetadataItem {
        proof_type: proof_type.as_str().to_string(),
        action_id,
        submitter_address: format!("0x{:0>40}", digits),
        chain_id: tx.chain_id,
        block_number: tx.block_number,
        tx_hash: tx.transaction_hash.clone(),
    })
}

/// Appends `incoming` to `merged`, skipping items whose `tx_hash` is present.
fn dedup_by_tx_hash(merged: &mut Vec<ProofMetadataItem>, incoming: Vec<ProofMetadataItem>) {
    for item in incoming {
        if !merged.iter().any(|existing| existing.tx_hash == item.tx_hash) {
            merged.push(item);
        }
    }
}

pub struct ProofMetadataStore {
    local: Arc<dyn KeyValueStore>,
    backup: Arc<dyn BackupServer>,
    default_action_id: String,
}

impl ProofMetadataStore {
    pub fn new(local: Arc<dyn KeyValueStore>, backup: Arc<dyn BackupServer>, default_action_id: impl Into<String>) -> Self {
        Self {
            local,
            backup,
            default_action_id: default_action_id.into(),
        }
    }

    /// Reads local and remote metadata, local items first, de-duplicated by
    /// transaction hash. With `restore`, a non-empty result is written back
    /// to both copies; a failed remote write there is only logged.
    ///
    /// # Errors
    /// Fails if the backup cannot be read, since a partial list could later
    /// overwrite the remote copy.
    pub async fn get(&self, key_gen_digest: &str, auth_digest: &str, restore: bool) -> Result<Vec<ProofMetadataItem>, StoreError> {
        if key_gen_digest.is_empty() || auth_digest.is_empty() {
            return Err(ValidationError::MissingDigest("signature digest").into());
        }
        let codec = CredentialCodec::new(key_gen_digest)?;

        let local_ciphertext = match kv::get_defined(self.local.as_ref(), keys::SIG_DIGEST)? {
            Some(_) => kv::get_defined(self.local.as_ref(), keys::ENCRYPTED_PROOF_METADATA)?,
            None => None,
        };
        let remote_ciphertext = self.backup.fetch_proof_metadata(auth_digest).await?;

        let mut merged = Vec::new();
        for ciphertext in [local_ciphertext, remote_ciphertext].into_iter().flatten() {
            if !kv::is_defined(&ciphertext) {
                continue;
            }
            match codec.decrypt::<Vec<ProofMetadataItem>>(&ciphertext) {
                Decrypted::Structured(items) => dedup_by_tx_hash(&mut merged, items),
                Decrypted::Raw(_) => debug!("Ignoring proof metadata that is not a list"),
                Decrypted::Failed(e) => warn!("Could not decrypt proof metadata: {}", e),
            }
        }

        if restore && !merged.is_empty() {
            let ciphertext = codec.encrypt(&merged)?;
            self.local.set(keys::ENCRYPTED_PROOF_METADATA, &ciphertext)?;
            if let Err(e) = self.backup.store_proof_metadata(auth_digest, &ciphertext).await {
                warn!("Could not restore proof metadata to remote backup: {}", e);
            }
        }
        Ok(merged)
    }

    /// Records a submitted proof locally and in the backup.
    ///
    /// # Returns
    /// `false` if the backup could not be read or written; in the first case
    /// nothing is written at all.
    pub async fn add_item(
        &self,
        tx: &TxReceipt,
        sender_address: Option<&str>,
        proof_type: ProofKind,
        action_id: Option<&str>,
        key_gen_digest: &str,
        auth_digest: &str,
    ) -> Result<bool, StoreError> {
        let item = item_from_tx(tx, sender_address, proof_type, action_id, &self.default_action_id)?;
        info!("Storing proof metadata for {} tx {}", item.proof_type, item.tx_hash);

        let mut items = match self.get(key_gen_digest, auth_digest, false).await {
            Ok(items) => items,
            Err(StoreError::Transport(e)) => {
                warn!("Could not read proof metadata before adding an item: {}", e);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        items.push(item);

        let ciphertext = CredentialCodec::new(key_gen_digest)?.encrypt(&items)?;
        self.local.set(keys::ENCRYPTED_PROOF_METADATA, &ciphertext)?;
        match self.backup.store_proof_metadata(auth_digest, &ciphertext).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Could not send proof metadata to remote backup: {}", e);
                Ok(false)
            }
        }
    }
}
