// src/storage/credential_store.rs
//! Dual-backed credential storage.
//!
//! The credential bundle lives in two places: the device's local store and the
//! remote backup. Both hold the same AES ciphertext, but they can diverge (a
//! second browser, a failed backup write). [`CredentialStore::get`] reads both,
//! merges them per issuer and writes the merged result back to both, so the
//! copies converge on every read.

use std::cmp::Ordering;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_json::Value;

use crate::error::{CodecError, ProofError, StoreError, ValidationError};
use crate::models::credential::{record_for, CredentialRecord, IssuerWhitelist, SortedCredentials};
use crate::models::proof::ProofArtifact;
use crate::storage::backup_client::BackupServer;
use crate::storage::kv::{self, keys, KeyValueStore};
use crate::utils::crypto::parse_uint;
use crate::utils::serialization::{deserialize, serialize};
use crate::wallet::codec::{CredentialCodec, Decrypted};
use crate::zkp::circuits::ProofCircuit;
use crate::zkp::proof_generation::Prover;

/// Orders two same-issuer records, most recently issued first.
///
/// A record without `iat` sorts after one with it. Two records without `iat`,
/// or with an `iat` that is not an integer, compare equal.
pub fn compare_recency(a: &CredentialRecord, b: &CredentialRecord) -> Ordering {
    match (a.issued_at(), b.issued_at()) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a_iat), Some(b_iat)) => match (parse_uint(a_iat), parse_uint(b_iat)) {
            (Some(a_time), Some(b_time)) => b_time.cmp(&a_time),
            _ => {
                warn!("Unparsable iat while merging ({:?} vs {:?}); keeping the first copy", a_iat, b_iat);
                Ordering::Equal
            }
        },
    }
}

/// Merges bundles per whitelisted issuer.
///
/// `sources` are in priority order for ties (remote before local). For each
/// issuer the most recently issued record wins; ties keep the earliest source.
/// Issuers outside the whitelist are dropped.
pub fn merge(sources: &[SortedCredentials], whitelist: &IssuerWhitelist) -> SortedCredentials {
    let mut merged = SortedCredentials::new();
    for issuer in whitelist.iter() {
        let mut candidates = sources.iter().filter_map(|bundle| record_for(bundle, issuer));
        let Some(mut chosen) = candidates.next() else {
            continue;
        };
        for candidate in candidates {
            if compare_recency(candidate, chosen) == Ordering::Less {
                chosen = candidate;
            }
        }
        merged.insert(issuer.to_string(), chosen.clone());
    }
    merged
}

/// Parses a decrypted bundle record by record, skipping entries that do not
/// have the credential shape.
fn parse_bundle(raw: serde_json::Map<String, Value>) -> SortedCredentials {
    raw.into_iter()
        .filter_map(|(issuer, value)| match serde_json::from_value::<CredentialRecord>(value) {
            Ok(record) => Some((issuer, record)),
            Err(e) => {
                debug!("Skipping malformed record for {}: {}", issuer, e);
                None
            }
        })
        .collect()
}

/// Credential bundle storage across the local device and the remote backup.
pub struct CredentialStore {
    local: Arc<dyn KeyValueStore>,
    backup: Arc<dyn BackupServer>,
    whitelist: IssuerWhitelist,
    prover: Option<Arc<dyn Prover>>,
}

impl CredentialStore {
    pub fn new(local: Arc<dyn KeyValueStore>, backup: Arc<dyn BackupServer>, whitelist: IssuerWhitelist) -> Self {
        Self {
            local,
            backup,
            whitelist,
            prover: None,
        }
    }

    /// Lets [`set`](Self::set) generate a KOLP proof when none is supplied or cached.
    pub fn with_prover(mut self, prover: Arc<dyn Prover>) -> Self {
        self.prover = Some(prover);
        self
    }

    pub fn whitelist(&self) -> &IssuerWhitelist {
        &self.whitelist
    }

    /// Reads, merges and re-persists the user's credentials.
    ///
    /// # Returns
    /// `None` if neither copy holds a record from a whitelisted issuer.
    ///
    /// # Errors
    /// - `ValidationError::MissingDigest` for an empty digest
    /// - local storage failures
    ///
    /// A failing or unreachable backup is logged and treated as empty.
    pub async fn get(&self, key_gen_digest: &str, auth_digest: &str) -> Result<Option<SortedCredentials>, StoreError> {
        require_digests(key_gen_digest, auth_digest)?;
        let codec = CredentialCodec::new(key_gen_digest)?;

        let remote_ciphertext = match self.backup.fetch_credentials(auth_digest).await {
            Ok(ciphertext) => ciphertext,
            Err(e) => {
                info!("Error fetching creds from remote backup: {}", e);
                None
            }
        };
        let local_ciphertext = self.local_ciphertext()?;

        let mut sources = Vec::new();
        for (origin, ciphertext) in [("remote", remote_ciphertext), ("local", local_ciphertext)] {
            let Some(ciphertext) = ciphertext.filter(|c| kv::is_defined(c)) else {
                continue;
            };
            match codec.decrypt::<serde_json::Map<String, Value>>(&ciphertext) {
                Decrypted::Structured(raw) => sources.push(parse_bundle(raw)),
                Decrypted::Raw(text) => debug!("Ignoring {} creds that decrypt to non-JSON ({} bytes)", origin, text.len()),
                Decrypted::Failed(e) => warn!("Could not decrypt {} creds: {}", origin, e),
            }
        }

        let merged = merge(&sources, &self.whitelist);
        if merged.is_empty() {
            debug!("No whitelisted credentials found");
            return Ok(None);
        }
        info!("Merged credentials for {} issuer(s)", merged.len());
        if !self.set(&merged, key_gen_digest, auth_digest, None).await? {
            debug!("Merged credentials stored locally only");
        }
        Ok(Some(merged))
    }

    /// Encrypts `creds` and stores them locally and remotely.
    ///
    /// `creds` must be the user's complete bundle; whatever is stored here
    /// replaces both copies.
    ///
    /// The remote write needs a KOLP proof: `proof` if given, else the cached
    /// latest proof, else one generated from the first record carrying a new
    /// preimage (only with a prover attached).
    ///
    /// # Returns
    /// `true` if the remote write succeeded. The local write is never rolled
    /// back when the remote one fails.
    pub async fn set(
        &self,
        creds: &SortedCredentials,
        key_gen_digest: &str,
        auth_digest: &str,
        proof: Option<&ProofArtifact>,
    ) -> Result<bool, StoreError> {
        let ciphertext = self.write_local(creds, key_gen_digest, auth_digest)?;

        let kolp = match proof.cloned() {
            Some(proof) => Some(proof),
            None => match self.latest_kolp_proof()? {
                Some(cached) => Some(cached),
                None => self.generate_kolp(creds).await,
            },
        };
        let Some(kolp) = kolp else {
            warn!("No KOLP proof available; credentials stored locally only");
            return Ok(false);
        };
        self.set_latest_kolp_proof(&kolp)?;

        match self.backup.store_credentials(auth_digest, Some(&kolp), &ciphertext).await {
            Ok(()) => Ok(true),
            Err(e) => {
                error!("Error sending encrypted creds to remote backup: {}", e);
                Ok(false)
            }
        }
    }

    /// Encrypts `creds` into the local store only.
    ///
    /// Used when the user confirms an issuance, before the leaf reaches the
    /// relayer, so an interrupted flow still leaves the new secret on the device.
    pub fn set_local(&self, creds: &SortedCredentials, key_gen_digest: &str, auth_digest: &str) -> Result<(), StoreError> {
        self.write_local(creds, key_gen_digest, auth_digest).map(|_| ())
    }

    fn write_local(&self, creds: &SortedCredentials, key_gen_digest: &str, auth_digest: &str) -> Result<String, StoreError> {
        require_digests(key_gen_digest, auth_digest)?;
        for (issuer, record) in creds {
            if !self.whitelist.contains(issuer) {
                return Err(ValidationError::IssuerNotWhitelisted(issuer.clone()).into());
            }
            self.whitelist.check(record)?;
        }

        let ciphertext = CredentialCodec::new(key_gen_digest)?.encrypt(creds)?;
        self.local.set(keys::SIG_DIGEST, auth_digest)?;
        self.local.set(keys::ENCRYPTED_CREDENTIALS, &ciphertext)?;
        Ok(ciphertext)
    }

    /// Cached KOLP proof; sentinels and unparsable values read as absent.
    pub fn latest_kolp_proof(&self) -> Result<Option<ProofArtifact>, StoreError> {
        Ok(kv::get_defined(self.local.as_ref(), keys::LATEST_KOLP_PROOF)?
            .and_then(|cached| deserialize::<ProofArtifact>(&cached).ok()))
    }

    pub fn set_latest_kolp_proof(&self, proof: &ProofArtifact) -> Result<(), StoreError> {
        let encoded = serialize(proof).map_err(CodecError::from)?;
        self.local.set(keys::LATEST_KOLP_PROOF, &encoded)
    }

    fn local_ciphertext(&self) -> Result<Option<String>, StoreError> {
        let sig_digest = kv::get_defined(self.local.as_ref(), keys::SIG_DIGEST)?;
        let ciphertext = kv::get_defined(self.local.as_ref(), keys::ENCRYPTED_CREDENTIALS)?;
        Ok(sig_digest.and(ciphertext))
    }

    async fn generate_kolp(&self, creds: &SortedCredentials) -> Option<ProofArtifact> {
        let prover = self.prover.clone()?;
        let (_, preimage) = creds.values().find_map(|record| record.new_witness().ok())?;
        let circuit = match ProofCircuit::kolp(preimage) {
            Ok(circuit) => circuit,
            Err(e) => {
                error!("Cannot build KOLP circuit: {}", e);
                return None;
            }
        };

        let outcome = tokio::task::spawn_blocking(move || prover.prove(circuit))
            .await
            .map_err(|e| ProofError::Worker(e.to_string()))
            .and_then(|result| result);
        match outcome {
            Ok(artifact) => Some(artifact),
            Err(e) => {
                error!("KOLP proof generation failed: {}", e);
                None
            }
        }
    }
}

fn require_digests(key_gen_digest: &str, auth_digest: &str) -> Result<(), ValidationError> {
    if key_gen_digest.is_empty() {
        return Err(ValidationError::MissingDigest("key generation signature digest"));
    }
    if auth_digest.is_empty() {
        return Err(ValidationError::MissingDigest("auth signature digest"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::credential::fixtures::{record, GOV_ID_ISSUER, PHONE_ISSUER};
    use crate::models::proof::ProofKind;
    use crate::storage::backup_client::MemoryBackup;
    use crate::storage::kv::MemoryStore;
    use crate::zkp::leaf::attach_new_secret;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    const KEY_GEN: &str = "2222222222222222222222222222222222222222222222222222222222222222";
    const AUTH: &str = "auth-digest";

    struct CountingProver {
        calls: AtomicUsize,
    }

    impl Prover for CountingProver {
        fn prove(&self, circuit: ProofCircuit) -> Result<ProofArtifact, ProofError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(ProofArtifact {
                proof_type: circuit.kind(),
                proof: "ZmFrZQ==".to_string(),
                public_signals: vec![],
                inputs: BTreeMap::new(),
            })
        }
    }

    fn kolp() -> ProofArtifact {
        ProofArtifact {
            proof_type: ProofKind::Kolp,
            proof: "a29scA==".to_string(),
            public_signals: vec!["7".to_string()],
            inputs: BTreeMap::new(),
        }
    }

    fn bundle(records: &[CredentialRecord]) -> SortedCredentials {
        records
            .iter()
            .map(|r| (r.issuer_id().to_string(), r.clone()))
            .collect()
    }

    fn whitelist() -> IssuerWhitelist {
        IssuerWhitelist::new([GOV_ID_ISSUER, PHONE_ISSUER])
    }

    fn store() -> (CredentialStore, Arc<MemoryStore>, Arc<MemoryBackup>) {
        let local = Arc::new(MemoryStore::new());
        let backup = Arc::new(MemoryBackup::new());
        (CredentialStore::new(local.clone(), backup.clone(), whitelist()), local, backup)
    }

    fn encrypt(creds: &SortedCredentials) -> String {
        CredentialCodec::new(KEY_GEN).unwrap().encrypt(creds).unwrap()
    }

    fn seed_local(local: &MemoryStore, creds: &SortedCredentials) {
        local.set(keys::SIG_DIGEST, AUTH).unwrap();
        local.set(keys::ENCRYPTED_CREDENTIALS, &encrypt(creds)).unwrap();
    }

    #[test]
    fn larger_iat_wins_regardless_of_source() {
        let older = bundle(&[record(GOV_ID_ISSUER, Some("0x10"), "0x01")]);
        let newer = bundle(&[record(GOV_ID_ISSUER, Some("0x20"), "0x02")]);

        let merged = merge(&[older.clone(), newer.clone()], &whitelist());
        assert_eq!(merged[GOV_ID_ISSUER].creds.secret, "0x02");
        let merged = merge(&[newer, older], &whitelist());
        assert_eq!(merged[GOV_ID_ISSUER].creds.secret, "0x02");
    }

    #[test]
    fn decimal_and_hex_iats_compare_numerically() {
        let hex = bundle(&[record(GOV_ID_ISSUER, Some("0xff"), "0x01")]);
        let decimal = bundle(&[record(GOV_ID_ISSUER, Some("256"), "0x02")]);
        assert_eq!(merge(&[hex, decimal], &whitelist())[GOV_ID_ISSUER].creds.secret, "0x02");
    }

    #[test]
    fn malformed_or_missing_iat_does_not_abort_merge() {
        let malformed = bundle(&[record(GOV_ID_ISSUER, Some("yesterday"), "0x01")]);
        let valid = bundle(&[record(GOV_ID_ISSUER, Some("0x20"), "0x02")]);
        assert_eq!(merge(&[malformed.clone(), valid.clone()], &whitelist())[GOV_ID_ISSUER].creds.secret, "0x01");
        assert_eq!(merge(&[valid.clone(), malformed], &whitelist())[GOV_ID_ISSUER].creds.secret, "0x02");

        let missing = bundle(&[record(GOV_ID_ISSUER, None, "0x03")]);
        assert_eq!(merge(&[missing, valid], &whitelist())[GOV_ID_ISSUER].creds.secret, "0x02");
    }

    #[test]
    fn merge_combines_issuers_and_drops_strangers() {
        let stranger = "0x0000000000000000000000000000000000000000000000000000000000000099";
        let remote = bundle(&[record(GOV_ID_ISSUER, None, "0x01"), record(stranger, None, "0x09")]);
        let local = bundle(&[record(PHONE_ISSUER, None, "0x02")]);
        let merged = merge(&[remote, local], &whitelist());
        assert_eq!(merged.keys().cloned().collect::<Vec<_>>(), vec![PHONE_ISSUER, GOV_ID_ISSUER]);
    }

    #[tokio::test]
    async fn get_merges_and_heals_both_copies() {
        let (store, local, backup) = store();
        store.set_latest_kolp_proof(&kolp()).unwrap();
        seed_local(&local, &bundle(&[record(GOV_ID_ISSUER, Some("0x10"), "0x01")]));
        backup.put_credentials(AUTH, &encrypt(&bundle(&[record(PHONE_ISSUER, None, "0x02")])));

        let merged = store.get(KEY_GEN, AUTH).await.unwrap().unwrap();
        assert_eq!(merged.len(), 2);

        let codec = CredentialCodec::new(KEY_GEN).unwrap();
        let remote_copy = codec
            .decrypt::<SortedCredentials>(&backup.credentials(AUTH).unwrap())
            .structured();
        assert_eq!(remote_copy, Some(merged.clone()));
        let local_copy = codec
            .decrypt::<SortedCredentials>(&local.get(keys::ENCRYPTED_CREDENTIALS).unwrap().unwrap())
            .structured();
        assert_eq!(local_copy, Some(merged));
    }

    #[tokio::test]
    async fn get_ignores_sentinels_wrong_keys_and_offline_backup() {
        let (store, local, backup) = store();
        local.set(keys::SIG_DIGEST, AUTH).unwrap();
        local.set(keys::ENCRYPTED_CREDENTIALS, "undefined").unwrap();
        let foreign = CredentialCodec::new(&"33".repeat(32))
            .unwrap()
            .encrypt(&bundle(&[record(GOV_ID_ISSUER, None, "0x01")]))
            .unwrap();
        backup.put_credentials(AUTH, &foreign);
        assert_eq!(store.get(KEY_GEN, AUTH).await.unwrap(), None);

        seed_local(&local, &bundle(&[record(GOV_ID_ISSUER, None, "0x01")]));
        backup.set_offline(true);
        let merged = store.get(KEY_GEN, AUTH).await.unwrap().unwrap();
        assert!(merged.contains_key(GOV_ID_ISSUER));
    }

    #[tokio::test]
    async fn non_whitelisted_records_never_reach_storage() {
        let (store, local, backup) = store();
        let stranger = "0x0000000000000000000000000000000000000000000000000000000000000099";
        let err = store
            .set(&bundle(&[record(stranger, None, "0x01")]), KEY_GEN, AUTH, Some(&kolp()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(ValidationError::IssuerNotWhitelisted(_))));
        assert!(local.is_empty());
        assert_eq!(backup.credentials(AUTH), None);
    }

    #[tokio::test]
    async fn missing_digest_is_rejected_before_side_effects() {
        let (store, local, _) = store();
        let creds = bundle(&[record(GOV_ID_ISSUER, None, "0x01")]);
        assert!(matches!(
            store.set(&creds, "", AUTH, None).await,
            Err(StoreError::Validation(ValidationError::MissingDigest(_)))
        ));
        assert!(store.get(KEY_GEN, "").await.is_err());
        assert!(local.is_empty());
    }

    #[tokio::test]
    async fn remote_failure_keeps_local_write() {
        let (store, local, backup) = store();
        backup.set_offline(true);
        let creds = bundle(&[record(GOV_ID_ISSUER, None, "0x01")]);
        assert!(!store.set(&creds, KEY_GEN, AUTH, Some(&kolp())).await.unwrap());
        assert!(local.get(keys::ENCRYPTED_CREDENTIALS).unwrap().is_some());
        assert_eq!(store.latest_kolp_proof().unwrap(), Some(kolp()));
    }

    #[tokio::test]
    async fn without_any_proof_only_local_is_written() {
        let (store, local, backup) = store();
        let creds = bundle(&[record(GOV_ID_ISSUER, None, "0x01")]);
        assert!(!store.set(&creds, KEY_GEN, AUTH, None).await.unwrap());
        assert!(local.get(keys::ENCRYPTED_CREDENTIALS).unwrap().is_some());
        assert_eq!(backup.credentials(AUTH), None);
    }

    #[tokio::test]
    async fn missing_proof_is_generated_once_and_cached() {
        let prover = Arc::new(CountingProver {
            calls: AtomicUsize::new(0),
        });
        let (store, local, backup) = store();
        let store = store.with_prover(prover.clone());
        let record = attach_new_secret(&record(GOV_ID_ISSUER, None, "0x01"), "0x42").unwrap();
        let creds = bundle(&[record]);

        local.set(keys::LATEST_KOLP_PROOF, "null").unwrap();
        assert!(store.set(&creds, KEY_GEN, AUTH, None).await.unwrap());
        assert!(store.set(&creds, KEY_GEN, AUTH, None).await.unwrap());
        assert_eq!(prover.calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(backup.received_proofs()[0].proof_type, ProofKind::Kolp);
    }

    #[tokio::test]
    async fn set_local_never_touches_backup() {
        let (store, local, backup) = store();
        let creds = bundle(&[record(GOV_ID_ISSUER, None, "0x01")]);
        store.set_local(&creds, KEY_GEN, AUTH).unwrap();
        assert_eq!(local.get(keys::SIG_DIGEST).unwrap().as_deref(), Some(AUTH));
        assert_eq!(backup.credentials(AUTH), None);
        assert_eq!(store.get(KEY_GEN, AUTH).await.unwrap(), Some(creds));
    }

    #[test]
    fn unparsable_cached_proof_reads_as_absent() {
        let (store, local, _) = store();
        local.set(keys::LATEST_KOLP_PROOF, "{not json").unwrap();
        assert_eq!(store.latest_kolp_proof().unwrap(), None);
    }
}
