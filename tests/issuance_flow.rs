// tests/issuance_flow.rs
//! End-to-end issuance against in-memory storage, backup, prover and relayer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use holo_vault::config::IssuerRoles;
use holo_vault::error::{IssuanceError, ProofError, StoreError, TransportError, ValidationError};
use holo_vault::models::credential::{CredentialRecord, IssuerWhitelist, SortedCredentials};
use holo_vault::models::proof::{ProofArtifact, ProofKind};
use holo_vault::services::issuance::{
    add_new_secret, ConfirmationStatus, IssuanceCoordinator, IssuanceDriver, IssuanceEvent, IssuanceHandle,
    IssuanceState,
};
use holo_vault::services::proof_pipeline::ProofPipeline;
use holo_vault::services::relayer::{AddLeafRequest, Relayer};
use holo_vault::storage::backup_client::MemoryBackup;
use holo_vault::storage::credential_store::CredentialStore;
use holo_vault::storage::kv::{keys, KeyValueStore, MemoryStore};
use holo_vault::wallet::codec::CredentialCodec;
use holo_vault::wallet::key_management::SignatureDigests;
use holo_vault::wallet::secrets::SessionSecrets;
use holo_vault::zkp::circuits::ProofCircuit;
use holo_vault::zkp::proof_generation::Prover;

const ISSUER: &str = "0x2a4879fe71757462a1a7e103646bbc3349a15bd52b115153791da39b5e376bb0";
const OTHER_ISSUER: &str = "0x0000000000000000000000000000000000000000000000000000000000000077";
const KEY_GEN: &str = "5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a";
const AUTH: &str = "auth-digest";
const ADDRESS: &str = "0x00000000000000000000000000000000000000aa";
const ENDPOINT: &str = "https://id-server.holonym.io/veriff/credentials?sessionId=s1";

#[derive(Default)]
struct FakeProver {
    proved: Mutex<Vec<ProofKind>>,
}

impl FakeProver {
    fn proved(&self) -> Vec<ProofKind> {
        self.proved.lock().unwrap().clone()
    }
}

impl Prover for FakeProver {
    fn prove(&self, circuit: ProofCircuit) -> Result<ProofArtifact, ProofError> {
        self.proved.lock().unwrap().push(circuit.kind());
        Ok(ProofArtifact {
            proof_type: circuit.kind(),
            proof: "ZmFrZQ==".to_string(),
            public_signals: circuit.public_inputs().iter().map(|(_, v)| v.to_string()).collect(),
            inputs: BTreeMap::new(),
        })
    }
}

/// Accepts every leaf, or answers every request with `reject_status`.
#[derive(Default)]
struct FakeRelayer {
    reject_status: Option<u16>,
    requests: Mutex<Vec<AddLeafRequest>>,
}

#[async_trait]
impl Relayer for FakeRelayer {
    async fn add_leaf(&self, request: &AddLeafRequest) -> Result<(), TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        match self.reject_status {
            None => Ok(()),
            Some(status) => Err(TransportError::new("/addLeaf", Some(status), "relayer unavailable")),
        }
    }
}

struct Harness {
    local: Arc<MemoryStore>,
    session: Arc<MemoryStore>,
    backup: Arc<MemoryBackup>,
    store: Arc<CredentialStore>,
    prover: Arc<FakeProver>,
    relayer: Arc<FakeRelayer>,
}

impl Harness {
    fn new(relayer: FakeRelayer) -> Self {
        let local = Arc::new(MemoryStore::new());
        let backup = Arc::new(MemoryBackup::new());
        let store = Arc::new(CredentialStore::new(local.clone(), backup.clone(), whitelist()));
        Self {
            local,
            session: Arc::new(MemoryStore::new()),
            backup,
            store,
            prover: Arc::new(FakeProver::default()),
            relayer: Arc::new(relayer),
        }
    }

    fn driver(&self) -> (IssuanceDriver, IssuanceHandle) {
        let roles = IssuerRoles {
            gov_id: Some(ISSUER.to_string()),
            medical: None,
            default_action_id: "123456789".to_string(),
        };
        let pipeline = Arc::new(ProofPipeline::new(self.prover.clone(), 1, roles));
        IssuanceDriver::new(
            self.store.clone(),
            pipeline,
            self.relayer.clone(),
            self.local.clone(),
            SignatureDigests {
                key_gen: KEY_GEN.to_string(),
                auth: AUTH.to_string(),
            },
            ADDRESS,
        )
    }

    /// The vendor record with this session's new secret attached.
    fn incoming(&self, record: &CredentialRecord) -> CredentialRecord {
        add_new_secret(record, &SessionSecrets::new(self.session.clone()), ENDPOINT).unwrap()
    }

    fn local_bundle(&self) -> Option<SortedCredentials> {
        let ciphertext = self.local.get(keys::ENCRYPTED_CREDENTIALS).unwrap()?;
        codec().decrypt::<SortedCredentials>(&ciphertext).structured()
    }

    fn remote_bundle(&self) -> Option<SortedCredentials> {
        codec().decrypt::<SortedCredentials>(&self.backup.credentials(AUTH)?).structured()
    }
}

fn whitelist() -> IssuerWhitelist {
    IssuerWhitelist::new([ISSUER, OTHER_ISSUER])
}

fn codec() -> CredentialCodec {
    CredentialCodec::new(KEY_GEN).unwrap()
}

fn vendor_record(issuer: &str, iat: &str, secret: &str) -> CredentialRecord {
    serde_json::from_value(json!({
        "creds": {
            "issuerAddress": issuer,
            "secret": secret,
            "customFields": ["0x02", "0x03"],
            "iat": iat,
            "scope": "0x00",
            "serializedAsPreimage": [issuer, secret, "0x02", "0x03", iat, "0x00"]
        },
        "leaf": "0x17",
        "metadata": { "rawCreds": { "firstName": "Satoshi", "lastName": "Nakamoto" } },
        "signature": format!("0x{}{}1b", "11".repeat(32), "22".repeat(32))
    }))
    .unwrap()
}

fn bundle(records: &[CredentialRecord]) -> SortedCredentials {
    records
        .iter()
        .map(|record| (record.issuer_id().to_string(), record.clone()))
        .collect()
}

/// Answers a confirmation prompt with `confirm` whenever one appears.
fn respond_to_prompts(mut handle: IssuanceHandle, confirm: bool) -> tokio::task::JoinHandle<usize> {
    tokio::spawn(async move {
        let mut prompts = 0;
        while handle.changed().await {
            if handle.snapshot().confirmation == ConfirmationStatus::ConfirmationRequired {
                prompts += 1;
                if confirm {
                    handle.confirm_overwrite();
                } else {
                    handle.deny_overwrite();
                }
            }
        }
        prompts
    })
}

#[test]
fn bundle_survives_encryption() {
    let creds = bundle(&[vendor_record(ISSUER, "0x10", "0x01"), vendor_record(OTHER_ISSUER, "0x11", "0x02")]);
    let ciphertext = codec().encrypt(&creds).unwrap();
    assert_eq!(codec().decrypt::<SortedCredentials>(&ciphertext).structured(), Some(creds));
}

#[test]
fn newer_record_wins_whichever_side_holds_it() {
    let harness = Harness::new(FakeRelayer::default());
    let older = vendor_record(ISSUER, "0x10", "0x01");
    let newer = vendor_record(ISSUER, "0x20", "0x02");

    harness.store.set_local(&bundle(&[newer.clone()]), KEY_GEN, AUTH).unwrap();
    harness.backup.put_credentials(AUTH, &codec().encrypt(&bundle(&[older])).unwrap());

    let merged = tokio_test::block_on(harness.store.get(KEY_GEN, AUTH)).unwrap().unwrap();
    assert_eq!(merged[ISSUER], newer);
}

#[test]
fn secret_is_stable_within_a_session() {
    let harness = Harness::new(FakeRelayer::default());
    let record = vendor_record(ISSUER, "0x10", "0x01");
    let first = harness.incoming(&record);
    let second = harness.incoming(&record);
    assert_eq!(first.creds.new_secret, second.creds.new_secret);
    assert_eq!(first.new_leaf, second.new_leaf);

    let other_session = Harness::new(FakeRelayer::default()).incoming(&record);
    assert_ne!(first.creds.new_secret, other_session.creds.new_secret);
}

#[test]
fn repeated_triggers_start_one_leaf_insertion() {
    let harness = Harness::new(FakeRelayer::default());
    let incoming = harness.incoming(&vendor_record(ISSUER, "0x10", "0x01"));
    let mut coordinator = IssuanceCoordinator::new(whitelist());

    let mut starts = 0;
    for _ in 0..3 {
        let effects = coordinator
            .dispatch(IssuanceEvent::CredentialsLoaded {
                stored: None,
                incoming: incoming.clone(),
            })
            .unwrap();
        starts += effects
            .iter()
            .filter(|e| matches!(e, holo_vault::services::issuance::Effect::GenerateLeafProof(_)))
            .count();
    }
    assert_eq!(starts, 1);
    assert_eq!(coordinator.state(), IssuanceState::AddingLeaf);
}

#[tokio::test]
async fn unknown_issuer_is_rejected_before_any_write() {
    let harness = Harness::new(FakeRelayer::default());
    let stranger = "0x0000000000000000000000000000000000000000000000000000000000000099";
    let incoming = harness.incoming(&vendor_record(stranger, "0x10", "0x01"));
    // A backed-up bundle that reading the store would copy to the device
    let remote = codec().encrypt(&bundle(&[vendor_record(ISSUER, "0x08", "0x09")])).unwrap();
    harness.backup.put_credentials(AUTH, &remote);

    let (driver, _handle) = harness.driver();
    let err = driver.run(incoming.clone()).await.unwrap_err();
    assert!(matches!(
        err,
        IssuanceError::Validation(ValidationError::IssuerNotWhitelisted(_))
    ));
    assert!(harness.local.keys().unwrap().is_empty());
    assert_eq!(harness.backup.credentials(AUTH), Some(remote));
    assert!(harness.relayer.requests.lock().unwrap().is_empty());

    let direct = harness.store.set(&bundle(&[incoming]), KEY_GEN, AUTH, None).await;
    assert!(matches!(direct, Err(StoreError::Validation(_))));
    assert!(harness.local.is_empty());
}

#[tokio::test]
async fn first_issuance_runs_to_completion() {
    let harness = Harness::new(FakeRelayer::default());
    let incoming = harness.incoming(&vendor_record(ISSUER, "0x10", "0x01"));
    harness.local.set(&keys::plaintext_creds(ENDPOINT), "{}").unwrap();
    harness.local.set(&keys::plaintext_creds("https://other"), "{}").unwrap();

    let (driver, handle) = harness.driver();
    let prompts = respond_to_prompts(handle, true);
    let snapshot = driver.run(incoming.clone()).await.unwrap();
    assert_eq!(prompts.await.unwrap(), 0);

    assert_eq!(snapshot.confirmation, ConfirmationStatus::Confirmed);
    assert_eq!(snapshot.state, IssuanceState::Done);
    assert!(snapshot.succeeded);
    assert_eq!(snapshot.error, None);

    let merged = snapshot.merged.unwrap();
    assert_eq!(merged[ISSUER], incoming);
    assert!(merged[ISSUER].creds.new_secret.is_some());
    assert!(merged[ISSUER].new_leaf.is_some());

    let proved = harness.prover.proved();
    assert_eq!(&proved[..2], &[ProofKind::LeafInsertion, ProofKind::Kolp]);
    let submitted = harness.relayer.requests.lock().unwrap().clone();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].add_leaf_args.issuer, ISSUER);
    assert_eq!(submitted[0].add_leaf_args.v, 27);

    assert_eq!(harness.remote_bundle(), Some(merged));
    assert_eq!(harness.backup.received_proofs().last().unwrap().proof_type, ProofKind::Kolp);
    assert!(!harness
        .local
        .keys()
        .unwrap()
        .iter()
        .any(|key| key.starts_with(keys::PLAINTEXT_CREDS_PREFIX)));
}

#[tokio::test]
async fn confirmed_overwrite_replaces_the_stored_record() {
    let harness = Harness::new(FakeRelayer::default());
    let existing = vendor_record(ISSUER, "0x08", "0x09");
    harness.store.set_local(&bundle(&[existing.clone()]), KEY_GEN, AUTH).unwrap();
    let incoming = harness.incoming(&vendor_record(ISSUER, "0x10", "0x01"));

    let (driver, handle) = harness.driver();
    let prompts = respond_to_prompts(handle, true);
    let snapshot = driver.run(incoming.clone()).await.unwrap();
    assert_eq!(prompts.await.unwrap(), 1);

    assert_eq!(snapshot.confirmation, ConfirmationStatus::Confirmed);
    assert_eq!(snapshot.creds_that_will_be_overwritten, Some(existing));
    assert_eq!(snapshot.state, IssuanceState::Done);
    assert_eq!(harness.local_bundle().unwrap()[ISSUER], incoming);
}

#[tokio::test]
async fn denied_overwrite_leaves_the_store_unchanged() {
    let harness = Harness::new(FakeRelayer::default());
    let existing = bundle(&[vendor_record(ISSUER, "0x08", "0x09")]);
    harness.store.set_local(&existing, KEY_GEN, AUTH).unwrap();
    let incoming = harness.incoming(&vendor_record(ISSUER, "0x10", "0x01"));

    let (driver, handle) = harness.driver();
    let prompts = respond_to_prompts(handle, false);
    let snapshot = driver.run(incoming).await.unwrap();
    assert_eq!(prompts.await.unwrap(), 1);

    assert_eq!(snapshot.confirmation, ConfirmationStatus::Denied);
    assert_eq!(snapshot.state, IssuanceState::Idle);
    assert_eq!(snapshot.merged, None);
    assert_eq!(harness.local_bundle(), Some(existing));
    assert!(harness.relayer.requests.lock().unwrap().is_empty());
    assert!(harness.prover.proved().is_empty());
}

#[tokio::test]
async fn relayer_rejection_stalls_before_kolp() {
    let harness = Harness::new(FakeRelayer {
        reject_status: Some(502),
        ..FakeRelayer::default()
    });
    let incoming = harness.incoming(&vendor_record(ISSUER, "0x10", "0x01"));
    harness.local.set(&keys::plaintext_creds(ENDPOINT), "{}").unwrap();

    let (driver, _handle) = harness.driver();
    let snapshot = driver.run(incoming.clone()).await.unwrap();

    assert_eq!(snapshot.state, IssuanceState::AddingLeaf);
    assert_eq!(snapshot.error.as_deref(), Some("relayer unavailable"));
    assert_eq!(harness.relayer.requests.lock().unwrap().len(), 1);
    assert_eq!(harness.prover.proved(), vec![ProofKind::LeafInsertion]);
    assert_eq!(harness.backup.credentials(AUTH), None);

    // The confirmed bundle is already on the device; the plaintext copy stays
    // until a backup succeeds.
    assert_eq!(harness.local_bundle().unwrap()[ISSUER], incoming);
    assert!(harness.local.get(&keys::plaintext_creds(ENDPOINT)).unwrap().is_some());
}

#[tokio::test]
async fn failed_backup_ends_without_purging() {
    let harness = Harness::new(FakeRelayer::default());
    let incoming = harness.incoming(&vendor_record(ISSUER, "0x10", "0x01"));
    harness.local.set(&keys::plaintext_creds(ENDPOINT), "{}").unwrap();
    harness.backup.set_offline(true);

    let finished = Arc::new(AtomicBool::new(false));
    let (driver, _handle) = harness.driver();
    let flag = finished.clone();
    let driver = driver.on_success(move || flag.store(true, Ordering::SeqCst));
    let snapshot = driver.run(incoming).await.unwrap();

    assert_eq!(snapshot.state, IssuanceState::Done);
    assert!(finished.load(Ordering::SeqCst));
    assert!(!snapshot.succeeded);
    assert_eq!(snapshot.error.as_deref(), Some("Could not send credentials to server."));
    assert!(harness.local.get(&keys::plaintext_creds(ENDPOINT)).unwrap().is_some());
}
