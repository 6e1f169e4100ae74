// src/services/issuance.rs
//! Issuance of a freshly retrieved credential.
//!
//! The flow has two halves:
//! - [`IssuanceCoordinator`] is a pure state machine. It consumes
//!   [`IssuanceEvent`]s and answers with the [`Effect`]s to perform, so every
//!   guard is testable without I/O.
//! - [`IssuanceDriver`] performs those effects (storage, proofs, relayer,
//!   backup) and feeds their outcomes back as events until the flow is done,
//!   denied, or stalled with nothing in flight.
//!
//! Sequence: `idle → addingLeaf → generatingKOLPProof → backingUpCreds → done`.
//! Overwriting an existing record from the same issuer first passes through
//! the confirmation sub-flow `init → confirmationRequired → confirmed | denied`.

use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::error::{IssuanceError, TransportError};
use crate::models::credential::{record_for, CredentialRecord, IssuerWhitelist, SortedCredentials};
use crate::models::proof::{ProofArtifact, ProofKind};
use crate::services::proof_pipeline::{ProofPipeline, ProofRequest};
use crate::services::relayer::{submit_with_callbacks, AddLeafRequest, CredsToStore, Relayer};
use crate::storage::credential_store::CredentialStore;
use crate::storage::kv::{self, keys, KeyValueStore};
use crate::storage::proof_metadata::ProofMetadataStore;
use crate::wallet::codec::CredentialCodec;
use crate::wallet::key_management::SignatureDigests;
use crate::wallet::secrets::SessionSecrets;
use crate::zkp::leaf::attach_new_secret;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IssuanceState {
    Idle,
    AddingLeaf,
    #[serde(rename = "generatingKOLPProof")]
    GeneratingKolpProof,
    BackingUpCreds,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConfirmationStatus {
    Init,
    ConfirmationRequired,
    Confirmed,
    Denied,
}

/// Inputs to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum IssuanceEvent {
    /// The user's stored bundle and the new record (with its new secret).
    /// May arrive more than once.
    CredentialsLoaded {
        stored: Option<SortedCredentials>,
        incoming: CredentialRecord,
    },
    ConfirmOverwrite,
    DenyOverwrite,
    LeafProofReady(ProofArtifact),
    LeafAccepted,
    LeafRejected(TransportError),
    KolpReady(ProofArtifact),
    ProofFailed { kind: ProofKind, message: String },
    /// The backup attempt ended. Success is signalled either way; plaintext
    /// caches are only purged when `success` is true.
    BackupFinished { success: bool },
}

/// Work the coordinator asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Show the record that would be overwritten and wait for the user
    AwaitConfirmation { existing: CredentialRecord },
    /// Write the merged bundle to the local store only
    PersistLocal(SortedCredentials),
    GenerateLeafProof(CredentialRecord),
    SubmitLeaf { record: CredentialRecord, proof: ProofArtifact },
    GenerateKolp(CredentialRecord),
    BackUp { kolp: ProofArtifact },
    /// Remove local plaintext copies of retrieved credentials
    PurgePlaintext,
    /// Run the caller's completion callback
    SignalSuccess,
    /// Regenerate derived proofs; the accumulator has a new leaf
    ReloadProofs,
}

/// Observable state of one flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuanceSnapshot {
    pub state: IssuanceState,
    pub confirmation: ConfirmationStatus,
    /// Stored record that confirming would overwrite
    pub creds_that_will_be_overwritten: Option<CredentialRecord>,
    pub merged: Option<SortedCredentials>,
    pub error: Option<String>,
    pub succeeded: bool,
}

fn same_record(a: &CredentialRecord, b: &CredentialRecord) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Pure issuance state machine.
pub struct IssuanceCoordinator {
    whitelist: IssuerWhitelist,
    state: IssuanceState,
    confirmation: ConfirmationStatus,
    /// One-shot guard on entering `addingLeaf`
    leaf_started: bool,
    pending: Option<(Option<SortedCredentials>, CredentialRecord)>,
    overwritten: Option<CredentialRecord>,
    merged: Option<SortedCredentials>,
    record: Option<CredentialRecord>,
    error: Option<String>,
    succeeded: bool,
}

impl IssuanceCoordinator {
    pub fn new(whitelist: IssuerWhitelist) -> Self {
        Self {
            whitelist,
            state: IssuanceState::Idle,
            confirmation: ConfirmationStatus::Init,
            leaf_started: false,
            pending: None,
            overwritten: None,
            merged: None,
            record: None,
            error: None,
            succeeded: false,
        }
    }

    pub fn state(&self) -> IssuanceState {
        self.state
    }

    pub fn confirmation(&self) -> ConfirmationStatus {
        self.confirmation
    }

    pub fn merged(&self) -> Option<&SortedCredentials> {
        self.merged.as_ref()
    }

    /// Done, or denied by the user.
    pub fn is_finished(&self) -> bool {
        self.state == IssuanceState::Done || self.confirmation == ConfirmationStatus::Denied
    }

    pub fn snapshot(&self) -> IssuanceSnapshot {
        IssuanceSnapshot {
            state: self.state,
            confirmation: self.confirmation,
            creds_that_will_be_overwritten: self.overwritten.clone(),
            merged: self.merged.clone(),
            error: self.error.clone(),
            succeeded: self.succeeded,
        }
    }

    /// Applies one event.
    ///
    /// # Errors
    /// `ValidationError::IssuerNotWhitelisted` for a record from an unknown
    /// issuer; the coordinator is left untouched.
    pub fn dispatch(&mut self, event: IssuanceEvent) -> Result<Vec<Effect>, IssuanceError> {
        if self.confirmation == ConfirmationStatus::Denied {
            debug!("Ignoring {:?}; overwrite was denied", event);
            return Ok(Vec::new());
        }
        let effects = match event {
            IssuanceEvent::CredentialsLoaded { stored, incoming } => self.on_credentials(stored, incoming)?,
            IssuanceEvent::ConfirmOverwrite => match self.pending.take() {
                Some((stored, incoming)) if self.confirmation == ConfirmationStatus::ConfirmationRequired => {
                    info!("User confirmed overwriting credentials from {}", incoming.issuer_id());
                    self.confirmation = ConfirmationStatus::Confirmed;
                    self.merge_and_start(stored, incoming)
                }
                pending => {
                    self.pending = pending;
                    Vec::new()
                }
            },
            IssuanceEvent::DenyOverwrite => {
                if self.confirmation == ConfirmationStatus::ConfirmationRequired {
                    info!("User denied overwriting credentials");
                    self.confirmation = ConfirmationStatus::Denied;
                    self.pending = None;
                }
                Vec::new()
            }
            IssuanceEvent::LeafProofReady(proof) => match self.record.clone() {
                Some(record) if self.state == IssuanceState::AddingLeaf => vec![Effect::SubmitLeaf { record, proof }],
                _ => Vec::new(),
            },
            IssuanceEvent::LeafAccepted => match self.record.clone() {
                Some(record) if self.state == IssuanceState::AddingLeaf => {
                    self.transition(IssuanceState::GeneratingKolpProof);
                    vec![Effect::GenerateKolp(record)]
                }
                _ => Vec::new(),
            },
            IssuanceEvent::LeafRejected(e) => {
                error!("An error occurred while adding leaf to Merkle tree: {}", e);
                self.error = Some(e.message);
                Vec::new()
            }
            IssuanceEvent::KolpReady(kolp) => {
                if self.state == IssuanceState::GeneratingKolpProof {
                    self.transition(IssuanceState::BackingUpCreds);
                    vec![Effect::BackUp { kolp }]
                } else {
                    Vec::new()
                }
            }
            IssuanceEvent::ProofFailed { kind, message } => {
                error!("{} proof failed during issuance: {}", kind, message);
                self.error = Some(message);
                Vec::new()
            }
            IssuanceEvent::BackupFinished { success } => {
                if self.state != IssuanceState::BackingUpCreds {
                    return Ok(Vec::new());
                }
                self.transition(IssuanceState::Done);
                if success {
                    self.succeeded = true;
                    vec![Effect::PurgePlaintext, Effect::SignalSuccess, Effect::ReloadProofs]
                } else {
                    self.error = Some(IssuanceError::BackupFailed.to_string());
                    vec![Effect::SignalSuccess, Effect::ReloadProofs]
                }
            }
        };
        Ok(effects)
    }

    fn on_credentials(
        &mut self,
        stored: Option<SortedCredentials>,
        incoming: CredentialRecord,
    ) -> Result<Vec<Effect>, IssuanceError> {
        self.whitelist.check(&incoming)?;

        match self.confirmation {
            ConfirmationStatus::Init => {
                let existing = stored.as_ref().and_then(|s| record_for(s, incoming.issuer_id()));
                match existing {
                    Some(existing) if !same_record(existing, &incoming) => {
                        info!("Credentials from {} already stored; asking before overwriting", incoming.issuer_id());
                        let existing = existing.clone();
                        self.confirmation = ConfirmationStatus::ConfirmationRequired;
                        self.overwritten = Some(existing.clone());
                        self.pending = Some((stored, incoming));
                        Ok(vec![Effect::AwaitConfirmation { existing }])
                    }
                    _ => {
                        self.confirmation = ConfirmationStatus::Confirmed;
                        Ok(self.merge_and_start(stored, incoming))
                    }
                }
            }
            ConfirmationStatus::ConfirmationRequired => {
                self.pending = Some((stored, incoming));
                Ok(Vec::new())
            }
            ConfirmationStatus::Confirmed => Ok(self.merge_and_start(stored, incoming)),
            ConfirmationStatus::Denied => Ok(Vec::new()),
        }
    }

    fn merge_and_start(&mut self, stored: Option<SortedCredentials>, incoming: CredentialRecord) -> Vec<Effect> {
        let mut merged = stored.unwrap_or_default();
        let stale_key = merged
            .keys()
            .find(|key| key.eq_ignore_ascii_case(incoming.issuer_id()))
            .cloned();
        if let Some(key) = stale_key {
            merged.remove(&key);
        }
        merged.insert(incoming.issuer_id().to_string(), incoming.clone());

        let mut effects = Vec::new();
        if self.merged.as_ref() != Some(&merged) {
            self.merged = Some(merged.clone());
            effects.push(Effect::PersistLocal(merged));
        }
        if self.state == IssuanceState::Idle && !self.leaf_started {
            self.leaf_started = true;
            self.record = Some(incoming.clone());
            self.transition(IssuanceState::AddingLeaf);
            effects.push(Effect::GenerateLeafProof(incoming));
        } else {
            debug!("Leaf insertion already started; ignoring repeated trigger");
        }
        effects
    }

    fn transition(&mut self, next: IssuanceState) {
        info!("Issuance {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// Attaches the session's secret for `retrieval_endpoint` to a vendor record.
///
/// Calling this again in the same session yields the same secret and leaf.
pub fn add_new_secret(
    record: &CredentialRecord,
    secrets: &SessionSecrets,
    retrieval_endpoint: &str,
) -> Result<CredentialRecord, IssuanceError> {
    let secret = secrets.secret_for(retrieval_endpoint)?;
    Ok(attach_new_secret(record, &secret)?)
}

/// Caller-side control over a running flow.
#[derive(Clone)]
pub struct IssuanceHandle {
    events: mpsc::UnboundedSender<IssuanceEvent>,
    snapshot: watch::Receiver<IssuanceSnapshot>,
}

impl IssuanceHandle {
    pub fn confirm_overwrite(&self) -> bool {
        self.events.send(IssuanceEvent::ConfirmOverwrite).is_ok()
    }

    pub fn deny_overwrite(&self) -> bool {
        self.events.send(IssuanceEvent::DenyOverwrite).is_ok()
    }

    pub fn snapshot(&self) -> IssuanceSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Waits until the snapshot changes; `false` once the flow has ended.
    pub async fn changed(&mut self) -> bool {
        self.snapshot.changed().await.is_ok()
    }
}

type SuccessCallback = Box<dyn FnOnce() + Send>;

/// Runs one issuance flow against real (or fake) services.
pub struct IssuanceDriver {
    coordinator: IssuanceCoordinator,
    store: Arc<CredentialStore>,
    pipeline: Arc<ProofPipeline>,
    relayer: Arc<dyn Relayer>,
    local: Arc<dyn KeyValueStore>,
    proof_metadata: Option<Arc<ProofMetadataStore>>,
    digests: SignatureDigests,
    address: String,
    on_success: Option<SuccessCallback>,
    external: mpsc::UnboundedReceiver<IssuanceEvent>,
    snapshot: watch::Sender<IssuanceSnapshot>,
}

impl IssuanceDriver {
    pub fn new(
        store: Arc<CredentialStore>,
        pipeline: Arc<ProofPipeline>,
        relayer: Arc<dyn Relayer>,
        local: Arc<dyn KeyValueStore>,
        digests: SignatureDigests,
        address: impl Into<String>,
    ) -> (Self, IssuanceHandle) {
        let coordinator = IssuanceCoordinator::new(store.whitelist().clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(coordinator.snapshot());
        let driver = Self {
            coordinator,
            store,
            pipeline,
            relayer,
            local,
            proof_metadata: None,
            digests,
            address: address.into(),
            on_success: None,
            external: events_rx,
            snapshot: snapshot_tx,
        };
        let handle = IssuanceHandle {
            events: events_tx,
            snapshot: snapshot_rx,
        };
        (driver, handle)
    }

    /// Lets the final proof reload skip soul-bound proofs already on chain.
    pub fn with_proof_metadata(mut self, proof_metadata: Arc<ProofMetadataStore>) -> Self {
        self.proof_metadata = Some(proof_metadata);
        self
    }

    pub fn on_success(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    /// Drives the flow for `incoming` (already carrying its new secret).
    ///
    /// Returns the final snapshot once the flow is done or denied, or when
    /// it stalls: a rejected leaf or a failed proof leaves nothing in flight,
    /// and the snapshot then holds the error.
    pub async fn run(mut self, incoming: CredentialRecord) -> Result<IssuanceSnapshot, IssuanceError> {
        // Reading the store rewrites both copies, so reject strangers first.
        self.store.whitelist().check(&incoming)?;
        let stored = self.store.get(&self.digests.key_gen, &self.digests.auth).await?;
        let (completions_tx, mut completions_rx) = mpsc::unbounded_channel();
        let mut in_flight = 0usize;
        let mut next = Some(IssuanceEvent::CredentialsLoaded { stored, incoming });

        loop {
            if let Some(event) = next.take() {
                let effects = self.coordinator.dispatch(event)?;
                self.publish();
                for effect in effects {
                    if self.apply(effect, &completions_tx).await? {
                        in_flight += 1;
                    }
                }
            }

            if self.coordinator.is_finished() {
                break;
            }
            let awaiting_user = self.coordinator.confirmation() == ConfirmationStatus::ConfirmationRequired;
            if in_flight == 0 && !awaiting_user {
                warn!("Issuance stalled in {:?}", self.coordinator.state());
                break;
            }

            next = tokio::select! {
                Some(event) = completions_rx.recv(), if in_flight > 0 => {
                    in_flight -= 1;
                    Some(event)
                }
                Some(event) = self.external.recv() => Some(event),
                else => break,
            };
        }
        Ok(self.coordinator.snapshot())
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.coordinator.snapshot());
    }

    /// Performs one effect; `true` if it spawned work that will report back.
    async fn apply(
        &mut self,
        effect: Effect,
        completions: &mpsc::UnboundedSender<IssuanceEvent>,
    ) -> Result<bool, IssuanceError> {
        let SignatureDigests { key_gen, auth } = self.digests.clone();
        match effect {
            Effect::AwaitConfirmation { existing } => {
                info!("Awaiting confirmation to overwrite credentials from {}", existing.issuer_id());
                Ok(false)
            }
            Effect::PersistLocal(merged) => {
                self.store.set_local(&merged, &key_gen, &auth)?;
                Ok(false)
            }
            Effect::GenerateLeafProof(record) => {
                self.spawn_proof(ProofRequest::leaf_insertion(&record)?, completions, IssuanceEvent::LeafProofReady);
                Ok(true)
            }
            Effect::SubmitLeaf { record, proof } => {
                let merged = self.coordinator.merged().cloned().unwrap_or_default();
                let creds_to_store = CredsToStore {
                    sig_digest: auth,
                    encrypted_credentials: CredentialCodec::new(&key_gen)?.encrypt(&merged)?,
                    encrypted_symmetric_key: None,
                };
                let request = AddLeafRequest::new(record.issuer_id(), &record.signature, &proof, creds_to_store)?;
                let relayer = self.relayer.clone();
                let accepted = completions.clone();
                let rejected = completions.clone();
                tokio::spawn(async move {
                    submit_with_callbacks(
                        relayer.as_ref(),
                        &request,
                        move || report(&accepted, IssuanceEvent::LeafAccepted),
                        move |e| report(&rejected, IssuanceEvent::LeafRejected(e)),
                    )
                    .await;
                });
                Ok(true)
            }
            Effect::GenerateKolp(record) => {
                self.spawn_proof(ProofRequest::kolp(&record)?, completions, IssuanceEvent::KolpReady);
                Ok(true)
            }
            Effect::BackUp { kolp } => {
                let store = self.store.clone();
                let completions = completions.clone();
                tokio::spawn(async move {
                    let success = match back_up(&store, &key_gen, &auth, &kolp).await {
                        Ok(success) => success,
                        Err(e) => {
                            error!("Could not back up credentials: {}", e);
                            false
                        }
                    };
                    report(&completions, IssuanceEvent::BackupFinished { success });
                });
                Ok(true)
            }
            Effect::PurgePlaintext => {
                let removed = kv::remove_prefixed(self.local.as_ref(), keys::PLAINTEXT_CREDS_PREFIX)?;
                debug!("Removed {} plaintext credential cache(s)", removed);
                Ok(false)
            }
            Effect::SignalSuccess => {
                info!("Issuance finished (backed up: {})", self.coordinator.snapshot().succeeded);
                if let Some(callback) = self.on_success.take() {
                    callback();
                }
                Ok(false)
            }
            Effect::ReloadProofs => {
                self.reload_proofs(&key_gen, &auth).await;
                Ok(false)
            }
        }
    }

    fn spawn_proof(
        &self,
        request: ProofRequest,
        completions: &mpsc::UnboundedSender<IssuanceEvent>,
        on_ready: fn(ProofArtifact) -> IssuanceEvent,
    ) {
        let pipeline = self.pipeline.clone();
        let completions = completions.clone();
        let kind = request.kind();
        tokio::spawn(async move {
            let event = match pipeline.generate(request).await {
                Ok(proof) => on_ready(proof),
                Err(e) => IssuanceEvent::ProofFailed {
                    kind,
                    message: e.to_string(),
                },
            };
            report(&completions, event);
        });
    }

    async fn reload_proofs(&self, key_gen: &str, auth: &str) {
        let Some(creds) = self.coordinator.merged() else {
            return;
        };
        let metadata = match &self.proof_metadata {
            Some(store) => store.get(key_gen, auth, false).await.unwrap_or_else(|e| {
                warn!("Reloading proofs without proof metadata: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };
        let results = self.pipeline.load_missing(creds, &metadata, &self.address, true).await;
        let failed = results.iter().filter(|(_, result)| result.is_err()).count();
        info!("Reloaded {} proof(s), {} failed", results.len() - failed, failed);
    }
}

fn report(completions: &mpsc::UnboundedSender<IssuanceEvent>, event: IssuanceEvent) {
    if completions.send(event).is_err() {
        debug!("Issuance driver gone; dropping completion");
    }
}

/// Re-reads the authoritative bundle and stores it with the new KOLP proof.
async fn back_up(store: &CredentialStore, key_gen: &str, auth: &str, kolp: &ProofArtifact) -> Result<bool, IssuanceError> {
    store.set_latest_kolp_proof(kolp)?;
    let Some(creds) = store.get(key_gen, auth).await? else {
        warn!("No credentials to back up");
        return Ok(false);
    };
    Ok(store.set(&creds, key_gen, auth, Some(kolp)).await?)
}
