// src/services/proof_pipeline.rs
//! Off-thread proof generation.
//!
//! Every proof request goes through one [`ProofPipeline`], which runs the
//! blocking prover on tokio's blocking pool behind a semaphore sized by
//! `proof_workers`. A proof kind can only have one request in flight; a second
//! request for the same kind fails with [`ProofError::AlreadyLoading`] instead
//! of queueing. Failures are logged and returned, never retried.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::Semaphore;

use crate::config::IssuerRoles;
use crate::error::{ProofError, ValidationError};
use crate::models::credential::{record_for, CredentialRecord, SortedCredentials};
use crate::models::proof::{ProofArtifact, ProofKind, ProofMetadataItem};
use crate::zkp::circuits::{NameWitness, ProofCircuit};
use crate::zkp::proof_generation::Prover;

/// Witness data for one proof, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ProofRequest {
    LeafInsertion { old_preimage: Vec<String>, new_secret: String },
    Kolp { preimage: Vec<String> },
    Uniqueness { preimage: Vec<String>, address: String, action_id: String },
    UsResidency { preimage: Vec<String>, address: String },
    MedicalSpecialty { preimage: Vec<String>, address: String },
    GovIdName { preimage: Vec<String>, name: NameWitness },
}

impl ProofRequest {
    /// Leaf insertion for a record that already carries its new secret.
    pub fn leaf_insertion(record: &CredentialRecord) -> Result<Self, ValidationError> {
        let (new_secret, _) = record.new_witness()?;
        Ok(ProofRequest::LeafInsertion {
            old_preimage: record.creds.serialized_as_preimage.clone(),
            new_secret: new_secret.to_string(),
        })
    }

    /// KOLP over the record's new (inserted) leaf.
    pub fn kolp(record: &CredentialRecord) -> Result<Self, ValidationError> {
        let (_, preimage) = record.new_witness()?;
        Ok(ProofRequest::Kolp {
            preimage: preimage.to_vec(),
        })
    }

    pub fn kind(&self) -> ProofKind {
        match self {
            ProofRequest::LeafInsertion { .. } => ProofKind::LeafInsertion,
            ProofRequest::Kolp { .. } => ProofKind::Kolp,
            ProofRequest::Uniqueness { .. } => ProofKind::Uniqueness,
            ProofRequest::UsResidency { .. } => ProofKind::UsResidency,
            ProofRequest::MedicalSpecialty { .. } => ProofKind::MedicalSpecialty,
            ProofRequest::GovIdName { .. } => ProofKind::GovIdFirstNameLastName,
        }
    }

    fn into_circuit(self) -> Result<ProofCircuit, ValidationError> {
        match self {
            ProofRequest::LeafInsertion {
                old_preimage,
                new_secret,
            } => ProofCircuit::leaf_insertion(&old_preimage, &new_secret),
            ProofRequest::Kolp { preimage } => ProofCircuit::kolp(&preimage),
            ProofRequest::Uniqueness {
                preimage,
                address,
                action_id,
            } => ProofCircuit::uniqueness(&preimage, &address, &action_id),
            ProofRequest::UsResidency { preimage, address } => ProofCircuit::us_residency(&preimage, &address),
            ProofRequest::MedicalSpecialty { preimage, address } => {
                ProofCircuit::medical_specialty(&preimage, &address)
            }
            ProofRequest::GovIdName { preimage, name } => ProofCircuit::gov_id_name(&preimage, name),
        }
    }
}

/// Clears a kind's loading flag however generation ends.
struct LoadingFlag<'a> {
    loading: &'a Mutex<HashSet<ProofKind>>,
    kind: ProofKind,
}

impl Drop for LoadingFlag<'_> {
    fn drop(&mut self) {
        if let Ok(mut loading) = self.loading.lock() {
            loading.remove(&self.kind);
        }
    }
}

fn poisoned() -> ProofError {
    ProofError::Worker("proof pipeline state lock poisoned".into())
}

/// Session-scoped proof generator and cache.
pub struct ProofPipeline {
    prover: Arc<dyn Prover>,
    workers: Semaphore,
    loading: Mutex<HashSet<ProofKind>>,
    cache: Mutex<HashMap<ProofKind, ProofArtifact>>,
    roles: IssuerRoles,
}

impl ProofPipeline {
    pub fn new(prover: Arc<dyn Prover>, workers: usize, roles: IssuerRoles) -> Self {
        Self {
            prover,
            workers: Semaphore::new(workers.max(1)),
            loading: Mutex::new(HashSet::new()),
            cache: Mutex::new(HashMap::new()),
            roles,
        }
    }

    /// Generates one proof and caches it for the session.
    ///
    /// # Errors
    /// - `ProofError::AlreadyLoading` if a proof of the same kind is in flight
    /// - witness validation or prover failures, already logged
    pub async fn generate(&self, request: ProofRequest) -> Result<ProofArtifact, ProofError> {
        let kind = request.kind();
        let _flag = {
            let mut loading = self.loading.lock().map_err(|_| poisoned())?;
            if !loading.insert(kind) {
                debug!("Skipping {} request; one is already loading", kind);
                return Err(ProofError::AlreadyLoading(kind));
            }
            LoadingFlag {
                loading: &self.loading,
                kind,
            }
        };

        let outcome = self.run(request).await;
        match &outcome {
            Ok(artifact) => {
                info!("Generated {} proof", kind);
                self.cache.lock().map_err(|_| poisoned())?.insert(kind, artifact.clone());
            }
            Err(e) => error!("Error generating {} proof: {}", kind, e),
        }
        outcome
    }

    async fn run(&self, request: ProofRequest) -> Result<ProofArtifact, ProofError> {
        let circuit = request.into_circuit()?;
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|e| ProofError::Worker(e.to_string()))?;
        let prover = self.prover.clone();
        tokio::task::spawn_blocking(move || prover.prove(circuit))
            .await
            .map_err(|e| ProofError::Worker(e.to_string()))?
    }

    pub fn cached(&self, kind: ProofKind) -> Option<ProofArtifact> {
        self.cache.lock().ok()?.get(&kind).cloned()
    }

    pub fn is_loading(&self, kind: ProofKind) -> bool {
        self.loading.lock().map(|l| l.contains(&kind)).unwrap_or(false)
    }

    pub fn clear(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    /// Requests every derived proof the session does not have yet.
    ///
    /// Uniqueness, residency, KOLP and name proofs come from the gov-ID
    /// issuer's record, the medical-specialty proof from the medical issuer's.
    /// Soul-bound kinds already recorded in `metadata` are skipped. With
    /// `force` the cache is cleared first, which is what a new leaf calls for.
    pub async fn load_missing(
        &self,
        creds: &SortedCredentials,
        metadata: &[ProofMetadataItem],
        address: &str,
        force: bool,
    ) -> Vec<(ProofKind, Result<ProofArtifact, ProofError>)> {
        if force {
            self.clear();
        }
        let requests: Vec<ProofRequest> = self
            .missing_requests(creds, address)
            .into_iter()
            .filter(|request| {
                let kind = request.kind();
                let on_chain = kind.is_soul_bound() && metadata.iter().any(|item| item.proof_type == kind.as_str());
                !on_chain && self.cached(kind).is_none() && !self.is_loading(kind)
            })
            .collect();
        if requests.is_empty() {
            debug!("No missing proofs to load");
            return Vec::new();
        }

        info!("Loading {} missing proof(s)", requests.len());
        join_all(requests.into_iter().map(|request| async move {
            let kind = request.kind();
            (kind, self.generate(request).await)
        }))
        .await
    }

    fn missing_requests(&self, creds: &SortedCredentials, address: &str) -> Vec<ProofRequest> {
        let mut requests = Vec::new();
        let address = address.to_string();

        if let Some(record) = self.role_record(creds, self.roles.gov_id.as_deref()) {
            match record.new_witness() {
                Ok((_, preimage)) => {
                    let preimage = preimage.to_vec();
                    requests.push(ProofRequest::Uniqueness {
                        preimage: preimage.clone(),
                        address: address.clone(),
                        action_id: self.roles.default_action_id.clone(),
                    });
                    requests.push(ProofRequest::UsResidency {
                        preimage: preimage.clone(),
                        address: address.clone(),
                    });
                    requests.push(ProofRequest::Kolp {
                        preimage: preimage.clone(),
                    });
                    match NameWitness::from_metadata(&record.metadata) {
                        Ok(name) => requests.push(ProofRequest::GovIdName { preimage, name }),
                        Err(e) => debug!("No name proof for gov-ID record: {}", e),
                    }
                }
                Err(e) => warn!("Gov-ID record cannot back proofs yet: {}", e),
            }
        }

        if let Some(record) = self.role_record(creds, self.roles.medical.as_deref()) {
            match record.new_witness() {
                Ok((_, preimage)) => requests.push(ProofRequest::MedicalSpecialty {
                    preimage: preimage.to_vec(),
                    address,
                }),
                Err(e) => warn!("Medical record cannot back proofs yet: {}", e),
            }
        }
        requests
    }

    fn role_record<'a>(&self, creds: &'a SortedCredentials, issuer: Option<&str>) -> Option<&'a CredentialRecord> {
        issuer.and_then(|issuer| record_for(creds, issuer))
    }
}
