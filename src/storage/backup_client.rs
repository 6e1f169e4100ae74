// src/storage/backup_client.rs
//! Remote backup of encrypted credentials and proof metadata.
//!
//! The backup server only ever sees ciphertext. Reads are keyed by the auth
//! signature digest; credential writes must carry a KOLP proof, which is how
//! the server authenticates a writer without learning their secret.
//!
//! # Endpoints
//! - `GET  /credentials?sigDigest=X` → `{ encryptedCredentialsAES } | { error }`
//! - `POST /credentials { sigDigest, proof, encryptedCredentialsAES }`
//! - `GET  /proof-metadata?sigDigest=X` → `{ encryptedProofMetadataAES } | { error }`
//! - `POST /proof-metadata { sigDigest, encryptedProofMetadataAES }`

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::models::proof::ProofArtifact;
use crate::utils::http::{execute, read_json};

/// Remote store for encrypted blobs.
#[async_trait]
pub trait BackupServer: Send + Sync {
    /// Encrypted credential bundle stored under `sig_digest`, if any.
    async fn fetch_credentials(&self, sig_digest: &str) -> Result<Option<String>, TransportError>;

    async fn store_credentials(
        &self,
        sig_digest: &str,
        proof: Option<&ProofArtifact>,
        encrypted_credentials: &str,
    ) -> Result<(), TransportError>;

    /// Encrypted proof-metadata array stored under `sig_digest`, if any.
    async fn fetch_proof_metadata(&self, sig_digest: &str) -> Result<Option<String>, TransportError>;

    async fn store_proof_metadata(&self, sig_digest: &str, encrypted_metadata: &str) -> Result<(), TransportError>;
}

#[derive(Deserialize)]
struct CredentialsBody {
    #[serde(rename = "encryptedCredentialsAES", default)]
    encrypted_credentials: Option<String>,
}

#[derive(Deserialize)]
struct ProofMetadataBody {
    #[serde(rename = "encryptedProofMetadataAES", default)]
    encrypted_metadata: Option<String>,
}

#[derive(Serialize)]
struct CredentialsUpload<'a> {
    #[serde(rename = "sigDigest")]
    sig_digest: &'a str,
    proof: Option<&'a ProofArtifact>,
    #[serde(rename = "encryptedCredentialsAES")]
    encrypted_credentials: &'a str,
}

#[derive(Serialize)]
struct ProofMetadataUpload<'a> {
    #[serde(rename = "sigDigest")]
    sig_digest: &'a str,
    #[serde(rename = "encryptedProofMetadataAES")]
    encrypted_metadata: &'a str,
}

/// HTTP client for the id-server backup endpoints.
#[derive(Clone)]
pub struct BackupClient {
    client: reqwest::Client,
    base_url: String,
}

impl BackupClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl BackupServer for BackupClient {
    async fn fetch_credentials(&self, sig_digest: &str) -> Result<Option<String>, TransportError> {
        let url = self.url("/credentials");
        let request = self.client.get(&url).query(&[("sigDigest", sig_digest)]);
        let body: CredentialsBody = read_json(execute(request, &url).await?, &url).await?;
        if body.encrypted_credentials.is_some() {
            info!("Retrieved creds from remote backup");
        }
        Ok(body.encrypted_credentials)
    }

    async fn store_credentials(
        &self,
        sig_digest: &str,
        proof: Option<&ProofArtifact>,
        encrypted_credentials: &str,
    ) -> Result<(), TransportError> {
        let url = self.url("/credentials");
        let upload = CredentialsUpload {
            sig_digest,
            proof,
            encrypted_credentials,
        };
        execute(self.client.post(&url).json(&upload), &url).await?;
        info!("Sent encrypted creds to remote backup");
        Ok(())
    }

    async fn fetch_proof_metadata(&self, sig_digest: &str) -> Result<Option<String>, TransportError> {
        let url = self.url("/proof-metadata");
        let request = self.client.get(&url).query(&[("sigDigest", sig_digest)]);
        let body: ProofMetadataBody = read_json(execute(request, &url).await?, &url).await?;
        Ok(body.encrypted_metadata)
    }

    async fn store_proof_metadata(&self, sig_digest: &str, encrypted_metadata: &str) -> Result<(), TransportError> {
        let url = self.url("/proof-metadata");
        let upload = ProofMetadataUpload {
            sig_digest,
            encrypted_metadata,
        };
        execute(self.client.post(&url).json(&upload), &url).await?;
        Ok(())
    }
}

/// In-memory [`BackupServer`].
///
/// Like the real server, credential writes without a KOLP proof are refused.
/// `set_offline(true)` makes every call fail with a connection-style error.
#[derive(Debug, Default)]
pub struct MemoryBackup {
    credentials: Mutex<HashMap<String, String>>,
    proof_metadata: Mutex<HashMap<String, String>>,
    received_proofs: Mutex<Vec<ProofArtifact>>,
    offline: AtomicBool,
}

impl MemoryBackup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Stored credential ciphertext for `sig_digest`.
    pub fn credentials(&self, sig_digest: &str) -> Option<String> {
        self.credentials.lock().ok()?.get(sig_digest).cloned()
    }

    pub fn put_credentials(&self, sig_digest: &str, encrypted_credentials: &str) {
        if let Ok(mut credentials) = self.credentials.lock() {
            credentials.insert(sig_digest.to_string(), encrypted_credentials.to_string());
        }
    }

    pub fn proof_metadata(&self, sig_digest: &str) -> Option<String> {
        self.proof_metadata.lock().ok()?.get(sig_digest).cloned()
    }

    /// Proofs that accompanied accepted credential writes, oldest first.
    pub fn received_proofs(&self) -> Vec<ProofArtifact> {
        self.received_proofs.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn check_online(&self, path: &str) -> Result<(), TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::new(path, None, "connection refused"));
        }
        Ok(())
    }

    fn poisoned(path: &str) -> TransportError {
        TransportError::new(path, Some(500), "backup state lock poisoned")
    }
}

#[async_trait]
impl BackupServer for MemoryBackup {
    async fn fetch_credentials(&self, sig_digest: &str) -> Result<Option<String>, TransportError> {
        self.check_online("/credentials")?;
        Ok(self.credentials(sig_digest))
    }

    async fn store_credentials(
        &self,
        sig_digest: &str,
        proof: Option<&ProofArtifact>,
        encrypted_credentials: &str,
    ) -> Result<(), TransportError> {
        self.check_online("/credentials")?;
        let proof = proof.ok_or_else(|| TransportError::new("/credentials", Some(400), "Missing proof"))?;
        self.received_proofs
            .lock()
            .map_err(|_| Self::poisoned("/credentials"))?
            .push(proof.clone());
        self.put_credentials(sig_digest, encrypted_credentials);
        Ok(())
    }

    async fn fetch_proof_metadata(&self, sig_digest: &str) -> Result<Option<String>, TransportError> {
        self.check_online("/proof-metadata")?;
        Ok(self.proof_metadata(sig_digest))
    }

    async fn store_proof_metadata(&self, sig_digest: &str, encrypted_metadata: &str) -> Result<(), TransportError> {
        self.check_online("/proof-metadata")?;
        self.proof_metadata
            .lock()
            .map_err(|_| Self::poisoned("/proof-metadata"))?
            .insert(sig_digest.to_string(), encrypted_metadata.to_string());
        Ok(())
    }
}
