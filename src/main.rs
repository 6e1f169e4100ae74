// src/main.rs

//! # Holo Vault - Headless Issuance
//!
//! Runs one credential issuance end to end: retrieve the record from the
//! vendor, attach a new secret, insert the leaf through the relayer, and back
//! up the encrypted bundle.
//!
//! ```text
//! holo-vault <retrieval-endpoint | base64 endpoint> [--overwrite]
//! ```
//!
//! Without `--overwrite`, replacing an existing credential from the same
//! issuer is denied.
//!
//! ## Environment Variables
//! - `HOLO_PRIVATE_KEY`: wallet private key used to derive the storage digests
//! - `HOLO_ID_SERVER_URL`, `HOLO_RELAYER_URL`: service endpoints
//! - `HOLO_ISSUER_WHITELIST`: comma-separated issuer ids
//! - `HOLO_GOV_ID_ISSUER`, `HOLO_MEDICAL_ISSUER`: issuers backing derived proofs
//! - `HOLO_PROOF_WORKERS`, `HOLO_DEFAULT_ACTION_ID`
//! - `HOLO_LOCAL_STORE_PATH`: JSON file holding the device-local store
//! - `RUST_LOG`: log verbosity

use std::sync::Arc;

use anyhow::{anyhow, Context};
use dotenv::dotenv;
use log::{error, info};

use holo_vault::config::Settings;
use holo_vault::error::SUPPORT_CONTACT;
use holo_vault::services::issuance::{add_new_secret, ConfirmationStatus, IssuanceDriver};
use holo_vault::services::proof_pipeline::ProofPipeline;
use holo_vault::services::relayer::RelayerClient;
use holo_vault::services::vendor::{decode_retrieval_endpoint, VendorClient};
use holo_vault::storage::backup_client::BackupClient;
use holo_vault::storage::credential_store::CredentialStore;
use holo_vault::storage::kv::{FileStore, KeyValueStore, MemoryStore};
use holo_vault::storage::proof_metadata::ProofMetadataStore;
use holo_vault::wallet::key_management::WalletSigner;
use holo_vault::wallet::secrets::SessionSecrets;
use holo_vault::zkp::proof_generation::{Groth16Prover, Prover};

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::init();

    if let Err(e) = run().await {
        error!("Issuance failed: {:#}", e);
        eprintln!("{:#}\n{}", e, SUPPORT_CONTACT);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let settings = Settings::load().context("invalid HOLO_* configuration")?;
    let overwrite = std::env::args().any(|arg| arg == "--overwrite");
    let argument = std::env::args()
        .skip(1)
        .find(|arg| !arg.starts_with("--"))
        .context("usage: holo-vault <retrieval-endpoint> [--overwrite]")?;
    let endpoint = if argument.starts_with("http") {
        argument
    } else {
        decode_retrieval_endpoint(&argument)?
    };

    let private_key = std::env::var("HOLO_PRIVATE_KEY").context("HOLO_PRIVATE_KEY must be set")?;
    let signer = WalletSigner::from_private_key_hex(&private_key)?;
    let digests = signer.derive_digests()?;
    let address = format!("0x{:x}", signer.address());
    info!("Issuing credentials for {}", address);

    // Storage: device-local and per-session stores, plus the remote backup
    let local: Arc<dyn KeyValueStore> = Arc::new(
        FileStore::open(&settings.local_store_path)
            .with_context(|| format!("cannot open local store {}", settings.local_store_path))?,
    );
    let session: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let backup = Arc::new(BackupClient::new(settings.id_server_url.as_str()));
    let prover: Arc<dyn Prover> = Arc::new(Groth16Prover);

    let store = Arc::new(
        CredentialStore::new(local.clone(), backup.clone(), settings.whitelist()).with_prover(prover.clone()),
    );
    let proof_metadata = Arc::new(ProofMetadataStore::new(
        local.clone(),
        backup,
        settings.default_action_id.clone(),
    ));
    let pipeline = Arc::new(ProofPipeline::new(prover, settings.proof_workers, settings.issuer_roles()));
    let relayer = Arc::new(RelayerClient::new(settings.relayer_url.as_str()));

    let vendor = VendorClient::new(settings.id_server_url.as_str(), local.clone(), session.clone());
    let record = vendor.retrieve(&endpoint).await?;
    let record = add_new_secret(&record, &SessionSecrets::new(session), &endpoint)?;

    let (driver, mut handle) = IssuanceDriver::new(store, pipeline, relayer, local, digests, address);
    let driver = driver.with_proof_metadata(proof_metadata);

    let confirmer = tokio::spawn(async move {
        while handle.changed().await {
            let snapshot = handle.snapshot();
            if snapshot.confirmation != ConfirmationStatus::ConfirmationRequired {
                continue;
            }
            if let Some(existing) = &snapshot.creds_that_will_be_overwritten {
                println!("Existing credentials: {}", existing.display_attributes());
            }
            if overwrite {
                handle.confirm_overwrite();
            } else {
                println!("Credentials from this issuer already exist; pass --overwrite to replace them.");
                handle.deny_overwrite();
            }
        }
    });

    let snapshot = driver.run(record).await?;
    confirmer.await.context("confirmation task panicked")?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    match snapshot.error {
        Some(message) => Err(anyhow!(message)),
        None => Ok(()),
    }
}
