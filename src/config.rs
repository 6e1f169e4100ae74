// src/config.rs
//! Runtime settings.
//!
//! Read from `HOLO_*` environment variables (the binary loads `.env` first),
//! layered over the defaults below.

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

use crate::models::credential::IssuerWhitelist;

pub const DEFAULT_ID_SERVER_URL: &str = "https://id-server.holonym.io";
pub const DEFAULT_RELAYER_URL: &str = "https://relayer.holonym.id";
pub const DEFAULT_ACTION_ID: &str = "123456789";
pub const DEFAULT_LOCAL_STORE_PATH: &str = "holo-vault-local.json";
/// Government-ID issuer accepted when no whitelist is configured.
pub const DEFAULT_GOV_ID_ISSUER: &str = "0x2a4879fe71757462a1a7e103646bbc3349a15bd52b115153791da39b5e376bb0";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Backup server base URL
    pub id_server_url: String,
    pub relayer_url: String,
    /// Comma-separated issuer ids
    pub issuer_whitelist: String,
    /// Proof generations allowed to run at once
    pub proof_workers: usize,
    pub default_action_id: String,
    /// File holding the device-local store
    pub local_store_path: String,
    /// Issuer whose record feeds the uniqueness, residency, KOLP and name proofs
    #[serde(default)]
    pub gov_id_issuer: Option<String>,
    /// Issuer whose record feeds the medical-specialty proof
    #[serde(default)]
    pub medical_issuer: Option<String>,
}

impl Settings {
    /// Loads settings from the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_source(Environment::with_prefix("HOLO").try_parsing(true))
    }

    fn from_source(environment: Environment) -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("id_server_url", DEFAULT_ID_SERVER_URL)?
            .set_default("relayer_url", DEFAULT_RELAYER_URL)?
            .set_default("issuer_whitelist", DEFAULT_GOV_ID_ISSUER)?
            .set_default("proof_workers", 1)?
            .set_default("default_action_id", DEFAULT_ACTION_ID)?
            .set_default("local_store_path", DEFAULT_LOCAL_STORE_PATH)?
            .add_source(environment)
            .build()?
            .try_deserialize()
    }

    pub fn whitelist(&self) -> IssuerWhitelist {
        IssuerWhitelist::new(
            self.issuer_whitelist
                .split(',')
                .map(str::trim)
                .filter(|issuer| !issuer.is_empty()),
        )
    }

    pub fn issuer_roles(&self) -> IssuerRoles {
        IssuerRoles {
            gov_id: self.gov_id_issuer.clone().or_else(|| Some(DEFAULT_GOV_ID_ISSUER.to_string())),
            medical: self.medical_issuer.clone(),
            default_action_id: self.default_action_id.clone(),
        }
    }
}

/// Which issuer's record backs which derived proofs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssuerRoles {
    pub gov_id: Option<String>,
    pub medical: Option<String>,
    pub default_action_id: String,
}
