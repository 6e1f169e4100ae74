// src/wallet/secrets.rs
//! Per-credential secrets.
//!
//! A secret is 64 random bytes reduced modulo the BN254 scalar field. The
//! secret for a retrieval endpoint is generated once and kept in session
//! storage, so re-running issuance for the same endpoint in the same session
//! attaches the same secret (and therefore the same new leaf).

use std::sync::Arc;

use log::{debug, info};
use num_bigint::BigUint;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::IssuanceError;
use crate::storage::kv::{self, KeyValueStore};
use crate::utils::crypto::field_modulus;

/// Draws fresh field-bounded secrets from the operating system RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct SecretGenerator;

impl SecretGenerator {
    /// Generates a secret as `0x`-prefixed hex.
    ///
    /// # Errors
    /// Fails only when the OS randomness source is unavailable; there is no
    /// fallback source.
    pub fn generate(&self) -> Result<String, IssuanceError> {
        let mut bytes = [0u8; 64];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| IssuanceError::Randomness(e.to_string()))?;
        let secret = BigUint::from_bytes_be(&bytes) % field_modulus();
        Ok(format!("0x{}", secret.to_str_radix(16)))
    }
}

/// Session-scoped secret slots keyed by retrieval endpoint.
///
/// Concurrent sessions performing the same issuance are not excluded from each
/// other; each session only ever sees its own slot.
pub struct SessionSecrets {
    session: Arc<dyn KeyValueStore>,
    generator: SecretGenerator,
}

impl SessionSecrets {
    pub fn new(session: Arc<dyn KeyValueStore>) -> Self {
        Self {
            session,
            generator: SecretGenerator,
        }
    }

    /// Returns the endpoint's secret, generating and persisting it on first use.
    pub fn secret_for(&self, retrieval_endpoint: &str) -> Result<String, IssuanceError> {
        let key = kv::keys::new_secret(retrieval_endpoint);
        if let Some(existing) = kv::get_defined(self.session.as_ref(), &key)? {
            debug!("Reusing session secret for {}", retrieval_endpoint);
            return Ok(existing);
        }
        let secret = self.generator.generate()?;
        self.session.set(&key, &secret)?;
        info!("Generated new secret for {}", retrieval_endpoint);
        Ok(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::MemoryStore;
    use crate::utils::crypto::{parse_field, parse_uint};

    #[test]
    fn generated_secrets_are_field_elements_and_distinct() {
        let generator = SecretGenerator;
        let a = generator.generate().unwrap();
        let b = generator.generate().unwrap();
        assert_ne!(a, b);
        assert!(parse_uint(&a).unwrap() < field_modulus());
        assert!(parse_field(&a).is_ok());
    }

    #[test]
    fn same_endpoint_same_session_yields_same_secret() {
        let session = Arc::new(MemoryStore::new());
        let secrets = SessionSecrets::new(session.clone());

        let first = secrets.secret_for("https://id-server/creds?id=1").unwrap();
        let second = secrets.secret_for("https://id-server/creds?id=1").unwrap();
        assert_eq!(first, second);

        let other = secrets.secret_for("https://phone-server/creds?id=2").unwrap();
        assert_ne!(first, other);
        assert_eq!(session.len(), 2);
    }

    #[test]
    fn new_session_generates_new_secret() {
        let endpoint = "https://id-server/creds?id=1";
        let first = SessionSecrets::new(Arc::new(MemoryStore::new()))
            .secret_for(endpoint)
            .unwrap();
        let second = SessionSecrets::new(Arc::new(MemoryStore::new()))
            .secret_for(endpoint)
            .unwrap();
        assert_ne!(first, second);
    }
}
