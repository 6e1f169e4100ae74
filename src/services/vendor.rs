// src/services/vendor.rs
//! Retrieval of freshly issued credentials from a verification vendor.
//!
//! The retrieval endpoint is a full URL handed over by the vendor flow,
//! usually base64-encoded in the wallet link. The record is fetched once per
//! call; if the fetch fails, the copy kept in session storage from an earlier
//! successful fetch is used instead.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::{CodecError, IssuanceError, TransportError, ValidationError};
use crate::models::credential::CredentialRecord;
use crate::storage::kv::{self, keys, KeyValueStore};
use crate::utils::http::{execute, read_json};
use crate::utils::serialization::{deserialize, serialize};

/// Local key remembering the last veriff session, so an interrupted flow can
/// rebuild its retrieval endpoint.
pub const VERIFF_SESSION_KEY: &str = "veriff-sessionId";

/// Decodes a base64 retrieval endpoint as found in wallet links.
pub fn decode_retrieval_endpoint(encoded: &str) -> Result<String, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidFieldElement {
        value: encoded.to_string(),
        reason,
    };
    let bytes = base64::decode(encoded.trim()).map_err(|e| invalid(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| invalid(e.to_string()))
}

pub struct VendorClient {
    client: reqwest::Client,
    id_server_url: String,
    local: Arc<dyn KeyValueStore>,
    session: Arc<dyn KeyValueStore>,
}

impl VendorClient {
    pub fn new(id_server_url: impl Into<String>, local: Arc<dyn KeyValueStore>, session: Arc<dyn KeyValueStore>) -> Self {
        Self {
            client: reqwest::Client::new(),
            id_server_url: id_server_url.into().trim_end_matches('/').to_string(),
            local,
            session,
        }
    }

    /// Fetches the record behind `retrieval_endpoint`.
    ///
    /// A successful fetch is cached in the session (fallback for later
    /// failures) and as local plaintext (removed once the bundle is backed
    /// up).
    ///
    /// # Errors
    /// The transport error of the fetch, with the vendor's body text, when
    /// there is no session copy to fall back to.
    pub async fn retrieve(&self, retrieval_endpoint: &str) -> Result<CredentialRecord, IssuanceError> {
        self.remember_veriff_session(retrieval_endpoint)?;

        match self.fetch(retrieval_endpoint).await {
            Ok(record) => {
                info!("Retrieved credentials from {}", retrieval_endpoint);
                let encoded = serialize(&record).map_err(CodecError::from)?;
                self.session.set(&keys::new_creds_from_issuer(retrieval_endpoint), &encoded)?;
                self.local.set(&keys::plaintext_creds(retrieval_endpoint), &encoded)?;
                Ok(record)
            }
            Err(e) => match self.session_copy(retrieval_endpoint)? {
                Some(record) => {
                    warn!("Retrieval failed ({}); using credentials from this session", e);
                    Ok(record)
                }
                None => Err(e.into()),
            },
        }
    }

    async fn fetch(&self, retrieval_endpoint: &str) -> Result<CredentialRecord, TransportError> {
        let response = execute(self.client.get(retrieval_endpoint), retrieval_endpoint).await?;
        let record: Option<CredentialRecord> = read_json(response, retrieval_endpoint).await?;
        record.ok_or_else(|| {
            TransportError::new(retrieval_endpoint, Some(200), "Could not retrieve credentials. No credentials found.")
        })
    }

    fn session_copy(&self, retrieval_endpoint: &str) -> Result<Option<CredentialRecord>, IssuanceError> {
        let Some(encoded) = kv::get_defined(self.session.as_ref(), &keys::new_creds_from_issuer(retrieval_endpoint))?
        else {
            return Ok(None);
        };
        match deserialize::<CredentialRecord>(&encoded) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                debug!("Ignoring unreadable session credentials: {}", e);
                Ok(None)
            }
        }
    }

    fn remember_veriff_session(&self, retrieval_endpoint: &str) -> Result<(), IssuanceError> {
        let veriff_url = format!("{}/veriff/credentials", self.id_server_url);
        if !retrieval_endpoint.starts_with(&veriff_url) {
            return Ok(());
        }
        let session_id = reqwest::Url::parse(retrieval_endpoint).ok().and_then(|url| {
            url.query_pairs()
                .find(|(name, _)| name == "sessionId")
                .map(|(_, value)| value.into_owned())
        });
        if let Some(session_id) = session_id {
            self.local.set(VERIFF_SESSION_KEY, &session_id)?;
        }
        Ok(())
    }
}
