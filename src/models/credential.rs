// src/models/credential.rs
//! Credential data model.
//!
//! A [`CredentialRecord`] is what an issuer hands back at the end of a
//! verification flow, plus the fields this wallet adds before the leaf is
//! inserted (`newSecret`, `serializedAsNewPreimage`, `newLeaf`). The JSON field
//! names follow the issuer wire format so vendor payloads parse unchanged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// The issuer-signed part of a credential.
///
/// `serialized_as_preimage` is the ordered leaf preimage the issuer signed over;
/// its layout is a contract with the circuits (see [`crate::zkp::leaf`]).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCreds {
    /// Issuer identifier, a field element in hex
    pub issuer_address: String,

    /// Secret the issuer placed in the original (signed) leaf
    pub secret: String,

    /// Attribute commitments, in leaf order
    #[serde(default)]
    pub custom_fields: Vec<String>,

    /// Issued-at timestamp; hex or decimal, occasionally malformed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<String>,

    #[serde(default)]
    pub scope: String,

    pub serialized_as_preimage: Vec<String>,

    /// Secret only this wallet knows, placed in the inserted leaf
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_secret: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialized_as_new_preimage: Option<Vec<String>>,
}

/// A point on the issuer's signing curve (EdDSA signatures).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CurvePoint {
    pub x: String,
    pub y: String,
}

/// Issuer attestation over the original leaf.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum IssuerSignature {
    /// 65-byte secp256k1 signature as hex, split into `v, r, s` for the relayer
    Ecdsa(String),
    /// BabyJubJub EdDSA signature
    EdDsa {
        #[serde(rename = "R8")]
        r8: CurvePoint,
        #[serde(rename = "S")]
        s: String,
    },
}

/// One issuer's credential as stored in the bundle.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    pub creds: IssuedCreds,

    /// Commitment over `serialized_as_preimage` (the issuer-signed leaf)
    pub leaf: String,

    /// Commitment over `serialized_as_new_preimage` (the inserted leaf)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_leaf: Option<String>,

    /// Opaque vendor metadata (raw attributes, derivation descriptions)
    #[serde(default)]
    pub metadata: serde_json::Value,

    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub pubkey: serde_json::Value,

    pub signature: IssuerSignature,
}

impl CredentialRecord {
    pub fn issuer_id(&self) -> &str {
        &self.creds.issuer_address
    }

    pub fn issued_at(&self) -> Option<&str> {
        self.creds.iat.as_deref().filter(|iat| !iat.is_empty())
    }

    /// What the user sees when asked to confirm an overwrite: the raw
    /// attributes if the vendor supplied them, otherwise the whole record.
    pub fn display_attributes(&self) -> serde_json::Value {
        match self.metadata.get("rawCreds") {
            Some(raw) if !raw.is_null() => raw.clone(),
            _ => serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
        }
    }

    /// New secret and new preimage, present once the wallet has attached them.
    pub fn new_witness(&self) -> Result<(&str, &[String]), ValidationError> {
        let secret = self
            .creds
            .new_secret
            .as_deref()
            .ok_or(ValidationError::MissingField("creds.newSecret"))?;
        let preimage = self
            .creds
            .serialized_as_new_preimage
            .as_deref()
            .ok_or(ValidationError::MissingField("creds.serializedAsNewPreimage"))?;
        Ok((secret, preimage))
    }
}

/// The user's complete credential bundle, keyed by issuer.
pub type SortedCredentials = BTreeMap<String, CredentialRecord>;

/// Looks up an issuer's record, ignoring the case of the hex key.
pub fn record_for<'a>(creds: &'a SortedCredentials, issuer: &str) -> Option<&'a CredentialRecord> {
    creds
        .get(issuer)
        .or_else(|| {
            creds
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(issuer))
                .map(|(_, record)| record)
        })
}

/// The fixed set of issuers whose leaves this wallet accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuerWhitelist {
    issuers: Vec<String>,
}

impl IssuerWhitelist {
    pub fn new<I, S>(issuers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            issuers: issuers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.issuers.iter().map(String::as_str)
    }

    pub fn contains(&self, issuer: &str) -> bool {
        self.issuers.iter().any(|i| i.eq_ignore_ascii_case(issuer))
    }

    /// Rejects records from issuers outside the whitelist.
    pub fn check(&self, record: &CredentialRecord) -> Result<(), ValidationError> {
        if self.contains(record.issuer_id()) {
            Ok(())
        } else {
            Err(ValidationError::IssuerNotWhitelisted(record.issuer_id().to_string()))
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use serde_json::json;

    pub const GOV_ID_ISSUER: &str =
        "0x2a4879fe71757462a1a7e103646bbc3349a15bd52b115153791da39b5e376bb0";
    pub const PHONE_ISSUER: &str =
        "0x0000000000000000000000000000000000000000000000000000000000000077";

    /// A record shaped like the mock id-server issuer's output.
    pub fn record(issuer: &str, iat: Option<&str>, secret: &str) -> CredentialRecord {
        let iat_value = iat.unwrap_or("0x00");
        CredentialRecord {
            creds: IssuedCreds {
                issuer_address: issuer.to_string(),
                secret: secret.to_string(),
                custom_fields: vec![
                    "0x02".to_string(),
                    "0x157c1cd1baa1b476d697324439e45668c701068235271bc7f1ab41dd8ee73b85".to_string(),
                ],
                iat: iat.map(str::to_string),
                scope: "0x00".to_string(),
                serialized_as_preimage: vec![
                    issuer.to_string(),
                    secret.to_string(),
                    "0x02".to_string(),
                    "0x157c1cd1baa1b476d697324439e45668c701068235271bc7f1ab41dd8ee73b85".to_string(),
                    iat_value.to_string(),
                    "0x00".to_string(),
                ],
                new_secret: None,
                serialized_as_new_preimage: None,
            },
            leaf: "0x17cc9aa1178d8e6a44c1774a9721f0ed5abce7a6ccf49ad6a03862a2d7ab9f12".to_string(),
            new_leaf: None,
            metadata: json!({ "rawCreds": { "countryCode": 2, "firstName": "Satoshi" } }),
            pubkey: serde_json::Value::Null,
            signature: IssuerSignature::Ecdsa(format!("0x{}1b", "11".repeat(64))),
        }
    }
}
