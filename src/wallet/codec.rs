// src/wallet/codec.rs
//! Symmetric encryption of credential bundles and proof metadata.
//!
//! Bundles are serialized to JSON and encrypted with AES-256 in counter mode.
//! The key is the SHA-256 digest of a wallet signature, truncated to the
//! cipher's key length. The counter block starts at 1 for every message, which
//! keeps the ciphertext format readable by other clients of the same backup.
//!
//! # Integrity
//! There is no authentication tag. Decrypting with the wrong key "succeeds"
//! and yields garbage; callers detect that only by checking the shape of the
//! result. See [`Decrypted`]. With the counter fixed at 1, every message under
//! one key shares the same keystream.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ethers_core::utils::hex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;
use crate::utils::serialization::{deserialize, serialize};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

const KEY_LEN: usize = 32;

/// Initial counter block: the 128-bit big-endian integer 1.
const INITIAL_COUNTER: [u8; 16] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];

/// Outcome of a decryption.
#[derive(Debug)]
pub enum Decrypted<T> {
    /// Plaintext parsed into the expected shape
    Structured(T),
    /// Plaintext was valid UTF-8 but not the expected shape
    Raw(String),
    /// Ciphertext was unreadable, or the plaintext was not text at all
    Failed(CodecError),
}

impl<T> Decrypted<T> {
    pub fn structured(self) -> Option<T> {
        match self {
            Decrypted::Structured(value) => Some(value),
            _ => None,
        }
    }
}

/// AES-256-CTR codec keyed by a signature digest.
#[derive(Clone)]
pub struct CredentialCodec {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for CredentialCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCodec").finish_non_exhaustive()
    }
}

impl CredentialCodec {
    /// Builds a codec from a hex digest (optionally `0x`-prefixed).
    ///
    /// # Errors
    /// - `CodecError::Hex` if the digest is not hex
    /// - `CodecError::KeyLength` if it decodes to fewer than 32 bytes
    pub fn new(key_digest: &str) -> Result<Self, CodecError> {
        let bytes = hex::decode(strip_0x(key_digest)).map_err(|e| CodecError::Hex(e.to_string()))?;
        if bytes.len() < KEY_LEN {
            return Err(CodecError::KeyLength(bytes.len()));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes[..KEY_LEN]);
        Ok(Self { key })
    }

    /// Serializes `value` to JSON and encrypts it. Returns lowercase hex.
    pub fn encrypt<T: Serialize>(&self, value: &T) -> Result<String, CodecError> {
        let plaintext = serialize(value)?;
        Ok(self.encrypt_text(&plaintext))
    }

    /// Encrypts text as-is.
    pub fn encrypt_text(&self, plaintext: &str) -> String {
        let mut buf = plaintext.as_bytes().to_vec();
        self.apply_keystream(&mut buf);
        hex::encode(buf)
    }

    /// Decrypts and parses into `T`, falling back to the raw text.
    pub fn decrypt<T: DeserializeOwned>(&self, ciphertext: &str) -> Decrypted<T> {
        let mut buf = match hex::decode(strip_0x(ciphertext)) {
            Ok(bytes) => bytes,
            Err(e) => return Decrypted::Failed(CodecError::Hex(e.to_string())),
        };
        self.apply_keystream(&mut buf);
        let text = match String::from_utf8(buf) {
            Ok(text) => text,
            Err(e) => return Decrypted::Failed(CodecError::Hex(format!("plaintext is not UTF-8: {}", e))),
        };
        match deserialize::<T>(&text) {
            Ok(value) => Decrypted::Structured(value),
            Err(_) => Decrypted::Raw(text),
        }
    }

    fn apply_keystream(&self, buf: &mut [u8]) {
        let mut cipher = Aes256Ctr::new(&self.key.into(), &INITIAL_COUNTER.into());
        cipher.apply_keystream(buf);
    }
}

fn strip_0x(value: &str) -> &str {
    value.strip_prefix("0x").unwrap_or(value)
}
