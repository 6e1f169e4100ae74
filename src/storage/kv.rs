// src/storage/kv.rs
//! Key-value storage on the client device.
//!
//! The wallet persists everything (encrypted bundles, per-endpoint secrets,
//! cached proofs) through the [`KeyValueStore`] trait. Two instances are
//! injected: a durable "local" store and a "session" store that lives only as
//! long as the user's session. [`MemoryStore`] backs the session store and
//! tests; [`FileStore`] keeps the local store on disk between runs.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::debug;

use crate::error::StoreError;

/// Names of persisted keys. Shared with other clients of the same backup, so
/// they must not change.
pub mod keys {
    /// Auth-signature digest the local bundle was written under
    pub const SIG_DIGEST: &str = "holoSigDigest";
    pub const ENCRYPTED_CREDENTIALS: &str = "holoEncryptedCredentialsAES";
    pub const ENCRYPTED_PROOF_METADATA: &str = "holoEncryptedProofMetadataAES";
    pub const LATEST_KOLP_PROOF: &str = "latest-kolp-proof";
    /// Prefix of per-endpoint plaintext credential caches
    pub const PLAINTEXT_CREDS_PREFIX: &str = "holoPlaintextCreds";

    /// Local plaintext copy of a freshly retrieved record.
    pub fn plaintext_creds(retrieval_endpoint: &str) -> String {
        format!("{}-{}", PLAINTEXT_CREDS_PREFIX, retrieval_endpoint)
    }

    /// Session slot holding the secret generated for an endpoint.
    pub fn new_secret(retrieval_endpoint: &str) -> String {
        format!("holoNewSecret-{}", retrieval_endpoint)
    }

    /// Session copy of the vendor record, used when re-fetching fails.
    pub fn new_creds_from_issuer(retrieval_endpoint: &str) -> String {
        format!("holoNewCredsFromIssuer-{}", retrieval_endpoint)
    }
}

/// String key-value storage with interior mutability.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    /// Returns whether a value was present.
    fn remove(&self, key: &str) -> Result<bool, StoreError>;
    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

/// Reads a key, treating the `"undefined"` and `"null"` sentinels other
/// clients write as absent.
pub fn get_defined(store: &dyn KeyValueStore, key: &str) -> Result<Option<String>, StoreError> {
    Ok(store.get(key)?.filter(|v| is_defined(v)))
}

pub fn is_defined(value: &str) -> bool {
    !value.is_empty() && value != "undefined" && value != "null"
}

/// In-memory [`KeyValueStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Local("memory store lock poisoned".into()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock()?.keys().cloned().collect())
    }
}

/// [`KeyValueStore`] persisted as a JSON object in a single file.
///
/// The whole map is rewritten on every change, through a sibling `.tmp` file
/// renamed over the original.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Opens the store at `path`, loading its entries if the file exists.
    ///
    /// # Errors
    /// `StoreError::Local` if the file cannot be read or is not a JSON object
    /// of strings.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| StoreError::Local(format!("{} is corrupt: {}", path.display(), e)))?,
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(StoreError::Local(format!("cannot read {}: {}", path.display(), e))),
        };
        debug!("Opened local store {} ({} keys)", path.display(), entries.len());
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Local("file store lock poisoned".into()))
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(entries).map_err(|e| StoreError::Local(e.to_string()))?;
        let tmp_path = PathBuf::from(format!("{}.tmp", self.path.to_string_lossy()));
        fs::write(&tmp_path, json)
            .map_err(|e| StoreError::Local(format!("cannot write {}: {}", tmp_path.display(), e)))?;
        fs::rename(&tmp_path, &self.path)
            .map_err(|e| StoreError::Local(format!("cannot replace {}: {}", self.path.display(), e)))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.lock()?;
        let previous = entries.insert(key.to_string(), value.to_string());
        if let Err(e) = self.flush(&entries) {
            // Memory must not run ahead of the file
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.lock()?;
        let Some(previous) = entries.remove(key) else {
            return Ok(false);
        };
        if let Err(e) = self.flush(&entries) {
            entries.insert(key.to_string(), previous);
            return Err(e);
        }
        Ok(true)
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock()?.keys().cloned().collect())
    }
}

/// Removes every key starting with `prefix`, returning how many went.
pub fn remove_prefixed(store: &dyn KeyValueStore, prefix: &str) -> Result<usize, StoreError> {
    let mut removed = 0;
    for key in store.keys()? {
        if key.starts_with(prefix) && store.remove(&key)? {
            removed += 1;
        }
    }
    Ok(removed)
}
