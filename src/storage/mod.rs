// src/storage/mod.rs
pub mod backup_client;
pub mod credential_store;
pub mod kv;
pub mod proof_metadata;
