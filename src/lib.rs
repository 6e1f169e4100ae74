// src/lib.rs
//! Client-side credential vault.
//!
//! Retrieves issuer-signed credentials, attaches a secret only the user knows,
//! inserts the resulting leaf through a relayer, and keeps the encrypted
//! credential bundle in sync between the device and a remote backup.

pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod storage;
pub mod utils;
pub mod wallet;
pub mod zkp;
