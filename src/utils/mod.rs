// src/utils/mod.rs
pub mod crypto;
pub mod http;
pub mod serialization;
