// src/wallet/mod.rs
pub mod codec;
pub mod key_management;
pub mod secrets;
