// src/services/mod.rs
pub mod issuance;
pub mod proof_pipeline;
pub mod relayer;
pub mod vendor;
