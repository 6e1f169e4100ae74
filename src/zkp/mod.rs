// src/zkp/mod.rs
pub mod circuits;
pub mod leaf;
pub mod poseidon;
pub mod proof_generation;
pub mod proof_verification;
