// src/zkp/poseidon.rs
//! Poseidon hash over the BN254 scalar field.
//!
//! One parameter set is shared by the native hash (used to build leaves) and
//! the in-circuit sponge (used by every proof), so a leaf computed here is the
//! exact value the circuits recompute.
//!
//! ## Parameters
//! - Full rounds: 8
//! - Partial rounds: 57
//! - Alpha (S-box): 5
//! - Rate: 2
//! - Capacity: 1
//!
//! Round constants and the MDS matrix come from the Grain LFSR procedure of the
//! Poseidon paper, so they are reproducible from these five numbers alone.

use ark_bn254::Fr as Bn254Fr;
use ark_crypto_primitives::sponge::poseidon::{find_poseidon_ark_and_mds, PoseidonConfig, PoseidonSponge};
use ark_crypto_primitives::sponge::CryptographicSponge;
use ark_ff::PrimeField;
use once_cell::sync::Lazy;

const FULL_ROUNDS: usize = 8;
const PARTIAL_ROUNDS: usize = 57;
const ALPHA: u64 = 5;
const RATE: usize = 2;
const CAPACITY: usize = 1;

/// Cached Poseidon configuration for BN254.
static POSEIDON_CONFIG: Lazy<PoseidonConfig<Bn254Fr>> = Lazy::new(generate_poseidon_config);

/// Derives the parameter set from the Grain LFSR.
pub fn generate_poseidon_config() -> PoseidonConfig<Bn254Fr> {
    let (ark, mds) = find_poseidon_ark_and_mds::<Bn254Fr>(
        Bn254Fr::MODULUS_BIT_SIZE as u64,
        RATE,
        FULL_ROUNDS as u64,
        PARTIAL_ROUNDS as u64,
        0,
    );
    PoseidonConfig {
        full_rounds: FULL_ROUNDS,
        partial_rounds: PARTIAL_ROUNDS,
        alpha: ALPHA,
        rate: RATE,
        capacity: CAPACITY,
        mds,
        ark,
    }
}

/// Retrieves the global Poseidon configuration.
pub fn get_poseidon_config() -> &'static PoseidonConfig<Bn254Fr> {
    &POSEIDON_CONFIG
}

/// Hashes an ordered list of field elements to one field element.
pub fn poseidon_hash(inputs: &[Bn254Fr]) -> Bn254Fr {
    let mut sponge = PoseidonSponge::<Bn254Fr>::new(get_poseidon_config());
    sponge.absorb(&inputs.to_vec());
    let mut out = sponge.squeeze_field_elements::<Bn254Fr>(1);
    out.remove(0)
}
