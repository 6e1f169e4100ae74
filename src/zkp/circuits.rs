// src/zkp/circuits.rs
//! R1CS circuits for every proof kind.
//!
//! Each circuit opens a leaf: it takes the six-element preimage as a private
//! witness, recomputes the Poseidon commitment in-circuit and enforces that it
//! equals the public leaf. Kind-specific constraints are layered on top.
//!
//! Public inputs are allocated first, in the order returned by
//! [`ProofCircuit::public_inputs`]; that order is what a verifier must supply.

use ark_bn254::Fr;
use ark_crypto_primitives::sponge::constraints::CryptographicSpongeVar;
use ark_crypto_primitives::sponge::poseidon::constraints::PoseidonSpongeVar;
use ark_r1cs_std::{
    alloc::AllocVar,
    eq::EqGadget,
    fields::{fp::FpVar, FieldVar},
};
use ark_relations::r1cs::{ConstraintSynthesizer, ConstraintSystemRef, SynthesisError};
use serde_json::Value;

use crate::error::ValidationError;
use crate::models::proof::ProofKind;
use crate::utils::crypto::{parse_field, text_to_field};
use crate::zkp::leaf::{parse_preimage, CUSTOM_FIELD_SLOTS, PREIMAGE_LEN, SECRET_SLOT};
use crate::zkp::poseidon::{get_poseidon_config, poseidon_hash};

/// Country code the residency circuit accepts.
pub const US_COUNTRY_CODE: u64 = 2;

type Preimage = [Fr; PREIMAGE_LEN];

/// Attributes hidden behind the gov-ID record's second custom field:
/// `H(H(first, middle, last), birthdate, addressHash, expiration)`.
#[derive(Debug, Clone, PartialEq)]
pub struct NameWitness {
    pub first: Fr,
    pub middle: Fr,
    pub last: Fr,
    pub birthdate: Fr,
    pub address_hash: Fr,
    pub expiration: Fr,
}

impl NameWitness {
    /// Reads the name attributes from a gov-ID record's vendor metadata.
    ///
    /// Names and the birthdate come from `rawCreds` as text; `addressHash`
    /// and `expirationDate` come from `derivedCreds` as field elements.
    /// Missing optional values encode as zero.
    pub fn from_metadata(metadata: &Value) -> Result<Self, ValidationError> {
        let raw = &metadata["rawCreds"];
        let derived = &metadata["derivedCreds"];
        let text = |key: &str| raw.get(key).and_then(Value::as_str).unwrap_or("");

        let first = raw
            .get("firstName")
            .and_then(Value::as_str)
            .ok_or(ValidationError::MissingField("metadata.rawCreds.firstName"))?;
        let last = raw
            .get("lastName")
            .and_then(Value::as_str)
            .ok_or(ValidationError::MissingField("metadata.rawCreds.lastName"))?;
        let field = |key: &str| parse_field(derived.get(key).and_then(Value::as_str).unwrap_or("0x00"));

        Ok(Self {
            first: text_to_field(first)?,
            middle: text_to_field(text("middleName"))?,
            last: text_to_field(last)?,
            birthdate: text_to_field(text("birthdate"))?,
            address_hash: field("addressHash")?,
            expiration: field("expirationDate")?,
        })
    }

    /// Value the issuer placed in custom field 1.
    pub fn commitment(&self) -> Fr {
        let name_hash = poseidon_hash(&[self.first, self.middle, self.last]);
        poseidon_hash(&[name_hash, self.birthdate, self.address_hash, self.expiration])
    }

    fn blank() -> Self {
        let zero = Fr::from(0u64);
        Self {
            first: zero,
            middle: zero,
            last: zero,
            birthdate: zero,
            address_hash: zero,
            expiration: zero,
        }
    }
}

/// A fully witnessed circuit, one variant per [`ProofKind`].
#[derive(Debug, Clone)]
pub enum ProofCircuit {
    /// Knowledge of the preimage of a leaf
    Kolp { preimage: Preimage },
    /// Old leaf and new leaf differ only in the secret slot
    LeafInsertion { old_preimage: Preimage, new_secret: Fr },
    /// Nullifier `H(secret, actionId)` for an action
    Uniqueness { preimage: Preimage, address: Fr, action_id: Fr },
    /// Country code in custom field 0 is the US
    UsResidency { preimage: Preimage, address: Fr },
    /// Reveals the specialty held in custom field 0
    MedicalSpecialty { preimage: Preimage, address: Fr },
    /// Reveals first and last name committed in custom field 1
    GovIdName { preimage: Preimage, name: NameWitness },
}

impl ProofCircuit {
    pub fn kolp(preimage: &[String]) -> Result<Self, ValidationError> {
        Ok(ProofCircuit::Kolp {
            preimage: parse_preimage(preimage)?,
        })
    }

    pub fn leaf_insertion(old_preimage: &[String], new_secret: &str) -> Result<Self, ValidationError> {
        Ok(ProofCircuit::LeafInsertion {
            old_preimage: parse_preimage(old_preimage)?,
            new_secret: parse_field(new_secret)?,
        })
    }

    pub fn uniqueness(preimage: &[String], address: &str, action_id: &str) -> Result<Self, ValidationError> {
        Ok(ProofCircuit::Uniqueness {
            preimage: parse_preimage(preimage)?,
            address: parse_field(address)?,
            action_id: parse_field(action_id)?,
        })
    }

    pub fn us_residency(preimage: &[String], address: &str) -> Result<Self, ValidationError> {
        Ok(ProofCircuit::UsResidency {
            preimage: parse_preimage(preimage)?,
            address: parse_field(address)?,
        })
    }

    pub fn medical_specialty(preimage: &[String], address: &str) -> Result<Self, ValidationError> {
        Ok(ProofCircuit::MedicalSpecialty {
            preimage: parse_preimage(preimage)?,
            address: parse_field(address)?,
        })
    }

    pub fn gov_id_name(preimage: &[String], name: NameWitness) -> Result<Self, ValidationError> {
        Ok(ProofCircuit::GovIdName {
            preimage: parse_preimage(preimage)?,
            name,
        })
    }

    /// All-zero instance of `kind`, used for key generation.
    pub fn blank(kind: ProofKind) -> Self {
        let preimage = [Fr::from(0u64); PREIMAGE_LEN];
        let zero = Fr::from(0u64);
        match kind {
            ProofKind::Kolp => ProofCircuit::Kolp { preimage },
            ProofKind::LeafInsertion => ProofCircuit::LeafInsertion {
                old_preimage: preimage,
                new_secret: zero,
            },
            ProofKind::Uniqueness => ProofCircuit::Uniqueness {
                preimage,
                address: zero,
                action_id: zero,
            },
            ProofKind::UsResidency => ProofCircuit::UsResidency { preimage, address: zero },
            ProofKind::MedicalSpecialty => ProofCircuit::MedicalSpecialty { preimage, address: zero },
            ProofKind::GovIdFirstNameLastName => ProofCircuit::GovIdName {
                preimage,
                name: NameWitness::blank(),
            },
        }
    }

    pub fn kind(&self) -> ProofKind {
        match self {
            ProofCircuit::Kolp { .. } => ProofKind::Kolp,
            ProofCircuit::LeafInsertion { .. } => ProofKind::LeafInsertion,
            ProofCircuit::Uniqueness { .. } => ProofKind::Uniqueness,
            ProofCircuit::UsResidency { .. } => ProofKind::UsResidency,
            ProofCircuit::MedicalSpecialty { .. } => ProofKind::MedicalSpecialty,
            ProofCircuit::GovIdName { .. } => ProofKind::GovIdFirstNameLastName,
        }
    }

    /// Named public inputs in allocation order.
    pub fn public_inputs(&self) -> Vec<(&'static str, Fr)> {
        match self {
            ProofCircuit::Kolp { preimage } => vec![("leaf", poseidon_hash(preimage))],
            ProofCircuit::LeafInsertion {
                old_preimage,
                new_secret,
            } => {
                let mut new_preimage = *old_preimage;
                new_preimage[SECRET_SLOT] = *new_secret;
                vec![
                    ("oldLeaf", poseidon_hash(old_preimage)),
                    ("newLeaf", poseidon_hash(&new_preimage)),
                ]
            }
            ProofCircuit::Uniqueness {
                preimage,
                address,
                action_id,
            } => vec![
                ("leaf", poseidon_hash(preimage)),
                ("address", *address),
                ("actionId", *action_id),
                ("nullifier", poseidon_hash(&[preimage[SECRET_SLOT], *action_id])),
            ],
            ProofCircuit::UsResidency { preimage, address } => {
                vec![("leaf", poseidon_hash(preimage)), ("address", *address)]
            }
            ProofCircuit::MedicalSpecialty { preimage, address } => vec![
                ("leaf", poseidon_hash(preimage)),
                ("address", *address),
                ("specialty", preimage[CUSTOM_FIELD_SLOTS[0]]),
            ],
            ProofCircuit::GovIdName { preimage, name } => vec![
                ("leaf", poseidon_hash(preimage)),
                ("firstName", name.first),
                ("lastName", name.last),
            ],
        }
    }
}

/// In-circuit Poseidon over `inputs`, matching [`poseidon_hash`].
pub fn poseidon_gadget(cs: ConstraintSystemRef<Fr>, inputs: &[FpVar<Fr>]) -> Result<FpVar<Fr>, SynthesisError> {
    let mut sponge_var = PoseidonSpongeVar::<Fr>::new(cs, get_poseidon_config());
    sponge_var.absorb(&inputs.to_vec())?;
    let mut squeezed = sponge_var.squeeze_field_elements(1)?;
    Ok(squeezed.remove(0))
}

fn alloc_preimage(cs: &ConstraintSystemRef<Fr>, preimage: &Preimage) -> Result<Vec<FpVar<Fr>>, SynthesisError> {
    preimage
        .iter()
        .map(|value| FpVar::new_witness(cs.clone(), || Ok(*value)))
        .collect()
}

/// Recomputes the leaf over `preimage_vars` and ties it to `leaf_var`.
fn enforce_leaf(
    cs: &ConstraintSystemRef<Fr>,
    preimage_vars: &[FpVar<Fr>],
    leaf_var: &FpVar<Fr>,
) -> Result<(), SynthesisError> {
    poseidon_gadget(cs.clone(), preimage_vars)?.enforce_equal(leaf_var)
}

impl ConstraintSynthesizer<Fr> for ProofCircuit {
    fn generate_constraints(self, cs: ConstraintSystemRef<Fr>) -> Result<(), SynthesisError> {
        let public_vars = self
            .public_inputs()
            .into_iter()
            .map(|(_, value)| FpVar::new_input(cs.clone(), || Ok(value)))
            .collect::<Result<Vec<_>, _>>()?;

        match self {
            ProofCircuit::Kolp { preimage } => {
                let preimage_vars = alloc_preimage(&cs, &preimage)?;
                enforce_leaf(&cs, &preimage_vars, &public_vars[0])?;
            }
            ProofCircuit::LeafInsertion {
                old_preimage,
                new_secret,
            } => {
                let old_vars = alloc_preimage(&cs, &old_preimage)?;
                let new_secret_var = FpVar::new_witness(cs.clone(), || Ok(new_secret))?;
                let mut new_vars = old_vars.clone();
                new_vars[SECRET_SLOT] = new_secret_var;
                enforce_leaf(&cs, &old_vars, &public_vars[0])?;
                enforce_leaf(&cs, &new_vars, &public_vars[1])?;
            }
            ProofCircuit::Uniqueness { preimage, .. } => {
                let preimage_vars = alloc_preimage(&cs, &preimage)?;
                enforce_leaf(&cs, &preimage_vars, &public_vars[0])?;
                // Binds the address into the proof.
                let _ = public_vars[1].square()?;
                let nullifier = poseidon_gadget(
                    cs.clone(),
                    &[preimage_vars[SECRET_SLOT].clone(), public_vars[2].clone()],
                )?;
                nullifier.enforce_equal(&public_vars[3])?;
            }
            ProofCircuit::UsResidency { preimage, .. } => {
                let preimage_vars = alloc_preimage(&cs, &preimage)?;
                enforce_leaf(&cs, &preimage_vars, &public_vars[0])?;
                let _ = public_vars[1].square()?;
                preimage_vars[CUSTOM_FIELD_SLOTS[0]].enforce_equal(&FpVar::constant(Fr::from(US_COUNTRY_CODE)))?;
            }
            ProofCircuit::MedicalSpecialty { preimage, .. } => {
                let preimage_vars = alloc_preimage(&cs, &preimage)?;
                enforce_leaf(&cs, &preimage_vars, &public_vars[0])?;
                let _ = public_vars[1].square()?;
                preimage_vars[CUSTOM_FIELD_SLOTS[0]].enforce_equal(&public_vars[2])?;
            }
            ProofCircuit::GovIdName { preimage, name } => {
                let preimage_vars = alloc_preimage(&cs, &preimage)?;
                enforce_leaf(&cs, &preimage_vars, &public_vars[0])?;

                let middle = FpVar::new_witness(cs.clone(), || Ok(name.middle))?;
                let birthdate = FpVar::new_witness(cs.clone(), || Ok(name.birthdate))?;
                let address_hash = FpVar::new_witness(cs.clone(), || Ok(name.address_hash))?;
                let expiration = FpVar::new_witness(cs.clone(), || Ok(name.expiration))?;

                let name_hash = poseidon_gadget(
                    cs.clone(),
                    &[public_vars[1].clone(), middle, public_vars[2].clone()],
                )?;
                let commitment = poseidon_gadget(cs.clone(), &[name_hash, birthdate, address_hash, expiration])?;
                commitment.enforce_equal(&preimage_vars[CUSTOM_FIELD_SLOTS[1]])?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::credential::fixtures::{record, GOV_ID_ISSUER};
    use crate::utils::crypto::field_to_hex;
    use crate::zkp::leaf::compute_leaf;
    use ark_r1cs_std::R1CSVar;
    use ark_relations::r1cs::ConstraintSystem;
    use serde_json::json;

    fn preimage() -> Vec<String> {
        record(GOV_ID_ISSUER, Some("0xe7bde8ce"), "0x15").creds.serialized_as_preimage
    }

    fn is_satisfied(circuit: ProofCircuit) -> bool {
        let cs = ConstraintSystem::<Fr>::new_ref();
        circuit.generate_constraints(cs.clone()).unwrap();
        cs.is_satisfied().unwrap()
    }

    #[test]
    fn gadget_matches_native_hash() {
        let values = [Fr::from(7u64), Fr::from(11u64), Fr::from(13u64)];
        let cs = ConstraintSystem::<Fr>::new_ref();
        let vars: Vec<FpVar<Fr>> = values
            .iter()
            .map(|v| FpVar::new_witness(cs.clone(), || Ok(*v)).unwrap())
            .collect();
        let out = poseidon_gadget(cs.clone(), &vars).unwrap();
        assert_eq!(out.value().unwrap(), poseidon_hash(&values));
    }

    #[test]
    fn kolp_opens_the_native_leaf() {
        let circuit = ProofCircuit::kolp(&preimage()).unwrap();
        let leaf = circuit.public_inputs()[0].1;
        assert_eq!(field_to_hex(&leaf), compute_leaf(&preimage()).unwrap());
        assert!(is_satisfied(circuit));
    }

    #[test]
    fn leaf_insertion_links_old_and_new_leaf() {
        let circuit = ProofCircuit::leaf_insertion(&preimage(), "0x99").unwrap();
        let inputs = circuit.public_inputs();
        let mut new_preimage = preimage();
        new_preimage[SECRET_SLOT] = "0x99".to_string();
        assert_eq!(field_to_hex(&inputs[1].1), compute_leaf(&new_preimage).unwrap());
        assert!(is_satisfied(circuit));
    }

    #[test]
    fn uniqueness_and_residency_are_satisfied_for_us_record() {
        let address = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
        assert!(is_satisfied(ProofCircuit::uniqueness(&preimage(), address, "123456789").unwrap()));
        assert!(is_satisfied(ProofCircuit::us_residency(&preimage(), address).unwrap()));
        assert!(is_satisfied(ProofCircuit::medical_specialty(&preimage(), address).unwrap()));
    }

    #[test]
    fn residency_rejects_other_countries() {
        let mut non_us = preimage();
        non_us[CUSTOM_FIELD_SLOTS[0]] = "0x03".to_string();
        assert!(!is_satisfied(ProofCircuit::us_residency(&non_us, "0x01").unwrap()));
    }

    #[test]
    fn name_proof_checks_the_custom_field_commitment() {
        let metadata = json!({
            "rawCreds": { "firstName": "Satoshi", "lastName": "Nakamoto", "birthdate": "1975-04-05" },
            "derivedCreds": { "addressHash": "0x0abc" }
        });
        let name = NameWitness::from_metadata(&metadata).unwrap();
        let mut committed = preimage();
        committed[CUSTOM_FIELD_SLOTS[1]] = field_to_hex(&name.commitment());

        let circuit = ProofCircuit::gov_id_name(&committed, name.clone()).unwrap();
        assert_eq!(circuit.public_inputs()[1], ("firstName", text_to_field("Satoshi").unwrap()));
        assert!(is_satisfied(circuit));

        // Record whose custom field commits to someone else
        assert!(!is_satisfied(ProofCircuit::gov_id_name(&preimage(), name).unwrap()));
    }

    #[test]
    fn name_witness_requires_names() {
        assert_eq!(
            NameWitness::from_metadata(&json!({ "rawCreds": { "lastName": "N" } })),
            Err(ValidationError::MissingField("metadata.rawCreds.firstName"))
        );
    }

    #[test]
    fn blank_circuits_report_their_kind() {
        for kind in ProofKind::ALL {
            assert_eq!(ProofCircuit::blank(kind).kind(), kind);
        }
    }
}
