//! Proofs of knowledge of a secret key `x` for `P = x·G`, bound to a domain
//! label and arbitrary commitment data. Used both for input ownership at
//! registration (data = round id) and for input witnesses (data = sighash).

use super::group::{GroupElement, Scalar};
use super::transcript::Transcript;
use super::zk::{self, Equation, Knowledge, Proof, ProofError, Statement};
use crate::core::types::ScriptPubKey;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

pub const INPUT_OWNERSHIP_LABEL: &[u8] = b"coinjoin-input-ownership";
pub const WITNESS_LABEL: &[u8] = b"coinjoin-witness";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipProof {
    pub public_key: GroupElement,
    pub proof: Proof,
}

fn transcript(label: &[u8], data: &[u8]) -> Transcript {
    let mut t = Transcript::new(b"wabisabi/ownership");
    t.commit_bytes(b"label", label);
    t.commit_bytes(b"data", data);
    t
}

fn statement(public_key: GroupElement) -> Result<Statement, ProofError> {
    Statement::new(vec![Equation::new(public_key, vec![GroupElement::generator()])])
}

impl OwnershipProof {
    pub fn generate<R: RngCore + CryptoRng>(
        secret: &Scalar,
        label: &[u8],
        data: &[u8],
        rng: &mut R,
    ) -> Result<Self, ProofError> {
        let public_key = GroupElement::generator() * secret;
        if public_key.is_identity() {
            return Err(ProofError::Unsatisfied);
        }
        let knowledge = Knowledge::new(statement(public_key)?, vec![*secret])?;
        let mut proofs = zk::prove(transcript(label, data), vec![knowledge], rng);
        let proof = proofs.pop().ok_or(ProofError::EmptyStatement)?;
        Ok(Self { public_key, proof })
    }

    pub fn verify(&self, label: &[u8], data: &[u8]) -> bool {
        if self.public_key.is_identity() {
            return false;
        }
        match statement(self.public_key) {
            Ok(s) => zk::verify(transcript(label, data), &[s], std::slice::from_ref(&self.proof)),
            Err(_) => false,
        }
    }

    /// The P2WPKH script this proof's key controls.
    pub fn script_pubkey(&self) -> ScriptPubKey {
        ScriptPubKey::p2wpkh(&self.public_key.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::group::random_scalar;
    use rand::rngs::OsRng;

    #[test]
    fn proof_binds_label_and_data() {
        let secret = random_scalar(&mut OsRng);
        let proof = OwnershipProof::generate(&secret, INPUT_OWNERSHIP_LABEL, b"round-1", &mut OsRng).unwrap();
        assert!(proof.verify(INPUT_OWNERSHIP_LABEL, b"round-1"));
        assert!(!proof.verify(INPUT_OWNERSHIP_LABEL, b"round-2"));
        assert!(!proof.verify(WITNESS_LABEL, b"round-1"));
    }

    #[test]
    fn swapped_key_fails() {
        let a = OwnershipProof::generate(&random_scalar(&mut OsRng), WITNESS_LABEL, b"m", &mut OsRng).unwrap();
        let b = OwnershipProof::generate(&random_scalar(&mut OsRng), WITNESS_LABEL, b"m", &mut OsRng).unwrap();
        let forged = OwnershipProof {
            public_key: b.public_key,
            proof: a.proof,
        };
        assert!(!forged.verify(WITNESS_LABEL, b"m"));
    }

    #[test]
    fn zero_secret_is_refused() {
        assert!(OwnershipProof::generate(&Scalar::ZERO, WITNESS_LABEL, b"m", &mut OsRng).is_err());
    }

    #[test]
    fn script_matches_key() {
        let secret = random_scalar(&mut OsRng);
        let proof = OwnershipProof::generate(&secret, WITNESS_LABEL, b"m", &mut OsRng).unwrap();
        let expected = ScriptPubKey::p2wpkh(&(GroupElement::generator() * secret).to_bytes());
        assert_eq!(proof.script_pubkey(), expected);
    }
}
