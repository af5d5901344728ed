//! Sigma-protocol proofs of knowledge for linear relations over group elements,
//! made non-interactive with the Fiat-Shamir [`Transcript`].
//!
//! A [`Statement`] is a system of equations `P_i = Σ_j x_j · G_ij` sharing one
//! witness vector `x`. Proving runs three phases in strict order, enforced by
//! the prover's types:
//!
//! 1. every statement is absorbed into the transcript,
//! 2. synthetic nonces are derived and their public points absorbed,
//! 3. a single challenge `c` is drawn and each response is `k_j + c · x_j`.
//!
//! Verification replays the same phases and checks
//! `Σ_j s_j · G_ij == R_i + c · P_i` for every equation of every statement.

use super::group::{serde_scalars, GroupElement, Scalar};
use super::transcript::Transcript;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProofError {
    #[error("statement has no equations")]
    EmptyStatement,
    #[error("statement has no witness components")]
    EmptyWitness,
    #[error("equation {index} has {got} generators, expected {expected}")]
    GeneratorCount {
        index: usize,
        expected: usize,
        got: usize,
    },
    #[error("witness has {got} components, expected {expected}")]
    WitnessLength { expected: usize, got: usize },
    #[error("witness does not satisfy the statement")]
    Unsatisfied,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equation {
    pub public_point: GroupElement,
    pub generators: Vec<GroupElement>,
}

impl Equation {
    pub fn new(public_point: GroupElement, generators: Vec<GroupElement>) -> Self {
        Self {
            public_point,
            generators,
        }
    }

    fn combine(&self, scalars: &[Scalar]) -> GroupElement {
        self.generators
            .iter()
            .zip(scalars)
            .map(|(g, s)| *g * s)
            .sum()
    }

    fn holds(&self, witness: &[Scalar]) -> bool {
        self.combine(witness) == self.public_point
    }

    fn verify(&self, public_nonce: &GroupElement, challenge: &Scalar, responses: &[Scalar]) -> bool {
        self.combine(responses) == *public_nonce + self.public_point * challenge
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Statement {
    equations: Vec<Equation>,
}

impl Statement {
    pub fn new(equations: Vec<Equation>) -> Result<Self, ProofError> {
        let first = equations.first().ok_or(ProofError::EmptyStatement)?;
        let expected = first.generators.len();
        if expected == 0 {
            return Err(ProofError::EmptyWitness);
        }
        for (index, eq) in equations.iter().enumerate() {
            if eq.generators.len() != expected {
                return Err(ProofError::GeneratorCount {
                    index,
                    expected,
                    got: eq.generators.len(),
                });
            }
        }
        Ok(Self { equations })
    }

    pub fn equations(&self) -> &[Equation] {
        &self.equations
    }

    pub fn witness_len(&self) -> usize {
        self.equations[0].generators.len()
    }
}

/// A statement together with a witness known to satisfy it.
#[derive(Clone, Debug)]
pub struct Knowledge {
    statement: Statement,
    witness: Vec<Scalar>,
}

impl Knowledge {
    pub fn new(statement: Statement, witness: Vec<Scalar>) -> Result<Self, ProofError> {
        if witness.len() != statement.witness_len() {
            return Err(ProofError::WitnessLength {
                expected: statement.witness_len(),
                got: witness.len(),
            });
        }
        if !statement.equations.iter().all(|eq| eq.holds(&witness)) {
            return Err(ProofError::Unsatisfied);
        }
        Ok(Self { statement, witness })
    }

    pub fn statement(&self) -> &Statement {
        &self.statement
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub public_nonces: Vec<GroupElement>,
    #[serde(with = "serde_scalars")]
    pub responses: Vec<Scalar>,
}

// ── Prover ──────────────────────────────────────────────────────────────

pub struct Prover {
    transcript: Transcript,
    knowledge: Vec<Knowledge>,
}

pub struct StatementsCommitted {
    transcript: Transcript,
    knowledge: Vec<Knowledge>,
}

pub struct NoncesCommitted {
    transcript: Transcript,
    knowledge: Vec<Knowledge>,
    secret_nonces: Vec<Vec<Scalar>>,
    public_nonces: Vec<Vec<GroupElement>>,
}

impl Prover {
    pub fn new(transcript: Transcript, knowledge: Vec<Knowledge>) -> Self {
        Self {
            transcript,
            knowledge,
        }
    }

    pub fn commit_statements(mut self) -> StatementsCommitted {
        for k in &self.knowledge {
            self.transcript.commit_statement(&k.statement);
        }
        StatementsCommitted {
            transcript: self.transcript,
            knowledge: self.knowledge,
        }
    }
}

impl StatementsCommitted {
    pub fn commit_nonces<R: RngCore + CryptoRng>(mut self, rng: &mut R) -> NoncesCommitted {
        let secret_nonces: Vec<Vec<Scalar>> = self
            .knowledge
            .iter()
            .enumerate()
            .map(|(i, k)| self.transcript.generate_secret_nonces(i, &k.witness, rng))
            .collect();

        let public_nonces: Vec<Vec<GroupElement>> = self
            .knowledge
            .iter()
            .zip(&secret_nonces)
            .map(|(k, nonces)| {
                k.statement
                    .equations
                    .iter()
                    .map(|eq| eq.combine(nonces))
                    .collect()
            })
            .collect();

        for nonces in &public_nonces {
            self.transcript.commit_public_nonces(nonces);
        }

        NoncesCommitted {
            transcript: self.transcript,
            knowledge: self.knowledge,
            secret_nonces,
            public_nonces,
        }
    }
}

impl NoncesCommitted {
    pub fn respond(self) -> Vec<Proof> {
        let challenge = self.transcript.generate_challenge();
        self.knowledge
            .iter()
            .zip(self.secret_nonces)
            .zip(self.public_nonces)
            .map(|((k, secret), public_nonces)| Proof {
                public_nonces,
                responses: secret
                    .iter()
                    .zip(&k.witness)
                    .map(|(nonce, w)| *nonce + challenge * w)
                    .collect(),
            })
            .collect()
    }
}

// ── Verifier ────────────────────────────────────────────────────────────

pub struct Verifier<'a> {
    transcript: Transcript,
    statements: &'a [Statement],
    proofs: &'a [Proof],
}

pub struct VerifierStatementsCommitted<'a> {
    transcript: Transcript,
    statements: &'a [Statement],
    proofs: &'a [Proof],
}

pub struct VerifierNoncesCommitted<'a> {
    transcript: Transcript,
    statements: &'a [Statement],
    proofs: &'a [Proof],
}

impl<'a> Verifier<'a> {
    pub fn new(transcript: Transcript, statements: &'a [Statement], proofs: &'a [Proof]) -> Self {
        Self {
            transcript,
            statements,
            proofs,
        }
    }

    pub fn commit_statements(mut self) -> VerifierStatementsCommitted<'a> {
        for statement in self.statements {
            self.transcript.commit_statement(statement);
        }
        VerifierStatementsCommitted {
            transcript: self.transcript,
            statements: self.statements,
            proofs: self.proofs,
        }
    }
}

impl<'a> VerifierStatementsCommitted<'a> {
    /// `None` when the proofs do not have the shape of the statements.
    pub fn commit_nonces(mut self) -> Option<VerifierNoncesCommitted<'a>> {
        if self.proofs.len() != self.statements.len() {
            return None;
        }
        for (statement, proof) in self.statements.iter().zip(self.proofs) {
            if proof.public_nonces.len() != statement.equations.len()
                || proof.responses.len() != statement.witness_len()
                || proof.public_nonces.iter().any(GroupElement::is_identity)
            {
                return None;
            }
        }
        for proof in self.proofs {
            self.transcript.commit_public_nonces(&proof.public_nonces);
        }
        Some(VerifierNoncesCommitted {
            transcript: self.transcript,
            statements: self.statements,
            proofs: self.proofs,
        })
    }
}

impl VerifierNoncesCommitted<'_> {
    pub fn verify(self) -> bool {
        let challenge = self.transcript.generate_challenge();
        self.statements
            .iter()
            .zip(self.proofs)
            .all(|(statement, proof)| {
                statement
                    .equations
                    .iter()
                    .zip(&proof.public_nonces)
                    .all(|(eq, nonce)| eq.verify(nonce, &challenge, &proof.responses))
            })
    }
}

pub fn prove<R: RngCore + CryptoRng>(
    transcript: Transcript,
    knowledge: Vec<Knowledge>,
    rng: &mut R,
) -> Vec<Proof> {
    Prover::new(transcript, knowledge)
        .commit_statements()
        .commit_nonces(rng)
        .respond()
}

pub fn verify(transcript: Transcript, statements: &[Statement], proofs: &[Proof]) -> bool {
    Verifier::new(transcript, statements, proofs)
        .commit_statements()
        .commit_nonces()
        .map(|v| v.verify())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::group::{random_scalar, scalar_from_u64};
    use rand::rngs::OsRng;

    fn dlog_knowledge(secret: Scalar) -> Knowledge {
        let g = GroupElement::generator();
        let statement = Statement::new(vec![Equation::new(g * secret, vec![g])]).unwrap();
        Knowledge::new(statement, vec![secret]).unwrap()
    }

    fn two_equation_knowledge() -> Knowledge {
        let g = GroupElement::hash_to_curve(b"test-g");
        let h = GroupElement::hash_to_curve(b"test-h");
        let a = random_scalar(&mut OsRng);
        let b = random_scalar(&mut OsRng);
        let statement = Statement::new(vec![
            Equation::new(g * a + h * b, vec![g, h]),
            Equation::new(h * a, vec![h, GroupElement::IDENTITY]),
        ])
        .unwrap();
        Knowledge::new(statement, vec![a, b]).unwrap()
    }

    #[test]
    fn honest_proofs_verify() {
        let knowledge = vec![dlog_knowledge(scalar_from_u64(7)), two_equation_knowledge()];
        let statements: Vec<Statement> = knowledge.iter().map(|k| k.statement().clone()).collect();
        let proofs = prove(Transcript::new(b"test"), knowledge, &mut OsRng);
        assert!(verify(Transcript::new(b"test"), &statements, &proofs));
    }

    #[test]
    fn transcript_label_binds_the_proof() {
        let k = dlog_knowledge(scalar_from_u64(9));
        let statements = vec![k.statement().clone()];
        let proofs = prove(Transcript::new(b"a"), vec![k], &mut OsRng);
        assert!(!verify(Transcript::new(b"b"), &statements, &proofs));
    }

    #[test]
    fn tampered_response_fails() {
        let k = two_equation_knowledge();
        let statements = vec![k.statement().clone()];
        let mut proofs = prove(Transcript::new(b"t"), vec![k], &mut OsRng);
        proofs[0].responses[1] += Scalar::ONE;
        assert!(!verify(Transcript::new(b"t"), &statements, &proofs));
    }

    #[test]
    fn shape_mismatches_fail() {
        let k = two_equation_knowledge();
        let statements = vec![k.statement().clone()];
        let proofs = prove(Transcript::new(b"t"), vec![k], &mut OsRng);

        assert!(!verify(Transcript::new(b"t"), &statements, &[]));

        let mut short = proofs.clone();
        short[0].responses.pop();
        assert!(!verify(Transcript::new(b"t"), &statements, &short));

        let mut identity_nonce = proofs.clone();
        identity_nonce[0].public_nonces[0] = GroupElement::IDENTITY;
        assert!(!verify(Transcript::new(b"t"), &statements, &identity_nonce));
    }

    #[test]
    fn unsatisfied_knowledge_is_rejected() {
        let g = GroupElement::generator();
        let statement = Statement::new(vec![Equation::new(g * scalar_from_u64(3), vec![g])]).unwrap();
        assert_eq!(
            Knowledge::new(statement.clone(), vec![scalar_from_u64(4)]).unwrap_err(),
            ProofError::Unsatisfied
        );
        assert!(matches!(
            Knowledge::new(statement, vec![]),
            Err(ProofError::WitnessLength { .. })
        ));
    }

    #[test]
    fn ragged_statements_are_rejected() {
        let g = GroupElement::generator();
        let err = Statement::new(vec![
            Equation::new(g, vec![g]),
            Equation::new(g, vec![g, g]),
        ])
        .unwrap_err();
        assert!(matches!(err, ProofError::GeneratorCount { index: 1, .. }));
        assert_eq!(Statement::new(vec![]).unwrap_err(), ProofError::EmptyStatement);
    }

    #[test]
    fn proofs_survive_json() {
        let k = dlog_knowledge(scalar_from_u64(11));
        let statements = vec![k.statement().clone()];
        let proofs = prove(Transcript::new(b"j"), vec![k], &mut OsRng);
        let json = serde_json::to_string(&proofs).unwrap();
        let back: Vec<Proof> = serde_json::from_str(&json).unwrap();
        assert!(verify(Transcript::new(b"j"), &statements, &back));
    }
}
