//! Fiat-Shamir hash chain.
//!
//! Everything absorbed is tagged and length-prefixed so two different
//! sequences of operations can never produce the same hasher input.

use super::group::{random_scalar, scalar_to_bytes, GroupElement, Scalar};
use super::zk::Statement;
use rand::{CryptoRng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

const PROTOCOL_TAG: &[u8] = b"wabisabi/transcript/v1";

#[derive(Clone)]
pub struct Transcript {
    hasher: blake3::Hasher,
}

impl Transcript {
    pub fn new(label: &[u8]) -> Self {
        let mut transcript = Self {
            hasher: blake3::Hasher::new(),
        };
        transcript.absorb(b"protocol", PROTOCOL_TAG);
        transcript.absorb(b"domain", label);
        transcript
    }

    fn absorb(&mut self, tag: &[u8], bytes: &[u8]) {
        self.hasher.update(&(tag.len() as u64).to_le_bytes());
        self.hasher.update(tag);
        self.hasher.update(&(bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
    }

    /// Bind context (round id, sighash, delta) into the transcript.
    pub fn commit_bytes(&mut self, tag: &[u8], bytes: &[u8]) {
        self.absorb(tag, bytes);
    }

    pub fn commit_statement(&mut self, statement: &Statement) {
        self.absorb(b"statement", &(statement.equations().len() as u64).to_le_bytes());
        for equation in statement.equations() {
            self.absorb(b"public-point", &equation.public_point.to_bytes());
            self.absorb(
                b"generators",
                &(equation.generators.len() as u64).to_le_bytes(),
            );
            for generator in &equation.generators {
                self.absorb(b"generator", &generator.to_bytes());
            }
        }
    }

    pub fn commit_public_nonces(&mut self, nonces: &[GroupElement]) {
        self.absorb(b"nonces", &(nonces.len() as u64).to_le_bytes());
        for nonce in nonces {
            self.absorb(b"public-nonce", &nonce.to_bytes());
        }
    }

    /// Synthetic nonces: a ChaCha20 stream keyed by the transcript state, the
    /// witness and fresh randomness, so a broken RNG alone cannot repeat a nonce.
    pub fn generate_secret_nonces<R: RngCore + CryptoRng>(
        &self,
        index: usize,
        witness: &[Scalar],
        rng: &mut R,
    ) -> Vec<Scalar> {
        let mut fork = self.clone();
        fork.absorb(b"synthetic-nonces", &(index as u64).to_le_bytes());
        for w in witness {
            fork.absorb(b"witness", &scalar_to_bytes(w));
        }
        let mut fresh = [0u8; 32];
        rng.fill_bytes(&mut fresh);
        fork.absorb(b"randomness", &fresh);

        let mut stream = ChaCha20Rng::from_seed(*fork.hasher.finalize().as_bytes());
        witness.iter().map(|_| random_scalar(&mut stream)).collect()
    }

    /// Challenge for the current state. The transcript itself is left untouched.
    pub fn generate_challenge(&self) -> Scalar {
        let mut fork = self.clone();
        fork.absorb(b"challenge", &[]);
        let mut stream = ChaCha20Rng::from_seed(*fork.hasher.finalize().as_bytes());
        random_scalar(&mut stream)
    }
}
