use super::types::*;
use crate::crypto::group::Scalar;
use crate::crypto::ownership::{OwnershipProof, WITNESS_LABEL};
use crate::crypto::zk::ProofError;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

/// An unspent output being offered to a round.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coin {
    pub outpoint: OutPoint,
    pub txout: TxOut,
}

impl Coin {
    pub fn new(outpoint: OutPoint, txout: TxOut) -> Self {
        Self { outpoint, txout }
    }

    pub fn amount(&self) -> u64 {
        self.txout.value
    }

    pub fn script_type(&self) -> Option<ScriptType> {
        self.txout.script_pubkey.script_type()
    }

    pub fn input_vsize(&self) -> Option<u64> {
        self.script_type().map(|t| t.input_vsize())
    }

    /// Amount left after the mining fee for this input and the coordination fee.
    /// `None` when the fees eat the whole coin or the script type is unknown.
    pub fn effective_value(&self, fee_rate: FeeRate, coordination: CoordinationFeeRate) -> Option<u64> {
        let vsize = self.input_vsize()?;
        let fees = fee_rate.fee(vsize).checked_add(coordination.fee(self.amount()))?;
        self.amount().checked_sub(fees).filter(|v| *v > 0)
    }
}

/// Input witness: a key-ownership proof over the transaction's sighash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    pub signature: OwnershipProof,
}

impl Witness {
    pub fn sign<R: RngCore + CryptoRng>(
        secret: &Scalar,
        sighash: &[u8; 32],
        rng: &mut R,
    ) -> Result<Self, ProofError> {
        Ok(Self {
            signature: OwnershipProof::generate(secret, WITNESS_LABEL, sighash, rng)?,
        })
    }

    /// The witness key must control the coin's script and the proof must
    /// verify against the sighash. Only P2WPKH can be checked here.
    pub fn validate(&self, coin: &Coin, sighash: &[u8; 32]) -> bool {
        coin.script_type() == Some(ScriptType::P2wpkh)
            && self.signature.script_pubkey() == coin.txout.script_pubkey
            && self.signature.verify(WITNESS_LABEL, sighash)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub value: u64,
    pub witness: Option<Witness>,
}

/// The joint transaction in canonical order: inputs by value descending then
/// outpoint, outputs by value descending then script.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinTransaction {
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
}

impl JoinTransaction {
    pub fn unsigned<'a>(coins: impl IntoIterator<Item = &'a Coin>, outputs: impl IntoIterator<Item = &'a TxOut>) -> Self {
        let mut inputs: Vec<TxIn> = coins
            .into_iter()
            .map(|c| TxIn {
                previous_output: c.outpoint,
                value: c.amount(),
                witness: None,
            })
            .collect();
        inputs.sort_by(|a, b| {
            b.value
                .cmp(&a.value)
                .then_with(|| a.previous_output.cmp(&b.previous_output))
        });

        let mut outputs: Vec<TxOut> = outputs.into_iter().cloned().collect();
        outputs.sort_by(|a, b| {
            b.value
                .cmp(&a.value)
                .then_with(|| a.script_pubkey.cmp(&b.script_pubkey))
        });

        Self { inputs, outputs }
    }

    fn stripped_bytes(&self) -> Vec<u8> {
        let inputs: Vec<(&OutPoint, u64)> = self
            .inputs
            .iter()
            .map(|i| (&i.previous_output, i.value))
            .collect();
        // Serialization of plain data cannot fail.
        bincode::serialize(&(inputs, &self.outputs)).unwrap_or_default()
    }

    pub fn txid(&self) -> Txid {
        Txid(hash(&self.stripped_bytes()))
    }

    /// Digest every input signs. Witnesses are excluded, so it is fixed
    /// once the input and output sets are frozen.
    pub fn sighash(&self) -> [u8; 32] {
        hash_concat(b"wabisabi/sighash", &self.stripped_bytes())
    }

    pub fn vsize(&self) -> u64 {
        let inputs: u64 = self
            .inputs
            .iter()
            .map(|_| ScriptType::P2wpkh.input_vsize())
            .sum();
        let outputs: u64 = self.outputs.iter().map(|o| o.script_pubkey.output_vsize()).sum();
        SHARED_OVERHEAD_VSIZE + inputs + outputs
    }

    pub fn input_total(&self) -> u64 {
        self.inputs.iter().map(|i| i.value).sum()
    }

    pub fn output_total(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    pub fn fee(&self) -> u64 {
        self.input_total().saturating_sub(self.output_total())
    }

    pub fn is_fully_signed(&self) -> bool {
        self.inputs.iter().all(|i| i.witness.is_some())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(bincode::serialize(self).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::group::{random_scalar, GroupElement};
    use rand::rngs::OsRng;

    fn coin(name: &[u8], value: u64) -> Coin {
        Coin::new(
            OutPoint::new(Txid(hash(name)), 0),
            TxOut {
                value,
                script_pubkey: ScriptPubKey::p2wpkh(&[2u8; 33]),
            },
        )
    }

    fn out(value: u64, byte: u8) -> TxOut {
        TxOut {
            value,
            script_pubkey: ScriptPubKey(vec![0x00, 0x14, byte, byte]),
        }
    }

    #[test]
    fn ordering_is_canonical() {
        let coins = [coin(b"a", 10), coin(b"b", 30), coin(b"c", 20)];
        let outputs = [out(5, 1), out(7, 2), out(5, 0)];
        let tx = JoinTransaction::unsigned(coins.iter(), outputs.iter());
        let values: Vec<u64> = tx.inputs.iter().map(|i| i.value).collect();
        assert_eq!(values, vec![30, 20, 10]);
        assert_eq!(tx.outputs[0].value, 7);
        assert_eq!(tx.outputs[1], out(5, 0));

        let reversed = JoinTransaction::unsigned(coins.iter().rev(), outputs.iter().rev());
        assert_eq!(tx.txid(), reversed.txid());
    }

    #[test]
    fn witness_validates_against_coin_and_sighash() {
        let secret = random_scalar(&mut OsRng);
        let pk = (GroupElement::generator() * secret).to_bytes();
        let owned = Coin::new(
            OutPoint::new(Txid(hash(b"w")), 1),
            TxOut {
                value: 1000,
                script_pubkey: ScriptPubKey::p2wpkh(&pk),
            },
        );
        let tx = JoinTransaction::unsigned([&owned], [&out(900, 1)]);
        let sighash = tx.sighash();
        let witness = Witness::sign(&secret, &sighash, &mut OsRng).unwrap();
        assert!(witness.validate(&owned, &sighash));
        assert!(!witness.validate(&owned, &[0u8; 32]));

        let other = coin(b"other", 1000);
        assert!(!witness.validate(&other, &sighash));
    }

    #[test]
    fn effective_value_subtracts_fees() {
        let c = coin(b"x", 100_000);
        let v = c
            .effective_value(FeeRate(2000), CoordinationFeeRate(3000))
            .unwrap();
        assert_eq!(v, 100_000 - 136 - 300);
        assert_eq!(coin(b"y", 100).effective_value(FeeRate(2000), CoordinationFeeRate(0)), None);
    }
}
