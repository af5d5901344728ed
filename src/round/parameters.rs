use crate::core::types::*;
use crate::crypto::credentials::CredentialIssuerParameters;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Everything a client needs to check before joining a round. The round id
/// is a hash of these parameters, so the coordinator cannot change them
/// after announcing the round without changing its id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundParameters {
    pub network: Network,
    pub created_at: DateTime<Utc>,
    pub salt: [u8; 16],
    pub blame_of: Option<RoundId>,
    pub fee_rate: FeeRate,
    pub coordination_fee_rate: CoordinationFeeRate,
    pub max_suggested_amount: u64,
    pub min_input_count: usize,
    pub max_input_count: usize,
    pub min_registrable_amount: u64,
    pub max_registrable_amount: u64,
    pub max_vsize_allocation_per_alice: u64,
    pub allowed_input_types: Vec<ScriptType>,
    pub allowed_output_types: Vec<ScriptType>,
    pub input_registration_timeout: u64,
    pub connection_confirmation_timeout: u64,
    pub output_registration_timeout: u64,
    pub transaction_signing_timeout: u64,
    pub credential_count: usize,
    pub amount_credential_issuer_parameters: CredentialIssuerParameters,
    pub vsize_credential_issuer_parameters: CredentialIssuerParameters,
}

impl RoundParameters {
    pub fn round_id(&self) -> RoundId {
        let bytes = bincode::serialize(self).unwrap_or_default();
        RoundId(hash_concat(b"wabisabi/round-id", &bytes))
    }

    pub fn is_blame_round(&self) -> bool {
        self.blame_of.is_some()
    }

    pub fn allows_input(&self, script_type: Option<ScriptType>) -> bool {
        script_type.is_some_and(|t| self.allowed_input_types.contains(&t))
    }

    pub fn allows_output(&self, script: &ScriptPubKey) -> bool {
        script.len() <= MAX_SCRIPT_PUBKEY_LEN
            && script
                .script_type()
                .is_some_and(|t| self.allowed_output_types.contains(&t))
    }

    /// Largest value an amount credential may carry in this round.
    pub fn max_amount_credential_value(&self) -> u64 {
        self.max_registrable_amount
    }

    pub fn max_vsize_credential_value(&self) -> u64 {
        self.max_vsize_allocation_per_alice
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::parameters;
    use super::*;

    #[test]
    fn round_id_commits_to_parameters() {
        let p = parameters();
        assert_eq!(p.round_id(), p.clone().round_id());

        let mut changed = p.clone();
        changed.max_suggested_amount += 1;
        assert_ne!(p.round_id(), changed.round_id());
    }

    #[test]
    fn output_scripts_are_bounded_and_typed() {
        let p = parameters();
        assert!(p.allows_output(&ScriptPubKey::p2wpkh(&[3u8; 33])));
        assert!(!p.allows_output(&ScriptPubKey(vec![0x51; 34])));

        let mut p2pkh = vec![0x76, 0xa9, 0x14];
        p2pkh.extend_from_slice(&[1u8; 20]);
        p2pkh.extend_from_slice(&[0x88, 0xac]);
        assert!(!p.allows_output(&ScriptPubKey(p2pkh)));
    }
}
