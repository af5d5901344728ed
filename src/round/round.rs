use super::parameters::RoundParameters;
use super::state::{CoinjoinState, ConstructionState, StateDelta, StateError};
use crate::core::types::*;
use crate::core::Coin;
use crate::crypto::credentials::{CredentialIssuer, CredentialIssuerParameters, CredentialIssuerSecretKey};
use crate::crypto::ownership::OwnershipProof;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Round phases in the only order they may occur.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    InputRegistration,
    ConnectionConfirmation,
    OutputRegistration,
    TransactionSigning,
    Ended,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndRoundState {
    None,
    AbortedNotEnoughAlices,
    AbortedNoOutputs,
    AbortedDoubleSpendingDetected,
    AbortedWithError,
    NotAllAlicesSign,
    TransactionBroadcasted,
    TransactionBroadcastFailed,
}

impl EndRoundState {
    pub fn is_success(&self) -> bool {
        matches!(self, EndRoundState::TransactionBroadcasted)
    }
}

/// A registered input.
#[derive(Clone, Debug)]
pub struct Alice {
    pub id: AliceId,
    pub coin: Coin,
    pub ownership_proof: OwnershipProof,
    pub confirmed: bool,
    pub ready_to_sign: bool,
}

impl Alice {
    pub fn new(coin: Coin, ownership_proof: OwnershipProof) -> Self {
        Self {
            id: AliceId::random(),
            coin,
            ownership_proof,
            confirmed: false,
            ready_to_sign: false,
        }
    }

    pub fn outpoint(&self) -> OutPoint {
        self.coin.outpoint
    }
}

/// A registered output.
#[derive(Clone, Debug)]
pub struct Bob {
    pub output: TxOut,
}

/// What clients see of a round. The coordinator serves it as a
/// [`RoundStateDelta`]; clients cache the full form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundState<S = CoinjoinState> {
    pub id: RoundId,
    pub blame_of: Option<RoundId>,
    pub amount_credential_issuer_parameters: CredentialIssuerParameters,
    pub vsize_credential_issuer_parameters: CredentialIssuerParameters,
    pub phase: Phase,
    pub end_round_state: EndRoundState,
    pub input_registration_start: DateTime<Utc>,
    pub input_registration_timeout: u64,
    pub coinjoin_state: S,
}

pub type RoundStateDelta = RoundState<StateDelta>;

impl<S> RoundState<S> {
    fn with_state<T>(&self, coinjoin_state: T) -> RoundState<T> {
        RoundState {
            id: self.id,
            blame_of: self.blame_of,
            amount_credential_issuer_parameters: self.amount_credential_issuer_parameters,
            vsize_credential_issuer_parameters: self.vsize_credential_issuer_parameters,
            phase: self.phase,
            end_round_state: self.end_round_state,
            input_registration_start: self.input_registration_start,
            input_registration_timeout: self.input_registration_timeout,
            coinjoin_state,
        }
    }
}

impl RoundState {
    pub fn get_subset(&self, checkpoint: Option<usize>) -> RoundStateDelta {
        self.with_state(self.coinjoin_state.get_state_since(checkpoint))
    }

    pub fn from_delta(delta: &RoundStateDelta) -> Result<Self, StateError> {
        let state = CoinjoinState::from_delta(&delta.coinjoin_state)?;
        Ok(delta.with_state(state))
    }

    /// Apply a coordinator delta. The id, blame parent and issuer keys are
    /// fixed when a round is created and may never change afterwards.
    pub fn merge_back(&self, delta: &RoundStateDelta) -> Result<Self, StateError> {
        if delta.id != self.id {
            return Err(StateError::HeaderChanged("id"));
        }
        if delta.blame_of != self.blame_of {
            return Err(StateError::HeaderChanged("blame parent"));
        }
        if delta.amount_credential_issuer_parameters != self.amount_credential_issuer_parameters {
            return Err(StateError::HeaderChanged("amount issuer key"));
        }
        if delta.vsize_credential_issuer_parameters != self.vsize_credential_issuer_parameters {
            return Err(StateError::HeaderChanged("vsize issuer key"));
        }
        if delta.input_registration_timeout != self.input_registration_timeout {
            return Err(StateError::HeaderChanged("input registration timeout"));
        }
        let state = self.coinjoin_state.merge_back(&delta.coinjoin_state)?;
        Ok(delta.with_state(state))
    }

    /// The advertised id and issuer keys must be the ones committed to by
    /// the round's `RoundCreated` parameters.
    pub fn parameters_match(&self) -> bool {
        let p = self.coinjoin_state.parameters();
        p.round_id() == self.id
            && p.blame_of == self.blame_of
            && p.amount_credential_issuer_parameters == self.amount_credential_issuer_parameters
            && p.vsize_credential_issuer_parameters == self.vsize_credential_issuer_parameters
    }

    pub fn order(&self) -> usize {
        self.coinjoin_state.order()
    }
}

/// Coordinator-side round: phase bookkeeping, participants, credential
/// issuers and the current transaction state.
pub struct Round {
    id: RoundId,
    phase: Phase,
    end_round_state: EndRoundState,
    phase_started_at: DateTime<Utc>,
    input_registration_start: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    blame_whitelist: HashSet<OutPoint>,
    pub(super) coinjoin_state: CoinjoinState,
    pub(super) alices: HashMap<AliceId, Alice>,
    pub(super) bobs: Vec<Bob>,
    pub(super) amount_issuer: CredentialIssuer,
    pub(super) vsize_issuer: CredentialIssuer,
    /// The signed transaction was handed to the broadcaster.
    pub(super) broadcast_pending: bool,
}

impl Round {
    /// `parameters` must carry the public halves of the two keys.
    pub fn new(
        parameters: RoundParameters,
        amount_key: CredentialIssuerSecretKey,
        vsize_key: CredentialIssuerSecretKey,
        blame_whitelist: HashSet<OutPoint>,
    ) -> Self {
        let amount_issuer = CredentialIssuer::new(
            amount_key,
            parameters.credential_count,
            parameters.max_amount_credential_value(),
        );
        let vsize_issuer = CredentialIssuer::new(
            vsize_key,
            parameters.credential_count,
            parameters.max_vsize_credential_value(),
        );
        let created_at = parameters.created_at;
        Self {
            id: parameters.round_id(),
            phase: Phase::InputRegistration,
            end_round_state: EndRoundState::None,
            phase_started_at: created_at,
            input_registration_start: created_at,
            ended_at: None,
            blame_whitelist,
            coinjoin_state: ConstructionState::new(parameters).into(),
            alices: HashMap::new(),
            bobs: Vec::new(),
            amount_issuer,
            vsize_issuer,
            broadcast_pending: false,
        }
    }

    pub fn id(&self) -> RoundId {
        self.id
    }

    pub fn parameters(&self) -> &RoundParameters {
        self.coinjoin_state.parameters()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn end_round_state(&self) -> EndRoundState {
        self.end_round_state
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn is_blame_round(&self) -> bool {
        self.parameters().is_blame_round()
    }

    pub fn blame_whitelist(&self) -> &HashSet<OutPoint> {
        &self.blame_whitelist
    }

    pub fn coinjoin_state(&self) -> &CoinjoinState {
        &self.coinjoin_state
    }

    pub fn alices(&self) -> impl Iterator<Item = &Alice> {
        self.alices.values()
    }

    pub fn alice(&self, id: &AliceId) -> Option<&Alice> {
        self.alices.get(id)
    }

    pub fn alice_count(&self) -> usize {
        self.alices.len()
    }

    pub fn bobs(&self) -> &[Bob] {
        &self.bobs
    }

    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.alices.values().map(Alice::outpoint).collect()
    }

    pub fn phase_timeout(&self) -> Duration {
        let p = self.parameters();
        let secs = match self.phase {
            Phase::InputRegistration => p.input_registration_timeout,
            Phase::ConnectionConfirmation => p.connection_confirmation_timeout,
            Phase::OutputRegistration => p.output_registration_timeout,
            Phase::TransactionSigning => p.transaction_signing_timeout,
            Phase::Ended => 0,
        };
        Duration::seconds(secs as i64)
    }

    pub fn is_phase_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.phase_started_at + self.phase_timeout()
    }

    /// Move forward to `phase`. Returns false, changing nothing, on any
    /// attempt to stay or go back.
    pub fn set_phase(&mut self, phase: Phase, now: DateTime<Utc>) -> bool {
        if phase <= self.phase {
            tracing::error!(
                "Round {} refused phase change {:?} -> {:?}",
                self.id.short(),
                self.phase,
                phase
            );
            return false;
        }
        tracing::info!("Round {} entered {:?}", self.id.short(), phase);
        self.phase = phase;
        self.phase_started_at = now;
        true
    }

    pub fn end(&mut self, end_round_state: EndRoundState, now: DateTime<Utc>) {
        if self.set_phase(Phase::Ended, now) {
            self.end_round_state = end_round_state;
            self.ended_at = Some(now);
            tracing::info!("Round {} ended: {:?}", self.id.short(), end_round_state);
        }
    }

    /// Drop an Alice and, while still constructing, its input.
    pub(super) fn remove_alice(&mut self, id: &AliceId) -> Option<Alice> {
        let alice = self.alices.remove(id)?;
        if let CoinjoinState::Construction(s) = &self.coinjoin_state {
            match s.remove_input(&alice.outpoint()) {
                Ok(next) => self.coinjoin_state = next.into(),
                Err(e) => tracing::error!("Round {}: {}", self.id.short(), e),
            }
        }
        Some(alice)
    }

    pub fn state(&self) -> RoundState {
        RoundState {
            id: self.id,
            blame_of: self.parameters().blame_of,
            amount_credential_issuer_parameters: *self.amount_issuer.parameters(),
            vsize_credential_issuer_parameters: *self.vsize_issuer.parameters(),
            phase: self.phase,
            end_round_state: self.end_round_state,
            input_registration_start: self.input_registration_start,
            input_registration_timeout: self.parameters().input_registration_timeout,
            coinjoin_state: self.coinjoin_state.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round::parameters::test_support::parameters;
    use rand::rngs::OsRng;

    fn round() -> Round {
        let amount = CredentialIssuerSecretKey::random(&mut OsRng);
        let vsize = CredentialIssuerSecretKey::random(&mut OsRng);
        let mut p = parameters();
        p.amount_credential_issuer_parameters = amount.compute_parameters();
        p.vsize_credential_issuer_parameters = vsize.compute_parameters();
        Round::new(p, amount, vsize, HashSet::new())
    }

    #[test]
    fn phases_only_move_forward() {
        let mut r = round();
        let now = Utc::now();
        assert!(r.set_phase(Phase::OutputRegistration, now));
        assert!(!r.set_phase(Phase::ConnectionConfirmation, now));
        assert!(!r.set_phase(Phase::OutputRegistration, now));
        assert_eq!(r.phase(), Phase::OutputRegistration);
    }

    #[test]
    fn end_records_outcome_once() {
        let mut r = round();
        let now = Utc::now();
        r.end(EndRoundState::AbortedNotEnoughAlices, now);
        r.end(EndRoundState::TransactionBroadcasted, now);
        assert_eq!(r.phase(), Phase::Ended);
        assert_eq!(r.end_round_state(), EndRoundState::AbortedNotEnoughAlices);
        assert_eq!(r.ended_at(), Some(now));
    }

    #[test]
    fn phase_expiry_uses_configured_timeout() {
        let r = round();
        let start = r.parameters().created_at;
        assert!(!r.is_phase_expired(start + Duration::seconds(59)));
        assert!(r.is_phase_expired(start + Duration::seconds(60)));
    }

    #[test]
    fn published_state_matches_parameters() {
        let r = round();
        let state = r.state();
        assert_eq!(state.id, r.id());
        assert!(state.parameters_match());

        let delta = state.get_subset(None);
        let rebuilt = RoundState::from_delta(&delta).unwrap();
        assert_eq!(rebuilt, state);

        let mut lying = state.clone();
        lying.amount_credential_issuer_parameters = lying.vsize_credential_issuer_parameters;
        assert!(!lying.parameters_match());
    }

    #[test]
    fn merge_back_refuses_swapped_issuer_keys() {
        let r = round();
        let cached = RoundState::from_delta(&r.state().get_subset(None)).unwrap();
        let other = CredentialIssuerSecretKey::random(&mut OsRng).compute_parameters();

        let mut delta = r.state().get_subset(Some(cached.order()));
        delta.amount_credential_issuer_parameters = other;
        assert_eq!(
            cached.merge_back(&delta).unwrap_err(),
            StateError::HeaderChanged("amount issuer key")
        );

        let mut delta = r.state().get_subset(Some(cached.order()));
        delta.vsize_credential_issuer_parameters = other;
        assert_eq!(
            cached.merge_back(&delta).unwrap_err(),
            StateError::HeaderChanged("vsize issuer key")
        );

        let mut delta = r.state().get_subset(Some(cached.order()));
        delta.blame_of = Some(RoundId(hash(b"elsewhere")));
        assert!(cached.merge_back(&delta).is_err());

        let honest = r.state().get_subset(Some(cached.order()));
        let merged = cached.merge_back(&honest).unwrap();
        assert!(merged.parameters_match());
    }
}
