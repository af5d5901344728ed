//! Event-sourced multiparty transaction state.
//!
//! The event log is the source of truth; inputs, outputs and witnesses are a
//! materialized cache rebuilt by [`CoinjoinState::replay`]. Every operation
//! returns a new value. `im` collections make those copies share structure,
//! so handing a snapshot to a reader or slicing off a delta is cheap.
//!
//! Phase rules live in the types: only [`ConstructionState`] can gain
//! inputs or outputs and only [`SigningState`] can gain witnesses.

use super::parameters::RoundParameters;
use crate::core::{Coin, JoinTransaction, OutPoint, TxOut, Witness, DUST_THRESHOLD};
use crate::crypto::ownership::OwnershipProof;
use crate::error::{ErrorCode, ProtocolError};
use im::Vector;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateEvent {
    RoundCreated {
        parameters: RoundParameters,
    },
    InputAdded {
        coin: Coin,
        ownership_proof: OwnershipProof,
    },
    InputRemoved {
        outpoint: OutPoint,
    },
    OutputAdded {
        output: TxOut,
    },
    WitnessAdded {
        outpoint: OutPoint,
        witness: Witness,
    },
}

impl StateEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StateEvent::RoundCreated { .. } => "RoundCreated",
            StateEvent::InputAdded { .. } => "InputAdded",
            StateEvent::InputRemoved { .. } => "InputRemoved",
            StateEvent::OutputAdded { .. } => "OutputAdded",
            StateEvent::WitnessAdded { .. } => "WitnessAdded",
        }
    }
}

/// Replay and merge failures. These mean the log itself is corrupt or
/// the coordinator rewrote history, and are never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("event log must start with RoundCreated")]
    MissingRoundCreated,
    #[error("unexpected {event} event at position {position} in {phase:?} state")]
    UnexpectedEvent {
        event: &'static str,
        position: usize,
        phase: StatePhase,
    },
    #[error("input {0} added twice")]
    DuplicateInput(OutPoint),
    #[error("input {0} removed or witnessed but never added")]
    UnknownInput(OutPoint),
    #[error("delta starts at event {since} but only {order} events are known")]
    DeltaOutOfRange { since: usize, order: usize },
    #[error("delta rewrites event {0}")]
    HistoryRewritten(usize),
    #[error("cannot move a signing state back to construction")]
    PhaseRegression,
    #[error("delta changes the round's {0}")]
    HeaderChanged(&'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatePhase {
    Construction,
    Signing,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEntry {
    pub coin: Coin,
    pub ownership_proof: OwnershipProof,
}

// ── Construction ────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct ConstructionState {
    parameters: Arc<RoundParameters>,
    events: Vector<StateEvent>,
    inputs: Vector<InputEntry>,
    outputs: Vector<TxOut>,
}

impl PartialEq for ConstructionState {
    fn eq(&self, other: &Self) -> bool {
        self.events == other.events
    }
}

impl Eq for ConstructionState {}

impl ConstructionState {
    pub fn new(parameters: RoundParameters) -> Self {
        let mut events = Vector::new();
        events.push_back(StateEvent::RoundCreated {
            parameters: parameters.clone(),
        });
        Self {
            parameters: Arc::new(parameters),
            events,
            inputs: Vector::new(),
            outputs: Vector::new(),
        }
    }

    pub fn parameters(&self) -> &RoundParameters {
        &self.parameters
    }

    pub fn events(&self) -> &Vector<StateEvent> {
        &self.events
    }

    pub fn inputs(&self) -> &Vector<InputEntry> {
        &self.inputs
    }

    pub fn outputs(&self) -> &Vector<TxOut> {
        &self.outputs
    }

    pub fn contains_input(&self, outpoint: &OutPoint) -> bool {
        self.inputs.iter().any(|i| i.coin.outpoint == *outpoint)
    }

    pub fn add_input(&self, coin: Coin, ownership_proof: OwnershipProof) -> Result<Self, ProtocolError> {
        let p = &self.parameters;
        if !p.allows_input(coin.script_type()) {
            return Err(ProtocolError::new(
                ErrorCode::ScriptNotAllowed,
                format!("input {} has a script type this round does not accept", coin.outpoint),
            ));
        }
        if coin.amount() < p.min_registrable_amount {
            return Err(ProtocolError::new(
                ErrorCode::NotEnoughFunds,
                format!("{} sat is below the minimum {}", coin.amount(), p.min_registrable_amount),
            ));
        }
        if coin.amount() > p.max_registrable_amount {
            return Err(ProtocolError::new(
                ErrorCode::TooMuchFunds,
                format!("{} sat is above the maximum {}", coin.amount(), p.max_registrable_amount),
            ));
        }
        if self.contains_input(&coin.outpoint) {
            return Err(ProtocolError::new(
                ErrorCode::NonUniqueInputs,
                format!("input {} is already part of this transaction", coin.outpoint),
            ));
        }
        if self.inputs.len() >= p.max_input_count {
            return Err(ProtocolError::new(
                ErrorCode::TooManyInputs,
                format!("round is full ({} inputs)", p.max_input_count),
            ));
        }
        let mut next = self.clone();
        next.inputs.push_back(InputEntry {
            coin: coin.clone(),
            ownership_proof: ownership_proof.clone(),
        });
        next.events.push_back(StateEvent::InputAdded {
            coin,
            ownership_proof,
        });
        Ok(next)
    }

    pub fn remove_input(&self, outpoint: &OutPoint) -> Result<Self, ProtocolError> {
        let index = self
            .inputs
            .iter()
            .position(|i| i.coin.outpoint == *outpoint)
            .ok_or_else(|| {
                ProtocolError::new(ErrorCode::InputNotFound, format!("input {} is not registered", outpoint))
            })?;
        let mut next = self.clone();
        next.inputs.remove(index);
        next.events.push_back(StateEvent::InputRemoved { outpoint: *outpoint });
        Ok(next)
    }

    pub fn add_output(&self, output: TxOut) -> Result<Self, ProtocolError> {
        if !self.parameters.allows_output(&output.script_pubkey) {
            return Err(ProtocolError::new(
                ErrorCode::ScriptNotAllowed,
                format!("output script {} is not allowed", output.script_pubkey),
            ));
        }
        if output.value < DUST_THRESHOLD {
            return Err(ProtocolError::new(
                ErrorCode::NonStandardOutput,
                format!("output of {} sat is dust", output.value),
            ));
        }
        let mut next = self.clone();
        next.outputs.push_back(output.clone());
        next.events.push_back(StateEvent::OutputAdded { output });
        Ok(next)
    }

    pub fn input_total(&self) -> u64 {
        self.inputs.iter().map(|i| i.coin.amount()).sum()
    }

    pub fn output_total(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Freeze inputs and outputs.
    pub fn finalize(&self) -> SigningState {
        SigningState {
            parameters: self.parameters.clone(),
            events: self.events.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            witnesses: im::HashMap::new(),
        }
    }

    fn apply(&mut self, event: StateEvent, position: usize) -> Result<(), StateError> {
        match &event {
            StateEvent::InputAdded {
                coin,
                ownership_proof,
            } => {
                if self.contains_input(&coin.outpoint) {
                    return Err(StateError::DuplicateInput(coin.outpoint));
                }
                self.inputs.push_back(InputEntry {
                    coin: coin.clone(),
                    ownership_proof: ownership_proof.clone(),
                });
            }
            StateEvent::InputRemoved { outpoint } => {
                let index = self
                    .inputs
                    .iter()
                    .position(|i| i.coin.outpoint == *outpoint)
                    .ok_or(StateError::UnknownInput(*outpoint))?;
                self.inputs.remove(index);
            }
            StateEvent::OutputAdded { output } => self.outputs.push_back(output.clone()),
            StateEvent::RoundCreated { .. } | StateEvent::WitnessAdded { .. } => {
                return Err(StateError::UnexpectedEvent {
                    event: event.kind(),
                    position,
                    phase: StatePhase::Construction,
                })
            }
        }
        self.events.push_back(event);
        Ok(())
    }
}

// ── Signing ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct SigningState {
    parameters: Arc<RoundParameters>,
    events: Vector<StateEvent>,
    inputs: Vector<InputEntry>,
    outputs: Vector<TxOut>,
    witnesses: im::HashMap<OutPoint, Witness>,
}

impl PartialEq for SigningState {
    fn eq(&self, other: &Self) -> bool {
        self.events == other.events
    }
}

impl Eq for SigningState {}

impl SigningState {
    pub fn parameters(&self) -> &RoundParameters {
        &self.parameters
    }

    pub fn events(&self) -> &Vector<StateEvent> {
        &self.events
    }

    pub fn inputs(&self) -> &Vector<InputEntry> {
        &self.inputs
    }

    pub fn outputs(&self) -> &Vector<TxOut> {
        &self.outputs
    }

    pub fn witness(&self, outpoint: &OutPoint) -> Option<&Witness> {
        self.witnesses.get(outpoint)
    }

    pub fn is_fully_signed(&self) -> bool {
        self.inputs
            .iter()
            .all(|i| self.witnesses.contains_key(&i.coin.outpoint))
    }

    pub fn missing_witnesses(&self) -> Vec<OutPoint> {
        self.inputs
            .iter()
            .map(|i| i.coin.outpoint)
            .filter(|o| !self.witnesses.contains_key(o))
            .collect()
    }

    pub fn signed_inputs(&self) -> Vec<OutPoint> {
        self.inputs
            .iter()
            .map(|i| i.coin.outpoint)
            .filter(|o| self.witnesses.contains_key(o))
            .collect()
    }

    pub fn create_unsigned_transaction(&self) -> JoinTransaction {
        JoinTransaction::unsigned(self.inputs.iter().map(|i| &i.coin), self.outputs.iter())
    }

    pub fn create_transaction(&self) -> JoinTransaction {
        let mut tx = self.create_unsigned_transaction();
        for input in &mut tx.inputs {
            input.witness = self.witnesses.get(&input.previous_output).cloned();
        }
        tx
    }

    pub fn add_witness(&self, outpoint: OutPoint, witness: Witness) -> Result<Self, ProtocolError> {
        let entry = self
            .inputs
            .iter()
            .find(|i| i.coin.outpoint == outpoint)
            .ok_or_else(|| {
                ProtocolError::new(ErrorCode::InputNotFound, format!("input {} is not in the transaction", outpoint))
            })?;
        if self.witnesses.contains_key(&outpoint) {
            return Err(ProtocolError::new(
                ErrorCode::WitnessAlreadyProvided,
                format!("input {} is already signed", outpoint),
            ));
        }
        let sighash = self.create_unsigned_transaction().sighash();
        if !witness.validate(&entry.coin, &sighash) {
            return Err(ProtocolError::new(
                ErrorCode::WrongWitness,
                format!("witness for {} does not validate", outpoint),
            ));
        }
        let mut next = self.clone();
        next.witnesses.insert(outpoint, witness.clone());
        next.events.push_back(StateEvent::WitnessAdded { outpoint, witness });
        Ok(next)
    }

    fn apply(&mut self, event: StateEvent, position: usize) -> Result<(), StateError> {
        match &event {
            StateEvent::WitnessAdded { outpoint, witness } => {
                if !self.inputs.iter().any(|i| i.coin.outpoint == *outpoint) {
                    return Err(StateError::UnknownInput(*outpoint));
                }
                self.witnesses.insert(*outpoint, witness.clone());
            }
            _ => {
                return Err(StateError::UnexpectedEvent {
                    event: event.kind(),
                    position,
                    phase: StatePhase::Signing,
                })
            }
        }
        self.events.push_back(event);
        Ok(())
    }
}

// ── Either phase ────────────────────────────────────────────────────────

/// Events past a checkpoint, as served to polling clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDelta {
    pub phase: StatePhase,
    pub since: usize,
    pub events: Vector<StateEvent>,
}

impl StateDelta {
    /// Event count of the state this delta produces.
    pub fn order(&self) -> usize {
        self.since + self.events.len()
    }
}

#[derive(Clone, Debug)]
pub enum CoinjoinState {
    Construction(ConstructionState),
    Signing(SigningState),
}

impl PartialEq for CoinjoinState {
    fn eq(&self, other: &Self) -> bool {
        self.events() == other.events()
    }
}

impl Eq for CoinjoinState {}

impl From<ConstructionState> for CoinjoinState {
    fn from(s: ConstructionState) -> Self {
        CoinjoinState::Construction(s)
    }
}

impl From<SigningState> for CoinjoinState {
    fn from(s: SigningState) -> Self {
        CoinjoinState::Signing(s)
    }
}

impl CoinjoinState {
    pub fn phase(&self) -> StatePhase {
        match self {
            CoinjoinState::Construction(_) => StatePhase::Construction,
            CoinjoinState::Signing(_) => StatePhase::Signing,
        }
    }

    pub fn events(&self) -> &Vector<StateEvent> {
        match self {
            CoinjoinState::Construction(s) => s.events(),
            CoinjoinState::Signing(s) => s.events(),
        }
    }

    /// Number of events; the checkpoint clients send back.
    pub fn order(&self) -> usize {
        self.events().len()
    }

    pub fn parameters(&self) -> &RoundParameters {
        match self {
            CoinjoinState::Construction(s) => s.parameters(),
            CoinjoinState::Signing(s) => s.parameters(),
        }
    }

    pub fn inputs(&self) -> &Vector<InputEntry> {
        match self {
            CoinjoinState::Construction(s) => s.inputs(),
            CoinjoinState::Signing(s) => s.inputs(),
        }
    }

    pub fn outputs(&self) -> &Vector<TxOut> {
        match self {
            CoinjoinState::Construction(s) => s.outputs(),
            CoinjoinState::Signing(s) => s.outputs(),
        }
    }

    pub fn as_construction(&self) -> Option<&ConstructionState> {
        match self {
            CoinjoinState::Construction(s) => Some(s),
            CoinjoinState::Signing(_) => None,
        }
    }

    pub fn as_signing(&self) -> Option<&SigningState> {
        match self {
            CoinjoinState::Signing(s) => Some(s),
            CoinjoinState::Construction(_) => None,
        }
    }

    /// Events after `checkpoint`, or the whole log when the checkpoint is
    /// unknown or ahead of this state.
    pub fn get_state_since(&self, checkpoint: Option<usize>) -> StateDelta {
        let since = match checkpoint {
            Some(k) if k <= self.order() => k,
            _ => 0,
        };
        StateDelta {
            phase: self.phase(),
            since,
            events: self.events().clone().split_off(since),
        }
    }

    /// Rebuild a state from its event log.
    pub fn replay(
        events: impl IntoIterator<Item = StateEvent>,
        phase: StatePhase,
    ) -> Result<Self, StateError> {
        let mut events = events.into_iter();
        let parameters = match events.next() {
            Some(StateEvent::RoundCreated { parameters }) => parameters,
            _ => return Err(StateError::MissingRoundCreated),
        };
        let start = CoinjoinState::Construction(ConstructionState::new(parameters));
        start.advance(events, phase)
    }

    pub fn from_delta(delta: &StateDelta) -> Result<Self, StateError> {
        if delta.since != 0 {
            return Err(StateError::DeltaOutOfRange {
                since: delta.since,
                order: 0,
            });
        }
        Self::replay(delta.events.iter().cloned(), delta.phase)
    }

    /// Apply `events` on top of this state, finalizing when the log moves
    /// into the signing phase or `phase` says it has.
    fn advance(
        self,
        events: impl IntoIterator<Item = StateEvent>,
        phase: StatePhase,
    ) -> Result<Self, StateError> {
        if self.phase() == StatePhase::Signing && phase == StatePhase::Construction {
            return Err(StateError::PhaseRegression);
        }
        let mut position = self.order();
        let mut state = self;
        for event in events {
            state = match state {
                CoinjoinState::Construction(mut s) => {
                    if let (StateEvent::WitnessAdded { .. }, StatePhase::Signing) = (&event, phase) {
                        let mut signing = s.finalize();
                        signing.apply(event, position)?;
                        CoinjoinState::Signing(signing)
                    } else {
                        s.apply(event, position)?;
                        CoinjoinState::Construction(s)
                    }
                }
                CoinjoinState::Signing(mut s) => {
                    s.apply(event, position)?;
                    CoinjoinState::Signing(s)
                }
            };
            position += 1;
        }
        Ok(match (state, phase) {
            (CoinjoinState::Construction(s), StatePhase::Signing) => CoinjoinState::Signing(s.finalize()),
            (state, _) => state,
        })
    }

    /// Coordinator side: keep the first `delta.since` events of this state
    /// and append the delta.
    pub fn merge(&self, delta: &StateDelta) -> Result<Self, StateError> {
        let order = self.order();
        if delta.since > order {
            return Err(StateError::DeltaOutOfRange {
                since: delta.since,
                order,
            });
        }
        if delta.since == order {
            return self.clone().advance(delta.events.iter().cloned(), delta.phase);
        }
        let mut events = self.events().clone();
        events.truncate(delta.since);
        events.append(delta.events.clone());
        Self::replay(events, delta.phase)
    }

    /// Client side: apply a coordinator delta onto the cached state. Events
    /// the client already holds must match exactly, so applying the same
    /// delta twice is a no-op.
    pub fn merge_back(&self, delta: &StateDelta) -> Result<Self, StateError> {
        let order = self.order();
        if delta.since > order {
            return Err(StateError::DeltaOutOfRange {
                since: delta.since,
                order,
            });
        }
        let known = self.events();
        for (offset, event) in delta.events.iter().enumerate() {
            let index = delta.since + offset;
            if index >= order {
                break;
            }
            if known.get(index) != Some(event) {
                return Err(StateError::HistoryRewritten(index));
            }
        }
        let fresh = delta.events.iter().skip(order - delta.since).cloned();
        self.clone().advance(fresh, delta.phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::*;
    use crate::crypto::group::{random_scalar, GroupElement, Scalar};
    use crate::crypto::ownership::INPUT_OWNERSHIP_LABEL;
    use crate::round::parameters::test_support::parameters;
    use proptest::prelude::*;
    use rand::rngs::OsRng;

    fn owned_coin(name: &[u8], value: u64) -> (Scalar, Coin, OwnershipProof) {
        let secret = random_scalar(&mut OsRng);
        let pk = (GroupElement::generator() * secret).to_bytes();
        let coin = Coin::new(
            OutPoint::new(Txid(hash(name)), 0),
            TxOut {
                value,
                script_pubkey: ScriptPubKey::p2wpkh(&pk),
            },
        );
        let proof = OwnershipProof::generate(&secret, INPUT_OWNERSHIP_LABEL, b"round", &mut OsRng).unwrap();
        (secret, coin, proof)
    }

    fn output(value: u64, byte: u8) -> TxOut {
        TxOut {
            value,
            script_pubkey: ScriptPubKey::p2wpkh(&[byte; 33]),
        }
    }

    fn sample_state() -> (ConstructionState, Vec<(Scalar, Coin)>) {
        let mut state = ConstructionState::new(parameters());
        let mut keys = Vec::new();
        for name in [b"a", b"b", b"c"] {
            let (secret, coin, proof) = owned_coin(name, 50_000);
            state = state.add_input(coin.clone(), proof).unwrap();
            keys.push((secret, coin));
        }
        state = state.remove_input(&keys[1].1.outpoint).unwrap();
        state = state.add_output(output(40_000, 1)).unwrap();
        state = state.add_output(output(45_000, 2)).unwrap();
        (state, keys)
    }

    #[test]
    fn operations_return_new_values() {
        let empty = ConstructionState::new(parameters());
        let (_, coin, proof) = owned_coin(b"x", 10_000);
        let next = empty.add_input(coin, proof).unwrap();
        assert_eq!(empty.inputs().len(), 0);
        assert_eq!(empty.events().len(), 1);
        assert_eq!(next.inputs().len(), 1);
        assert_eq!(next.events().len(), 2);
    }

    #[test]
    fn replay_matches_incremental_construction() {
        let (state, _) = sample_state();
        let replayed = CoinjoinState::replay(state.events().clone(), StatePhase::Construction).unwrap();
        assert_eq!(replayed.inputs(), state.inputs());
        assert_eq!(replayed.outputs(), state.outputs());
        assert_eq!(replayed, CoinjoinState::from(state));
    }

    #[test]
    fn duplicate_and_oversized_inputs_are_rejected() {
        let state = ConstructionState::new(parameters());
        let (_, coin, proof) = owned_coin(b"dup", 10_000);
        let once = state.add_input(coin.clone(), proof.clone()).unwrap();
        assert_eq!(
            once.add_input(coin, proof).unwrap_err().code,
            ErrorCode::NonUniqueInputs
        );

        let (_, big, proof) = owned_coin(b"big", 20_000_000);
        assert_eq!(state.add_input(big, proof).unwrap_err().code, ErrorCode::TooMuchFunds);

        let (_, small, proof) = owned_coin(b"small", 100);
        assert_eq!(state.add_input(small, proof).unwrap_err().code, ErrorCode::NotEnoughFunds);
    }

    #[test]
    fn round_fills_up() {
        let mut state = ConstructionState::new(parameters());
        for i in 0..4u8 {
            let (_, coin, proof) = owned_coin(&[i], 10_000);
            state = state.add_input(coin, proof).unwrap();
        }
        let (_, coin, proof) = owned_coin(b"late", 10_000);
        assert_eq!(state.add_input(coin, proof).unwrap_err().code, ErrorCode::TooManyInputs);
    }

    #[test]
    fn output_rules() {
        let state = ConstructionState::new(parameters());
        assert_eq!(
            state.add_output(output(100, 1)).unwrap_err().code,
            ErrorCode::NonStandardOutput
        );
        let long = TxOut {
            value: 10_000,
            script_pubkey: ScriptPubKey(vec![0u8; 40]),
        };
        assert_eq!(state.add_output(long).unwrap_err().code, ErrorCode::ScriptNotAllowed);
    }

    #[test]
    fn signing_collects_witnesses() {
        let (state, keys) = sample_state();
        let signing = state.finalize();
        let sighash = signing.create_unsigned_transaction().sighash();
        assert_eq!(signing.missing_witnesses().len(), 2);

        let (secret, coin) = &keys[0];
        let witness = Witness::sign(secret, &sighash, &mut OsRng).unwrap();
        let signed = signing.add_witness(coin.outpoint, witness.clone()).unwrap();
        assert_eq!(
            signed.add_witness(coin.outpoint, witness).unwrap_err().code,
            ErrorCode::WitnessAlreadyProvided
        );

        let (_, removed) = &keys[1];
        let stray = Witness::sign(&keys[1].0, &sighash, &mut OsRng).unwrap();
        assert_eq!(
            signed.add_witness(removed.outpoint, stray).unwrap_err().code,
            ErrorCode::InputNotFound
        );

        let (secret, coin) = &keys[2];
        let wrong = Witness::sign(&keys[0].0, &sighash, &mut OsRng).unwrap();
        assert_eq!(
            signed.add_witness(coin.outpoint, wrong).unwrap_err().code,
            ErrorCode::WrongWitness
        );
        let witness = Witness::sign(secret, &sighash, &mut OsRng).unwrap();
        let done = signed.add_witness(coin.outpoint, witness).unwrap();
        assert!(done.is_fully_signed());
        assert!(done.create_transaction().is_fully_signed());
    }

    #[test]
    fn diff_merge_round_trip() {
        let (state, _) = sample_state();
        let full = CoinjoinState::from(state);
        for k in 0..=full.order() {
            let delta = full.get_state_since(Some(k));
            assert_eq!(delta.since, k);
            assert_eq!(full.merge(&delta).unwrap(), full);
        }
        let unknown = full.get_state_since(Some(full.order() + 10));
        assert_eq!(unknown.since, 0);
        assert_eq!(unknown.events.len(), full.order());
    }

    #[test]
    fn merge_back_is_idempotent() {
        let (state, keys) = sample_state();
        let server_before = CoinjoinState::from(state.clone());
        let client = server_before.clone();

        let (_, coin, proof) = owned_coin(b"d", 60_000);
        let server = CoinjoinState::from(state.add_input(coin, proof).unwrap());
        let delta = server.get_state_since(Some(client.order()));

        let once = client.merge_back(&delta).unwrap();
        let twice = once.merge_back(&delta).unwrap();
        assert_eq!(once, server);
        assert_eq!(twice, once);
        assert_eq!(twice.inputs().len(), keys.len());
    }

    #[test]
    fn merge_back_follows_finalization() {
        let (state, keys) = sample_state();
        let client = CoinjoinState::from(state.clone());
        let signing = state.finalize();
        let sighash = signing.create_unsigned_transaction().sighash();
        let witness = Witness::sign(&keys[0].0, &sighash, &mut OsRng).unwrap();
        let server = CoinjoinState::from(signing.add_witness(keys[0].1.outpoint, witness).unwrap());

        let merged = client.merge_back(&server.get_state_since(Some(client.order()))).unwrap();
        assert_eq!(merged.phase(), StatePhase::Signing);
        assert_eq!(merged, server);
        assert!(merged.as_signing().unwrap().witness(&keys[0].1.outpoint).is_some());
    }

    #[test]
    fn rewritten_history_is_detected() {
        let (state, _) = sample_state();
        let client = CoinjoinState::from(state.clone());
        let mut delta = client.get_state_since(Some(1));
        delta.events.set(0, StateEvent::OutputAdded { output: output(1_000, 9) });
        assert!(matches!(client.merge_back(&delta), Err(StateError::HistoryRewritten(1))));
    }

    #[test]
    fn witness_in_construction_is_fatal() {
        let (state, keys) = sample_state();
        let signing = state.finalize();
        let sighash = signing.create_unsigned_transaction().sighash();
        let witness = Witness::sign(&keys[0].0, &sighash, &mut OsRng).unwrap();
        let signed = signing.add_witness(keys[0].1.outpoint, witness).unwrap();

        let err = CoinjoinState::replay(signed.events().clone(), StatePhase::Construction).unwrap_err();
        assert!(matches!(err, StateError::UnexpectedEvent { event: "WitnessAdded", .. }));
    }

    #[test]
    fn input_after_witness_is_fatal() {
        let (state, keys) = sample_state();
        let signing = state.finalize();
        let sighash = signing.create_unsigned_transaction().sighash();
        let witness = Witness::sign(&keys[0].0, &sighash, &mut OsRng).unwrap();
        let signed = signing.add_witness(keys[0].1.outpoint, witness).unwrap();

        let mut events = signed.events().clone();
        events.push_back(StateEvent::InputRemoved {
            outpoint: keys[0].1.outpoint,
        });
        let err = CoinjoinState::replay(events, StatePhase::Signing).unwrap_err();
        assert!(matches!(err, StateError::UnexpectedEvent { event: "InputRemoved", .. }));
    }

    #[test]
    fn replay_requires_round_created() {
        assert_eq!(
            CoinjoinState::replay(Vec::new(), StatePhase::Construction).unwrap_err(),
            StateError::MissingRoundCreated
        );
    }

    #[test]
    fn delta_survives_json() {
        let (state, _) = sample_state();
        let full = CoinjoinState::from(state);
        let delta = full.get_state_since(None);
        let json = serde_json::to_string(&delta).unwrap();
        let back: StateDelta = serde_json::from_str(&json).unwrap();
        assert_eq!(CoinjoinState::from_delta(&back).unwrap(), full);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn any_prefix_catches_up(ops in proptest::collection::vec(0u8..3, 1..12), split in 1usize..16) {
            let mut state = ConstructionState::new(parameters());
            let mut owned = Vec::new();
            for (i, op) in ops.into_iter().enumerate() {
                state = match op {
                    0 => {
                        let (_, coin, proof) = owned_coin(&[i as u8, 0xaa], 20_000);
                        owned.push(coin.outpoint);
                        state.add_input(coin, proof).unwrap_or(state)
                    }
                    1 => match owned.pop() {
                        Some(outpoint) => state.remove_input(&outpoint).unwrap_or(state),
                        None => state,
                    },
                    _ => state.add_output(output(10_000 + i as u64, i as u8)).unwrap_or(state),
                };
            }

            let full = CoinjoinState::from(state);
            let replayed = CoinjoinState::replay(full.events().clone(), StatePhase::Construction).unwrap();
            prop_assert_eq!(&replayed, &full);
            prop_assert_eq!(replayed.inputs(), full.inputs());
            prop_assert_eq!(replayed.outputs(), full.outputs());

            let k = split.min(full.order());
            let prefix = CoinjoinState::replay(full.events().take(k), StatePhase::Construction).unwrap();
            let caught_up = prefix.merge_back(&full.get_state_since(Some(prefix.order()))).unwrap();
            prop_assert_eq!(&caught_up, &full);
            prop_assert_eq!(caught_up.inputs(), full.inputs());
            prop_assert_eq!(caught_up.outputs(), full.outputs());
            let again = caught_up.merge_back(&full.get_state_since(Some(k))).unwrap();
            prop_assert_eq!(&again, &full);
            prop_assert_eq!(again.inputs(), full.inputs());
            prop_assert_eq!(again.outputs(), full.outputs());
        }
    }
}
