//! The arena owns every live round.
//!
//! Each round sits behind its own async mutex, so registrations for one
//! round never wait on another. The rounds map is write-locked only to add
//! or drop a round. Outpoints are claimed in a single global index so a coin
//! can be in at most one round at a time. Phase changes run from [`Arena::step`],
//! which takes the same per-round lock as the request handlers but never
//! holds it across prison writes or a broadcast.

use super::max_amount::MaxSuggestedAmountProvider;
use super::parameters::RoundParameters;
use super::round::{Alice, Bob, EndRoundState, Phase, Round, RoundState};
use super::severity::{Disruption, SeverityPolicy};
use crate::broadcast::Broadcaster;
use crate::config::CoordinatorConfig;
use crate::core::types::*;
use crate::core::{Coin, JoinTransaction};
use crate::crypto::credentials::{CredentialIssuerSecretKey, RealCredentialsRequest};
use crate::crypto::ownership::INPUT_OWNERSHIP_LABEL;
use crate::error::{ErrorCode, ProtocolError};
use crate::metrics::Metrics;
use crate::prison::Prison;
use crate::rpc::types::*;
use crate::utxo::UtxoProvider;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;

type Result<T> = std::result::Result<T, ProtocolError>;
type RoundCell = Arc<tokio::sync::Mutex<Round>>;

/// Parent round and the outpoints allowed into its blame round.
type BlameSeed = (RoundId, HashSet<OutPoint>);

type Registered = Arc<Mutex<HashMap<OutPoint, RoundId>>>;

/// What a phase transition leaves to do once the round lock is released.
#[derive(Default)]
struct StepOutcome {
    punishments: Vec<(Disruption, Vec<OutPoint>)>,
    blame: Option<BlameSeed>,
    broadcast: Option<JoinTransaction>,
}

fn release(registered: &Mutex<HashMap<OutPoint, RoundId>>, round_id: RoundId, outpoints: &[OutPoint]) {
    let mut registered = registered.lock();
    for o in outpoints {
        if registered.get(o) == Some(&round_id) {
            registered.remove(o);
        }
    }
}

fn end_round(
    registered: &Mutex<HashMap<OutPoint, RoundId>>,
    metrics: &Metrics,
    round: &mut Round,
    end_state: EndRoundState,
    now: DateTime<Utc>,
) {
    round.end(end_state, now);
    release(registered, round.id(), &round.outpoints());
    if end_state.is_success() {
        metrics.inc_rounds_succeeded();
    } else {
        metrics.inc_rounds_failed();
    }
}

fn reject(code: ErrorCode, message: impl Into<String>) -> ProtocolError {
    ProtocolError::new(code, message)
}

fn require_phase(round: &Round, phase: Phase) -> Result<()> {
    if round.phase() != phase {
        return Err(reject(
            ErrorCode::WrongPhase,
            format!("round {} is in {:?}, expected {:?}", round.id(), round.phase(), phase),
        ));
    }
    Ok(())
}

fn require_zero(request: &RealCredentialsRequest) -> Result<()> {
    if request.delta != 0 {
        return Err(reject(ErrorCode::DeltaNotZero, "input registration requests must be zero-valued"));
    }
    if !request.is_null_presentation() {
        return Err(reject(
            ErrorCode::InvalidCredentials,
            "input registration cannot present credentials",
        ));
    }
    Ok(())
}

fn require_null_presentation(request: &RealCredentialsRequest) -> Result<()> {
    if !request.is_null_presentation() {
        return Err(reject(
            ErrorCode::InvalidCredentials,
            "connection confirmation cannot present credentials",
        ));
    }
    Ok(())
}

pub struct Arena {
    config: CoordinatorConfig,
    rounds: RwLock<HashMap<RoundId, RoundCell>>,
    registered: Registered,
    prison: Arc<Prison>,
    utxos: Arc<dyn UtxoProvider>,
    broadcaster: Arc<dyn Broadcaster>,
    severity: Arc<dyn SeverityPolicy>,
    max_suggested: Mutex<MaxSuggestedAmountProvider>,
    metrics: Metrics,
    broadcasts: Mutex<Vec<JoinHandle<()>>>,
}

impl Arena {
    pub fn new(
        config: CoordinatorConfig,
        prison: Arc<Prison>,
        utxos: Arc<dyn UtxoProvider>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        let max_suggested =
            MaxSuggestedAmountProvider::new(config.max_suggested_amount_base, config.max_registrable_amount);
        Self {
            severity: Arc::new(config.severity.clone()),
            config,
            rounds: RwLock::new(HashMap::new()),
            registered: Arc::new(Mutex::new(HashMap::new())),
            prison,
            utxos,
            broadcaster,
            max_suggested: Mutex::new(max_suggested),
            metrics: Metrics::new(),
            broadcasts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_severity_policy(mut self, policy: Arc<dyn SeverityPolicy>) -> Self {
        self.severity = policy;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn prison(&self) -> &Arc<Prison> {
        &self.prison
    }

    pub fn max_suggested_amount(&self) -> u64 {
        self.max_suggested.lock().max_suggested_amount()
    }

    pub fn round_count(&self) -> usize {
        self.rounds.read().len()
    }

    /// The round currently holding `outpoint`, if any.
    pub fn registered_round(&self, outpoint: &OutPoint) -> Option<RoundId> {
        self.registered.lock().get(outpoint).copied()
    }

    pub async fn round_state(&self, id: &RoundId) -> Option<RoundState> {
        let cell = self.rounds.read().get(id).cloned()?;
        let round = cell.lock().await;
        Some(round.state())
    }

    fn round(&self, id: &RoundId) -> Result<RoundCell> {
        self.rounds
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| reject(ErrorCode::RoundNotFound, format!("round {} not found", id)))
    }

    // ── Round lifecycle ─────────────────────────────────────────────────

    fn new_round(&self, now: DateTime<Utc>, blame: Option<BlameSeed>) -> Round {
        let c = &self.config;
        let (blame_of, whitelist) = match blame {
            Some((parent, whitelist)) => (Some(parent), whitelist),
            None => (None, HashSet::new()),
        };
        let is_blame = blame_of.is_some();
        let amount_key = CredentialIssuerSecretKey::random(&mut OsRng);
        let vsize_key = CredentialIssuerSecretKey::random(&mut OsRng);
        let parameters = RoundParameters {
            network: c.network,
            created_at: now,
            salt: rand::random(),
            blame_of,
            fee_rate: c.fee_rate(),
            coordination_fee_rate: c.coordination_fee(),
            max_suggested_amount: if is_blame {
                c.max_registrable_amount
            } else {
                self.max_suggested_amount()
            },
            min_input_count: c.min_input_count_by_round,
            max_input_count: c.max_input_count_by_round,
            min_registrable_amount: c.min_registrable_amount,
            max_registrable_amount: c.max_registrable_amount,
            max_vsize_allocation_per_alice: c.max_vsize_allocation_per_alice,
            allowed_input_types: c.allowed_input_types.clone(),
            allowed_output_types: c.allowed_output_types.clone(),
            input_registration_timeout: if is_blame {
                c.blame_input_registration_timeout
            } else {
                c.standard_input_registration_timeout
            },
            connection_confirmation_timeout: c.connection_confirmation_timeout,
            output_registration_timeout: c.output_registration_timeout,
            transaction_signing_timeout: c.transaction_signing_timeout,
            credential_count: c.credential_count,
            amount_credential_issuer_parameters: amount_key.compute_parameters(),
            vsize_credential_issuer_parameters: vsize_key.compute_parameters(),
        };
        Round::new(parameters, amount_key, vsize_key, whitelist)
    }

    fn insert_round(&self, round: Round) -> RoundId {
        let id = round.id();
        match round.parameters().blame_of {
            Some(parent) => {
                tracing::info!(
                    "Created blame round {} for {} ({} whitelisted inputs)",
                    id.short(),
                    parent.short(),
                    round.blame_whitelist().len()
                );
                self.metrics.inc_blame_rounds();
            }
            None => tracing::info!(
                "Created round {} (max suggested {} sat)",
                id.short(),
                round.parameters().max_suggested_amount
            ),
        }
        self.metrics.inc_rounds_created();
        self.rounds.write().insert(id, Arc::new(tokio::sync::Mutex::new(round)));
        id
    }

    fn release(&self, round_id: RoundId, outpoints: &[OutPoint]) {
        release(&self.registered, round_id, outpoints);
    }

    fn end_round(&self, round: &mut Round, end_state: EndRoundState, now: DateTime<Utc>) {
        end_round(&self.registered, &self.metrics, round, end_state, now);
    }

    async fn punish(&self, round_id: RoundId, disruption: Disruption, outpoints: Vec<OutPoint>, now: DateTime<Utc>) {
        if outpoints.is_empty() {
            return;
        }
        let Some(p) = self.severity.punishment(disruption) else {
            return;
        };
        match self.prison.ban_utxos(p.severity, now, p.noted, round_id, outpoints).await {
            Ok(n) => self.metrics.add_utxos_banned(n as u64),
            Err(e) => tracing::error!("Round {}: failed to record bans: {:#}", round_id.short(), e),
        }
    }

    // ── Participant operations ──────────────────────────────────────────

    pub async fn register_input(&self, req: InputRegistrationRequest) -> Result<InputRegistrationResponse> {
        let outpoint = req.outpoint;
        let result = self.register_input_inner(req).await;
        match &result {
            Ok(r) => {
                self.metrics.inc_inputs_registered();
                tracing::debug!("Registered {:?} as Alice {}", outpoint, r.alice_id.short());
            }
            Err(e) => {
                self.metrics.inc_inputs_rejected();
                tracing::debug!("Rejected input {:?}: {}", outpoint, e);
            }
        }
        result
    }

    async fn register_input_inner(&self, req: InputRegistrationRequest) -> Result<InputRegistrationResponse> {
        let cell = self.round(&req.round_id)?;
        let mut round = cell.lock().await;
        require_phase(&round, Phase::InputRegistration)?;

        let outpoint = req.outpoint;
        if let Some(other) = self.registered_round(&outpoint) {
            return Err(reject(
                ErrorCode::InputAlreadyRegistered,
                format!("input {} is already registered in round {}", outpoint, other),
            ));
        }

        if round.is_blame_round() {
            if !round.blame_whitelist().contains(&outpoint) {
                return Err(reject(
                    ErrorCode::InputNotWhitelisted,
                    format!("input {} did not sign the previous round", outpoint),
                ));
            }
        } else if let Some(ban) = self
            .prison
            .try_get_banned(&outpoint, !self.config.allow_noted_inputs)
            .await
        {
            let code = if ban.severity >= self.config.long_ban_severity {
                ErrorCode::InputLongBanned
            } else {
                ErrorCode::InputBanned
            };
            return Err(reject(
                code,
                format!(
                    "input {} is banned until {}",
                    outpoint,
                    ban.expires_at(self.prison.ban_duration())
                ),
            ));
        }

        let entry = self
            .utxos
            .get_utxo(&outpoint)
            .ok_or_else(|| reject(ErrorCode::InputSpent, format!("input {} is not unspent", outpoint)))?;
        if entry.confirmations < self.config.min_input_confirmations {
            return Err(reject(
                ErrorCode::InputUnconfirmed,
                format!("input {} has {} confirmations", outpoint, entry.confirmations),
            ));
        }
        let coin = Coin::new(outpoint, entry.txout);

        let params = round.parameters().clone();
        if !params.is_blame_round() && coin.amount() > params.max_suggested_amount {
            return Err(reject(
                ErrorCode::TooMuchFunds,
                format!(
                    "{} sat is above this round's suggested maximum {}",
                    coin.amount(),
                    params.max_suggested_amount
                ),
            ));
        }
        if req.ownership_proof.script_pubkey() != coin.txout.script_pubkey
            || !req.ownership_proof.verify(INPUT_OWNERSHIP_LABEL, round.id().as_bytes())
        {
            return Err(reject(ErrorCode::WrongOwnershipProof, "ownership proof does not verify"));
        }
        let input_vsize = coin.input_vsize().ok_or_else(|| {
            reject(ErrorCode::ScriptNotAllowed, format!("input {} has an unknown script", outpoint))
        })?;
        if input_vsize > params.max_vsize_allocation_per_alice {
            return Err(reject(
                ErrorCode::TooMuchVsize,
                format!("input needs {} vbytes, allocation is {}", input_vsize, params.max_vsize_allocation_per_alice),
            ));
        }
        if coin.effective_value(params.fee_rate, params.coordination_fee_rate).is_none() {
            return Err(reject(ErrorCode::NotEnoughFunds, "input does not cover its own fees"));
        }
        require_zero(&req.zero_amount_credential_request)?;
        require_zero(&req.zero_vsize_credential_request)?;

        let state = round
            .coinjoin_state
            .as_construction()
            .ok_or_else(|| reject(ErrorCode::WrongPhase, "transaction is already final"))?;
        let next_state = state.add_input(coin.clone(), req.ownership_proof.clone())?;
        let amount = round
            .amount_issuer
            .prepare(&req.zero_amount_credential_request, &mut OsRng)?;
        let vsize = round
            .vsize_issuer
            .prepare(&req.zero_vsize_credential_request, &mut OsRng)?;

        {
            let mut registered = self.registered.lock();
            if let Some(other) = registered.get(&outpoint) {
                return Err(reject(
                    ErrorCode::InputAlreadyRegistered,
                    format!("input {} is already registered in round {}", outpoint, other),
                ));
            }
            registered.insert(outpoint, round.id());
        }

        let amount_credentials = round.amount_issuer.commit(amount);
        let vsize_credentials = round.vsize_issuer.commit(vsize);
        round.coinjoin_state = next_state.into();
        let alice = Alice::new(coin, req.ownership_proof);
        let alice_id = alice.id;
        round.alices.insert(alice_id, alice);

        Ok(InputRegistrationResponse {
            alice_id,
            amount_credentials,
            vsize_credentials,
        })
    }

    pub async fn remove_input(&self, req: InputUnregistrationRequest) -> Result<()> {
        let cell = self.round(&req.round_id)?;
        let mut round = cell.lock().await;
        require_phase(&round, Phase::InputRegistration)?;
        let alice = round
            .remove_alice(&req.alice_id)
            .ok_or_else(|| reject(ErrorCode::AliceNotFound, format!("alice {} not found", req.alice_id)))?;
        self.release(round.id(), &[alice.outpoint()]);
        tracing::debug!("Alice {} left round {}", alice.id.short(), round.id().short());
        Ok(())
    }

    pub async fn confirm_connection(
        &self,
        req: ConnectionConfirmationRequest,
    ) -> Result<ConnectionConfirmationResponse> {
        let cell = self.round(&req.round_id)?;
        let mut round = cell.lock().await;
        require_phase(&round, Phase::ConnectionConfirmation)?;

        let params = round.parameters().clone();
        let alice = round
            .alice(&req.alice_id)
            .ok_or_else(|| reject(ErrorCode::AliceNotFound, format!("alice {} not found", req.alice_id)))?;
        if alice.confirmed {
            return Err(reject(ErrorCode::AliceAlreadyConfirmed, "connection already confirmed"));
        }
        let effective = alice
            .coin
            .effective_value(params.fee_rate, params.coordination_fee_rate)
            .ok_or_else(|| reject(ErrorCode::NotEnoughFunds, "input does not cover its own fees"))?;
        let input_vsize = alice
            .coin
            .input_vsize()
            .unwrap_or(params.max_vsize_allocation_per_alice);
        let vsize_allowance = params.max_vsize_allocation_per_alice.saturating_sub(input_vsize);

        require_null_presentation(&req.amount_credential_request)?;
        require_null_presentation(&req.vsize_credential_request)?;
        if req.amount_credential_request.delta != effective as i64 {
            return Err(reject(
                ErrorCode::IncorrectRequestedAmount,
                format!("expected {} sat, requested {}", effective, req.amount_credential_request.delta),
            ));
        }
        if req.vsize_credential_request.delta != vsize_allowance as i64 {
            return Err(reject(
                ErrorCode::IncorrectRequestedVsize,
                format!(
                    "expected {} vbytes, requested {}",
                    vsize_allowance, req.vsize_credential_request.delta
                ),
            ));
        }

        let amount = round.amount_issuer.prepare(&req.amount_credential_request, &mut OsRng)?;
        let vsize = round.vsize_issuer.prepare(&req.vsize_credential_request, &mut OsRng)?;
        let amount_credentials = round.amount_issuer.commit(amount);
        let vsize_credentials = round.vsize_issuer.commit(vsize);
        if let Some(alice) = round.alices.get_mut(&req.alice_id) {
            alice.confirmed = true;
        }
        Ok(ConnectionConfirmationResponse {
            amount_credentials,
            vsize_credentials,
        })
    }

    pub async fn register_output(&self, req: OutputRegistrationRequest) -> Result<OutputRegistrationResponse> {
        let cell = self.round(&req.round_id)?;
        let mut round = cell.lock().await;
        require_phase(&round, Phase::OutputRegistration)?;

        let params = round.parameters().clone();
        let script = req.script_pubkey;
        if !params.allows_output(&script) {
            return Err(reject(
                ErrorCode::ScriptNotAllowed,
                format!("output script {} is not allowed", script),
            ));
        }
        let output_vsize = script.output_vsize();
        let output_fee = params.fee_rate.fee(output_vsize);

        let amount_delta = req.amount_credential_request.delta;
        if amount_delta >= 0 {
            return Err(reject(
                ErrorCode::IncorrectRequestedAmount,
                "output registration must present more than it requests",
            ));
        }
        let spent = amount_delta.unsigned_abs();
        let value = spent.checked_sub(output_fee).ok_or_else(|| {
            reject(
                ErrorCode::NotEnoughFunds,
                format!("{} sat does not cover the {} sat output fee", spent, output_fee),
            )
        })?;
        if req.vsize_credential_request.delta != -(output_vsize as i64) {
            return Err(reject(
                ErrorCode::IncorrectRequestedVsize,
                format!("output needs exactly {} vbytes", output_vsize),
            ));
        }

        let output = TxOut {
            value,
            script_pubkey: script,
        };
        let state = round
            .coinjoin_state
            .as_construction()
            .ok_or_else(|| reject(ErrorCode::WrongPhase, "transaction is already final"))?;
        let next_state = state.add_output(output.clone())?;
        let amount = round.amount_issuer.prepare(&req.amount_credential_request, &mut OsRng)?;
        let vsize = round.vsize_issuer.prepare(&req.vsize_credential_request, &mut OsRng)?;

        let amount_credentials = round.amount_issuer.commit(amount);
        let vsize_credentials = round.vsize_issuer.commit(vsize);
        round.coinjoin_state = next_state.into();
        round.bobs.push(Bob { output });
        self.metrics.inc_outputs_registered();
        Ok(OutputRegistrationResponse {
            amount_credentials,
            vsize_credentials,
        })
    }

    pub async fn ready_to_sign(&self, req: ReadyToSignRequest) -> Result<()> {
        let cell = self.round(&req.round_id)?;
        let mut round = cell.lock().await;
        require_phase(&round, Phase::OutputRegistration)?;
        let alice = round
            .alices
            .get_mut(&req.alice_id)
            .ok_or_else(|| reject(ErrorCode::AliceNotFound, format!("alice {} not found", req.alice_id)))?;
        alice.ready_to_sign = true;
        Ok(())
    }

    /// Witnesses in one request are applied together or not at all.
    pub async fn sign_transaction(&self, req: TransactionSignaturesRequest) -> Result<()> {
        let cell = self.round(&req.round_id)?;
        let mut round = cell.lock().await;
        require_phase(&round, Phase::TransactionSigning)?;
        let mut state = round
            .coinjoin_state
            .as_signing()
            .cloned()
            .ok_or_else(|| reject(ErrorCode::WrongPhase, "transaction is not final"))?;
        for w in req.witnesses {
            state = state.add_witness(w.outpoint, w.witness)?;
        }
        round.coinjoin_state = state.into();
        Ok(())
    }

    /// Every round, trimmed to the events after the caller's checkpoint.
    pub async fn get_status(&self, req: RoundStateRequest) -> RoundStateResponse {
        let checkpoints: HashMap<RoundId, usize> = req
            .checkpoints
            .into_iter()
            .map(|c| (c.round_id, c.state_id))
            .collect();
        let cells: Vec<RoundCell> = self.rounds.read().values().cloned().collect();
        let mut round_states = Vec::with_capacity(cells.len());
        for cell in cells {
            let round = cell.lock().await;
            let checkpoint = checkpoints.get(&round.id()).copied();
            round_states.push(round.state().get_subset(checkpoint));
        }
        round_states.sort_by_key(|s| (s.input_registration_start, s.id));
        RoundStateResponse { round_states }
    }

    // ── Phase timer ─────────────────────────────────────────────────────

    /// Advance every round whose phase is done, drop expired rounds and make
    /// sure a standard round is open for registration.
    ///
    /// Bans are on disk when this returns. A fully signed transaction is
    /// broadcast in the background; see [`Arena::wait_for_broadcasts`].
    pub async fn step(&self, now: DateTime<Utc>) {
        let cells: Vec<RoundCell> = self.rounds.read().values().cloned().collect();
        let expiry = Duration::seconds(self.config.round_expiry_timeout as i64);
        let mut blame_seeds = Vec::new();
        let mut expired = Vec::new();
        let mut has_open_round = false;

        for cell in cells {
            let mut out = StepOutcome::default();
            let round_id = {
                let mut round = cell.lock().await;
                match round.phase() {
                    Phase::InputRegistration => self.step_input_registration(&mut round, now, &mut out),
                    Phase::ConnectionConfirmation => self.step_connection_confirmation(&mut round, now, &mut out),
                    Phase::OutputRegistration => self.step_output_registration(&mut round, now, &mut out),
                    Phase::TransactionSigning => self.step_transaction_signing(&mut round, now, &mut out),
                    Phase::Ended => {}
                }
                if round.phase() == Phase::InputRegistration && !round.is_blame_round() {
                    has_open_round = true;
                }
                if round.ended_at().is_some_and(|t| t + expiry <= now) {
                    expired.push(round.id());
                }
                round.id()
            };

            for (disruption, outpoints) in out.punishments {
                self.punish(round_id, disruption, outpoints, now).await;
            }
            blame_seeds.extend(out.blame);
            if let Some(tx) = out.broadcast {
                self.spawn_broadcast(cell, tx, now);
            }
        }

        for seed in blame_seeds {
            let round = self.new_round(now, Some(seed));
            self.insert_round(round);
        }
        if !expired.is_empty() {
            let mut rounds = self.rounds.write();
            for id in &expired {
                rounds.remove(id);
                tracing::debug!("Dropped expired round {}", id.short());
            }
        }
        if !has_open_round {
            let round = self.new_round(now, None);
            self.insert_round(round);
        }
    }

    fn spawn_broadcast(&self, cell: RoundCell, tx: JoinTransaction, now: DateTime<Utc>) {
        let broadcaster = self.broadcaster.clone();
        let registered = self.registered.clone();
        let metrics = self.metrics.clone();
        let handle = tokio::spawn(async move {
            let result = broadcaster.broadcast(&tx).await;
            let mut round = cell.lock().await;
            let outcome = match result {
                Ok(()) => {
                    tracing::info!(
                        "Round {}: {} broadcast {}",
                        round.id().short(),
                        broadcaster.name(),
                        tx.txid().short()
                    );
                    EndRoundState::TransactionBroadcasted
                }
                Err(e) => {
                    tracing::error!("Round {}: broadcast failed: {:#}", round.id().short(), e);
                    EndRoundState::TransactionBroadcastFailed
                }
            };
            end_round(&registered, &metrics, &mut round, outcome, now);
        });
        let mut broadcasts = self.broadcasts.lock();
        broadcasts.retain(|h| !h.is_finished());
        broadcasts.push(handle);
    }

    /// Wait until every broadcast started by [`Arena::step`] has ended its round.
    pub async fn wait_for_broadcasts(&self) {
        let handles = std::mem::take(&mut *self.broadcasts.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Broadcast task failed: {}", e);
            }
        }
    }

    /// Registered inputs that left the UTXO set.
    fn spent_inputs(&self, round: &Round) -> Vec<OutPoint> {
        round
            .outpoints()
            .into_iter()
            .filter(|o| !self.utxos.is_unspent(o))
            .collect()
    }

    /// Once credentials are out, a spent input kills the round. The rest may
    /// retry in a blame round.
    fn abort_on_spent_inputs(&self, round: &mut Round, now: DateTime<Utc>, out: &mut StepOutcome) -> bool {
        let spent = self.spent_inputs(round);
        if spent.is_empty() {
            return false;
        }
        let honest: HashSet<OutPoint> = round.outpoints().into_iter().filter(|o| !spent.contains(o)).collect();
        let phase = round.phase();
        tracing::warn!(
            "Round {}: {} input(s) spent during {:?}",
            round.id().short(),
            spent.len(),
            phase
        );
        out.punishments.push((Disruption::SpentDuringRound { phase }, spent));
        let parent = round.id();
        let min = round.parameters().min_input_count;
        self.end_round(round, EndRoundState::AbortedDoubleSpendingDetected, now);
        out.blame = (honest.len() >= min).then_some((parent, honest));
        true
    }

    fn step_input_registration(&self, round: &mut Round, now: DateTime<Utc>, out: &mut StepOutcome) {
        let spent: Vec<AliceId> = round
            .alices()
            .filter(|a| !self.utxos.is_unspent(&a.outpoint()))
            .map(|a| a.id)
            .collect();
        if !spent.is_empty() {
            let spent: Vec<OutPoint> = spent
                .iter()
                .filter_map(|id| round.remove_alice(id))
                .map(|a| a.outpoint())
                .collect();
            self.release(round.id(), &spent);
            tracing::warn!(
                "Round {}: ejected {} input(s) spent during registration",
                round.id().short(),
                spent.len()
            );
            let phase = round.phase();
            out.punishments.push((Disruption::SpentDuringRound { phase }, spent));
        }

        let count = round.alice_count();
        let min = round.parameters().min_input_count;
        let max = round.parameters().max_input_count;
        let is_blame = round.is_blame_round();
        let whitelist_done = is_blame && count == round.blame_whitelist().len();

        let ready = count >= max || (whitelist_done && count >= min) || (round.is_phase_expired(now) && count >= min);
        if ready {
            round.set_phase(Phase::ConnectionConfirmation, now);
            self.max_suggested.lock().step_max_suggested(is_blame);
        } else if round.is_phase_expired(now) {
            self.max_suggested.lock().reset_max_suggested(is_blame);
            self.end_round(round, EndRoundState::AbortedNotEnoughAlices, now);
        }
    }

    fn step_connection_confirmation(&self, round: &mut Round, now: DateTime<Utc>, out: &mut StepOutcome) {
        let all_confirmed = round.alices().all(|a| a.confirmed);
        if !all_confirmed && !round.is_phase_expired(now) {
            return;
        }

        let unconfirmed: Vec<AliceId> = round.alices().filter(|a| !a.confirmed).map(|a| a.id).collect();
        let dropped: Vec<OutPoint> = unconfirmed
            .iter()
            .filter_map(|id| round.remove_alice(id))
            .map(|a| a.outpoint())
            .collect();
        if !dropped.is_empty() {
            self.release(round.id(), &dropped);
            tracing::info!(
                "Round {}: {} Alice(s) failed to confirm",
                round.id().short(),
                dropped.len()
            );
            out.punishments.push((Disruption::FailedToConfirm, dropped));
        }

        if self.abort_on_spent_inputs(round, now, out) {
            return;
        }
        if round.alice_count() < round.parameters().min_input_count {
            self.end_round(round, EndRoundState::AbortedNotEnoughAlices, now);
        } else {
            round.set_phase(Phase::OutputRegistration, now);
        }
    }

    fn step_output_registration(&self, round: &mut Round, now: DateTime<Utc>, out: &mut StepOutcome) {
        if self.abort_on_spent_inputs(round, now, out) {
            return;
        }
        let all_ready = round.alice_count() > 0 && round.alices().all(|a| a.ready_to_sign);
        if !all_ready && !round.is_phase_expired(now) {
            return;
        }
        let Some(mut state) = round.coinjoin_state.as_construction().cloned() else {
            tracing::error!("Round {} reached output registration already final", round.id().short());
            self.end_round(round, EndRoundState::AbortedWithError, now);
            return;
        };

        let coordination_fee: u64 = {
            let rate = state.parameters().coordination_fee_rate;
            state.inputs().iter().map(|i| rate.fee(i.coin.amount())).sum()
        };
        if let Some(script) = &self.config.coordinator_script_pubkey {
            if coordination_fee >= DUST_THRESHOLD {
                let output = TxOut {
                    value: coordination_fee,
                    script_pubkey: script.clone(),
                };
                match state.add_output(output) {
                    Ok(next) => state = next,
                    Err(e) => tracing::warn!("Round {}: coordination fee output dropped: {}", round.id().short(), e),
                }
            }
        }

        if state.outputs().is_empty() {
            self.end_round(round, EndRoundState::AbortedNoOutputs, now);
            return;
        }
        if state.output_total() > state.input_total() {
            tracing::error!(
                "Round {}: outputs ({} sat) exceed inputs ({} sat)",
                round.id().short(),
                state.output_total(),
                state.input_total()
            );
            self.end_round(round, EndRoundState::AbortedWithError, now);
            return;
        }

        let signing = state.finalize();
        let tx = signing.create_unsigned_transaction();
        tracing::info!(
            "Round {}: transaction {} with {} inputs, {} outputs ({} registered), {} sat fee",
            round.id().short(),
            tx.txid().short(),
            tx.inputs.len(),
            tx.outputs.len(),
            round.bobs().len(),
            tx.fee()
        );
        round.coinjoin_state = signing.into();
        round.set_phase(Phase::TransactionSigning, now);
    }

    fn step_transaction_signing(&self, round: &mut Round, now: DateTime<Utc>, out: &mut StepOutcome) {
        if round.broadcast_pending {
            return;
        }
        let Some(signing) = round.coinjoin_state.as_signing().cloned() else {
            self.end_round(round, EndRoundState::AbortedWithError, now);
            return;
        };
        if self.abort_on_spent_inputs(round, now, out) {
            return;
        }
        if signing.is_fully_signed() {
            round.broadcast_pending = true;
            out.broadcast = Some(signing.create_transaction());
            return;
        }
        if !round.is_phase_expired(now) {
            return;
        }

        let missing = signing.missing_witnesses();
        tracing::info!(
            "Round {}: {} input(s) failed to sign",
            round.id().short(),
            missing.len()
        );
        out.punishments.push((Disruption::FailedToSign, missing));
        let signed: HashSet<OutPoint> = signing.signed_inputs().into_iter().collect();
        let parent = round.id();
        let min = round.parameters().min_input_count;
        self.end_round(round, EndRoundState::NotAllAlicesSign, now);
        out.blame = (signed.len() >= min).then_some((parent, signed));
    }
}
