//! Keeps a local copy of every round the coordinator publishes and wakes
//! workflows up when a round reaches the state they wait for.
//!
//! One task owns the cache. Polls and awaiter bookkeeping run through its
//! message queue, so the cache itself needs no lock. Callers block only on
//! their own oneshot, and cancelling one awaiter leaves the others and the
//! poll loop alone.

use super::api::{CoordinatorApi, REQUEST_TIMEOUT};
use super::ClientError;
use crate::core::types::RoundId;
use crate::round::{Phase, RoundState};
use crate::rpc::types::{RoundStateCheckpoint, RoundStateRequest, RoundStateResponse};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_PERIOD: Duration = Duration::from_secs(15);

type Predicate = Box<dyn Fn(&RoundState) -> bool + Send>;
type Reply = oneshot::Sender<Result<RoundState, ClientError>>;

enum Command {
    CreateAwaiter {
        id: u64,
        round: Option<RoundId>,
        predicate: Predicate,
        reply: Reply,
    },
    Cancel { id: u64 },
    Poll,
}

struct Awaiter {
    id: u64,
    /// Set when the awaiter waits on one known round.
    round: Option<RoundId>,
    predicate: Predicate,
    reply: Reply,
}

/// A round the coordinator misreported, and what it claimed when the claim
/// could be decoded at all.
struct Violation {
    round: RoundId,
    claimed: Option<RoundState>,
    message: String,
}

#[derive(Default)]
struct RoundsState {
    rounds: HashMap<RoundId, RoundState>,
    awaiters: Vec<Awaiter>,
}

impl RoundsState {
    fn checkpoints(&self) -> RoundStateRequest {
        RoundStateRequest {
            checkpoints: self
                .rounds
                .values()
                .map(|r| RoundStateCheckpoint {
                    round_id: r.id,
                    state_id: r.order(),
                })
                .collect(),
        }
    }

    /// Merge a status answer. Rounds the coordinator stopped reporting are
    /// forgotten, and so are rounds it misreported.
    fn apply(&mut self, response: RoundStateResponse) -> Vec<Violation> {
        let mut reported = HashSet::new();
        let mut violations = Vec::new();
        for delta in response.round_states {
            reported.insert(delta.id);
            let merged = match self.rounds.get(&delta.id) {
                Some(known) => known.merge_back(&delta),
                None => RoundState::from_delta(&delta),
            };
            let violation = match merged {
                Ok(state) if state.parameters_match() => {
                    self.rounds.insert(state.id, state);
                    continue;
                }
                Ok(state) => Violation {
                    round: delta.id,
                    message: format!(
                        "round {} advertises parameters it was not created with",
                        delta.id.short()
                    ),
                    claimed: Some(state),
                },
                Err(e) => Violation {
                    round: delta.id,
                    message: format!("round {}: {}", delta.id.short(), e),
                    claimed: None,
                },
            };
            self.rounds.remove(&delta.id);
            violations.push(violation);
        }
        self.rounds.retain(|id, _| reported.contains(id));
        violations
    }

    fn sorted_rounds(&self) -> Vec<&RoundState> {
        let mut rounds: Vec<&RoundState> = self.rounds.values().collect();
        rounds.sort_by_key(|r| (r.input_registration_start, r.id));
        rounds
    }

    fn find(&self, predicate: &Predicate) -> Option<RoundState> {
        self.sorted_rounds().into_iter().find(|r| predicate(*r)).cloned()
    }

    fn resolve_awaiters(&mut self) {
        let pending = std::mem::take(&mut self.awaiters);
        for awaiter in pending {
            if awaiter.reply.is_closed() {
                continue;
            }
            match self.find(&awaiter.predicate) {
                Some(state) => {
                    let _ = awaiter.reply.send(Ok(state));
                }
                None => self.awaiters.push(awaiter),
            }
        }
    }

    /// Fail awaiters bound to the misreported round, and those whose
    /// predicate the bogus claim would have satisfied.
    fn fail_waiting_on(&mut self, violation: &Violation) {
        let pending = std::mem::take(&mut self.awaiters);
        for awaiter in pending {
            let bound = awaiter.round == Some(violation.round);
            let fooled = violation.claimed.as_ref().is_some_and(|c| (awaiter.predicate)(c));
            if bound || fooled {
                let _ = awaiter
                    .reply
                    .send(Err(ClientError::ProtocolViolation(violation.message.clone())));
            } else {
                self.awaiters.push(awaiter);
            }
        }
    }

    fn fail_all(&mut self, make: impl Fn() -> ClientError) {
        for awaiter in self.awaiters.drain(..) {
            let _ = awaiter.reply.send(Err(make()));
        }
    }
}

#[derive(Clone)]
pub struct RoundStateUpdater {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    shutdown: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RoundStateUpdater {
    pub fn start(api: Arc<dyn CoordinatorApi>, period: Duration) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(api, period, rx, shutdown.clone()));
        Self {
            commands,
            next_id: Arc::new(AtomicU64::new(0)),
            shutdown,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Resolves with the first cached round matching `predicate`, now or
    /// after a later poll. Cancelling `cancel` fails only this call.
    pub async fn create_round_awaiter<F>(&self, predicate: F, cancel: CancellationToken) -> Result<RoundState, ClientError>
    where
        F: Fn(&RoundState) -> bool + Send + 'static,
    {
        self.await_round(None, Box::new(predicate), cancel).await
    }

    async fn await_round(
        &self,
        round: Option<RoundId>,
        predicate: Predicate,
        cancel: CancellationToken,
    ) -> Result<RoundState, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::CreateAwaiter {
                id,
                round,
                predicate,
                reply,
            })
            .map_err(|_| ClientError::Stopped)?;
        tokio::select! {
            result = rx => result.unwrap_or(Err(ClientError::Stopped)),
            _ = cancel.cancelled() => {
                let _ = self.commands.send(Command::Cancel { id });
                Err(ClientError::Cancelled)
            }
        }
    }

    /// Waits until `round_id` reaches `phase`. A round that ends first fails
    /// the wait with its end state.
    pub async fn create_round_awaiter_for_phase(
        &self,
        round_id: RoundId,
        phase: Phase,
        cancel: CancellationToken,
    ) -> Result<RoundState, ClientError> {
        let state = self
            .await_round(
                Some(round_id),
                Box::new(move |r| r.id == round_id && r.phase >= phase),
                cancel,
            )
            .await?;
        if state.phase != phase && state.phase == Phase::Ended {
            return Err(ClientError::RoundEnded(state.end_round_state));
        }
        Ok(state)
    }

    /// Poll now instead of waiting for the next tick.
    pub fn trigger_round_update(&self) {
        let _ = self.commands.send(Command::Poll);
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Stop polling; pending awaiters fail with [`ClientError::Stopped`].
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("Round state updater task failed: {}", e);
            }
        }
    }
}

async fn run(
    api: Arc<dyn CoordinatorApi>,
    period: Duration,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
) {
    let mut state = RoundsState::default();
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => poll(&*api, &mut state, &shutdown).await,
            cmd = commands.recv() => match cmd {
                Some(Command::CreateAwaiter { id, round, predicate, reply }) => match state.find(&predicate) {
                    Some(found) => {
                        let _ = reply.send(Ok(found));
                    }
                    None => state.awaiters.push(Awaiter { id, round, predicate, reply }),
                },
                Some(Command::Cancel { id }) => {
                    if let Some(pos) = state.awaiters.iter().position(|a| a.id == id) {
                        let awaiter = state.awaiters.remove(pos);
                        let _ = awaiter.reply.send(Err(ClientError::Cancelled));
                    }
                }
                Some(Command::Poll) => poll(&*api, &mut state, &shutdown).await,
                None => break,
            },
        }
    }

    state.fail_all(|| ClientError::Stopped);
    tracing::debug!("Round state updater stopped");
}

async fn poll(api: &dyn CoordinatorApi, state: &mut RoundsState, shutdown: &CancellationToken) {
    let request = state.checkpoints();
    let response = tokio::select! {
        _ = shutdown.cancelled() => return,
        r = time::timeout(REQUEST_TIMEOUT, api.get_status(request)) => r,
    };
    match response {
        Err(_) => tracing::warn!("Round status request timed out"),
        Ok(Err(e)) => tracing::warn!("Round status request failed: {}", e),
        Ok(Ok(response)) => {
            for violation in state.apply(response) {
                tracing::error!("coordinator protocol violation: {}", violation.message);
                state.fail_waiting_on(&violation);
            }
            state.resolve_awaiters();
        }
    }
}
