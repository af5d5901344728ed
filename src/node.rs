use crate::broadcast::{Broadcaster, FallbackBroadcaster, FileBroadcaster, HttpRelayBroadcaster};
use crate::client::{ClientError, CoordinatorApi};
use crate::config::CoordinatorConfig;
use crate::error::ProtocolError;
use crate::prison::Prison;
use crate::round::{Arena, RoundState};
use crate::rpc::types::*;
use crate::utxo::MemoryUtxoSet;
use crate::core::types::RoundId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};

pub const CONFIG_FILE: &str = "config.toml";
pub const PRISON_FILE: &str = "prison.txt";
pub const UTXO_FILE: &str = "utxos.json";
pub const BROADCAST_DIR: &str = "broadcast";

pub struct Coordinator {
    arena: Arc<Arena>,
    step_interval: Duration,
    data_dir: PathBuf,
}

#[derive(Clone)]
pub struct CoordinatorHandle {
    arena: Arc<Arena>,
}

impl Coordinator {
    /// Open the data directory, loading the prison and the UTXO snapshot
    /// kept there.
    pub async fn open(data_dir: PathBuf, config: CoordinatorConfig) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;
        config.validate()?;

        let utxos = Arc::new(MemoryUtxoSet::load_json(&data_dir.join(UTXO_FILE))?);
        tracing::info!("Loaded {} unspent outputs", utxos.len());

        let ban_duration = chrono::Duration::seconds(config.release_utxo_from_prison_after as i64);
        let prison = Prison::load(data_dir.join(PRISON_FILE), ban_duration, utxos.as_ref())
            .await
            .context("loading prison")?;
        tracing::info!(
            "Prison holds {} banned and {} noted inputs",
            prison.count_banned().await,
            prison.count_noted().await
        );

        let broadcaster = build_broadcaster(&config, &data_dir)?;
        let step_interval = Duration::from_millis(config.round_step_interval_ms);
        let arena = Arena::new(config, Arc::new(prison), utxos, broadcaster);

        Ok(Self {
            arena: Arc::new(arena),
            step_interval,
            data_dir,
        })
    }

    pub fn from_arena(arena: Arc<Arena>, step_interval: Duration, data_dir: PathBuf) -> Self {
        Self {
            arena,
            step_interval,
            data_dir,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn create_handle(&self) -> CoordinatorHandle {
        CoordinatorHandle::new(self.arena.clone())
    }

    pub async fn run(self) -> Result<()> {
        let mut step_interval = time::interval(self.step_interval);
        step_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut metrics_interval = time::interval(Duration::from_secs(30));

        tracing::info!("Coordinator running from {}", self.data_dir.display());

        loop {
            tokio::select! {
                _ = step_interval.tick() => {
                    self.arena.step(Utc::now()).await;
                }
                _ = metrics_interval.tick() => {
                    self.arena.metrics().report();
                }
            }
        }
    }
}

fn build_broadcaster(config: &CoordinatorConfig, data_dir: &Path) -> Result<Arc<dyn Broadcaster>> {
    let mut layers: Vec<Box<dyn Broadcaster>> = Vec::new();
    for endpoint in &config.broadcast_endpoints {
        layers.push(Box::new(HttpRelayBroadcaster::new(endpoint.clone())?));
    }
    layers.push(Box::new(FileBroadcaster::new(data_dir.join(BROADCAST_DIR))));
    Ok(Arc::new(FallbackBroadcaster::new(layers)))
}

impl CoordinatorHandle {
    pub fn new(arena: Arc<Arena>) -> Self {
        Self { arena }
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    pub fn round_count(&self) -> usize {
        self.arena.round_count()
    }

    pub async fn round_state(&self, id: &RoundId) -> Option<RoundState> {
        self.arena.round_state(id).await
    }

    pub async fn get_status(&self, req: RoundStateRequest) -> RoundStateResponse {
        self.arena.get_status(req).await
    }

    pub async fn register_input(&self, req: InputRegistrationRequest) -> Result<InputRegistrationResponse, ProtocolError> {
        self.arena.register_input(req).await
    }

    pub async fn remove_input(&self, req: InputUnregistrationRequest) -> Result<(), ProtocolError> {
        self.arena.remove_input(req).await
    }

    pub async fn confirm_connection(
        &self,
        req: ConnectionConfirmationRequest,
    ) -> Result<ConnectionConfirmationResponse, ProtocolError> {
        self.arena.confirm_connection(req).await
    }

    pub async fn register_output(&self, req: OutputRegistrationRequest) -> Result<OutputRegistrationResponse, ProtocolError> {
        self.arena.register_output(req).await
    }

    pub async fn ready_to_sign(&self, req: ReadyToSignRequest) -> Result<(), ProtocolError> {
        self.arena.ready_to_sign(req).await
    }

    pub async fn sign_transaction(&self, req: TransactionSignaturesRequest) -> Result<(), ProtocolError> {
        self.arena.sign_transaction(req).await
    }
}

/// In-process transport: clients talk to the arena without HTTP.
#[async_trait]
impl CoordinatorApi for CoordinatorHandle {
    async fn get_status(&self, req: RoundStateRequest) -> Result<RoundStateResponse, ClientError> {
        Ok(CoordinatorHandle::get_status(self, req).await)
    }

    async fn register_input(&self, req: InputRegistrationRequest) -> Result<InputRegistrationResponse, ClientError> {
        Ok(CoordinatorHandle::register_input(self, req).await?)
    }

    async fn remove_input(&self, req: InputUnregistrationRequest) -> Result<(), ClientError> {
        Ok(CoordinatorHandle::remove_input(self, req).await?)
    }

    async fn confirm_connection(
        &self,
        req: ConnectionConfirmationRequest,
    ) -> Result<ConnectionConfirmationResponse, ClientError> {
        Ok(CoordinatorHandle::confirm_connection(self, req).await?)
    }

    async fn register_output(&self, req: OutputRegistrationRequest) -> Result<OutputRegistrationResponse, ClientError> {
        Ok(CoordinatorHandle::register_output(self, req).await?)
    }

    async fn ready_to_sign(&self, req: ReadyToSignRequest) -> Result<(), ClientError> {
        Ok(CoordinatorHandle::ready_to_sign(self, req).await?)
    }

    async fn sign_transaction(&self, req: TransactionSignaturesRequest) -> Result<(), ClientError> {
        Ok(CoordinatorHandle::sign_transaction(self, req).await?)
    }
}
