use crate::core::types::*;
use crate::round::severity::SeverityConfig;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Coordinator settings, persisted as `config.toml` in the data directory.
/// Durations are whole seconds unless the field name says otherwise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub network: Network,
    pub rpc_port: u16,

    pub standard_input_registration_timeout: u64,
    pub blame_input_registration_timeout: u64,
    pub connection_confirmation_timeout: u64,
    pub output_registration_timeout: u64,
    pub transaction_signing_timeout: u64,
    pub round_expiry_timeout: u64,
    pub round_step_interval_ms: u64,

    pub min_input_count_by_round: usize,
    pub max_input_count_by_round: usize,
    pub min_registrable_amount: u64,
    pub max_registrable_amount: u64,
    pub max_suggested_amount_base: u64,
    pub max_vsize_allocation_per_alice: u64,
    pub min_input_confirmations: u32,

    pub fee_rate_sat_per_kvb: u64,
    /// Parts per million of each input's value.
    pub coordination_fee_rate: u32,
    /// Receives the collected coordination fee; left to miners when unset.
    pub coordinator_script_pubkey: Option<ScriptPubKey>,

    pub credential_count: usize,
    pub allowed_input_types: Vec<ScriptType>,
    pub allowed_output_types: Vec<ScriptType>,

    pub release_utxo_from_prison_after: u64,
    pub allow_noted_inputs: bool,
    /// Bans at or above this severity are reported as long bans.
    pub long_ban_severity: u32,
    pub severity: SeverityConfig,

    /// Relay URLs tried in order before the on-disk fallback.
    pub broadcast_endpoints: Vec<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            network: Network::Regtest,
            rpc_port: 37127,
            standard_input_registration_timeout: 3600,
            blame_input_registration_timeout: 180,
            connection_confirmation_timeout: 60,
            output_registration_timeout: 60,
            transaction_signing_timeout: 60,
            round_expiry_timeout: 300,
            round_step_interval_ms: 1000,
            min_input_count_by_round: 5,
            max_input_count_by_round: 100,
            min_registrable_amount: 5_000,
            max_registrable_amount: 43_000_000_000,
            max_suggested_amount_base: 100_000,
            max_vsize_allocation_per_alice: 255,
            min_input_confirmations: 1,
            fee_rate_sat_per_kvb: 2_000,
            coordination_fee_rate: 0,
            coordinator_script_pubkey: None,
            credential_count: 2,
            allowed_input_types: vec![ScriptType::P2wpkh],
            allowed_output_types: vec![ScriptType::P2wpkh, ScriptType::P2sh, ScriptType::P2pkh],
            release_utxo_from_prison_after: 24 * 3600,
            allow_noted_inputs: true,
            long_ban_severity: 5,
            severity: SeverityConfig::default(),
            broadcast_endpoints: Vec::new(),
        }
    }
}

impl CoordinatorConfig {
    /// Read `path`, or write the defaults there when it does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: Self = toml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            config.validate()?;
            return Ok(config);
        }
        let config = Self::default();
        config.save(path)?;
        tracing::info!("Wrote default coordinator config to {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_input_count_by_round == 0 {
            bail!("min_input_count_by_round must be at least 1");
        }
        if self.min_input_count_by_round > self.max_input_count_by_round {
            bail!(
                "min_input_count_by_round ({}) exceeds max_input_count_by_round ({})",
                self.min_input_count_by_round,
                self.max_input_count_by_round
            );
        }
        if self.max_registrable_amount < self.min_registrable_amount {
            bail!("max_registrable_amount is below min_registrable_amount");
        }
        if self.credential_count == 0 {
            bail!("credential_count must be at least 1");
        }
        if self.allowed_input_types.is_empty() || self.allowed_output_types.is_empty() {
            bail!("at least one input and one output script type must be allowed");
        }
        if self.max_vsize_allocation_per_alice
            < self
                .allowed_input_types
                .iter()
                .map(|t| t.input_vsize())
                .min()
                .unwrap_or(0)
        {
            bail!("max_vsize_allocation_per_alice cannot fit a single input");
        }
        if self.round_step_interval_ms == 0 {
            bail!("round_step_interval_ms must be positive");
        }
        if let Some(script) = &self.coordinator_script_pubkey {
            if script.script_type().is_none() {
                bail!("coordinator_script_pubkey is not a standard script");
            }
        }
        Ok(())
    }

    pub fn fee_rate(&self) -> FeeRate {
        FeeRate(self.fee_rate_sat_per_kvb)
    }

    pub fn coordination_fee(&self) -> CoordinationFeeRate {
        CoordinationFeeRate(self.coordination_fee_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_or_create_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let created = CoordinatorConfig::load_or_create(&path).unwrap();
        assert!(path.exists());
        let loaded = CoordinatorConfig::load_or_create(&path).unwrap();
        assert_eq!(created, loaded);
    }

    #[test]
    fn partial_files_fall_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "min_input_count_by_round = 3\n[severity]\nfailed_to_sign = 7\n").unwrap();
        let config = CoordinatorConfig::load_or_create(&path).unwrap();
        assert_eq!(config.min_input_count_by_round, 3);
        assert_eq!(config.severity.failed_to_sign, 7);
        assert_eq!(config.max_input_count_by_round, 100);
    }

    #[test]
    fn inconsistent_values_are_rejected() {
        let config = CoordinatorConfig {
            min_input_count_by_round: 10,
            max_input_count_by_round: 5,
            ..CoordinatorConfig::default()
        };
        assert!(config.validate().is_err());

        let config = CoordinatorConfig {
            credential_count: 0,
            ..CoordinatorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
