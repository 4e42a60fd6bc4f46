//! Coordinator configuration, stored as a JSON file next to the ban database.

use anyhow::{bail, Context, Result};
use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, Amount, Network, ScriptBuf};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Highest accepted level count; level denominations double per level.
pub const MAX_MIXING_LEVELS: usize = 21;

/// Parameters fixed for the lifetime of one round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundConfig {
    /// Output amount of the first mixing level.
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub denomination: Amount,
    pub mixing_levels: usize,
    pub confirmation_target: u32,
    pub confirmation_target_reduction_rate: f64,
    /// Percentage of each level denomination charged per active output.
    pub coordinator_fee_percent: f64,
    pub anonymity_set: usize,
    pub registration_timeout: u64,
    pub connection_confirmation_timeout: u64,
    pub output_registration_timeout: u64,
    pub signing_timeout: u64,
    pub maximum_input_count_per_peer: usize,
    pub does_note_before_ban: bool,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub dust_threshold: Amount,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            denomination: Amount::from_sat(10_000_000),
            mixing_levels: 3,
            confirmation_target: 144,
            confirmation_target_reduction_rate: 0.7,
            coordinator_fee_percent: 0.003,
            anonymity_set: 100,
            registration_timeout: 3600,
            connection_confirmation_timeout: 60,
            output_registration_timeout: 60,
            signing_timeout: 60,
            maximum_input_count_per_peer: 7,
            does_note_before_ban: true,
            dust_threshold: Amount::from_sat(5_000),
        }
    }
}

impl RoundConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mixing_levels == 0 || self.mixing_levels > MAX_MIXING_LEVELS {
            bail!("mixing_levels must be between 1 and {}", MAX_MIXING_LEVELS);
        }
        if self.denomination <= self.dust_threshold {
            bail!("denomination {} is not above the dust threshold", self.denomination);
        }
        let top = self.denomination.to_sat().checked_mul(1u64 << (self.mixing_levels - 1));
        if top.map_or(true, |sats| Amount::from_sat(sats) > Amount::MAX_MONEY) {
            bail!("highest mixing level exceeds the money supply");
        }
        if self.anonymity_set < 2 {
            bail!("anonymity_set must be at least 2");
        }
        if self.maximum_input_count_per_peer == 0 {
            bail!("maximum_input_count_per_peer must be at least 1");
        }
        if !(0.0..=100.0).contains(&self.coordinator_fee_percent) {
            bail!("coordinator_fee_percent must be within 0..=100");
        }
        if !(self.confirmation_target_reduction_rate > 0.0 && self.confirmation_target_reduction_rate <= 1.0) {
            bail!("confirmation_target_reduction_rate must be within (0, 1]");
        }
        for (name, secs) in [
            ("registration_timeout", self.registration_timeout),
            ("connection_confirmation_timeout", self.connection_confirmation_timeout),
            ("output_registration_timeout", self.output_registration_timeout),
            ("signing_timeout", self.signing_timeout),
        ] {
            if secs == 0 {
                bail!("{} must be positive", name);
            }
        }
        Ok(())
    }

    /// Denomination of level `index`: `denomination * 2^index`.
    pub fn level_denomination(&self, index: usize) -> Amount {
        Amount::from_sat(self.denomination.to_sat() << index)
    }

    /// Confirmation target for fee estimation, lowered while our own
    /// coinjoins are waiting in the mempool.
    pub fn adjusted_confirmation_target(&self, unconfirmed_coinjoins: usize) -> u32 {
        let factor = self.confirmation_target_reduction_rate.powi(unconfirmed_coinjoins as i32);
        let target = (self.confirmation_target as f64 * factor).floor() as u32;
        target.max(2)
    }
}

/// Referee parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DosConfig {
    pub severity: u32,
    pub duration_hours: u64,
    pub note_repeat_limit: u32,
}

impl Default for DosConfig {
    fn default() -> Self {
        Self { severity: 1, duration_hours: 24, note_repeat_limit: 1 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: Network,
    /// Receives coordinator fees. Fees go to miners when unset.
    pub coordinator_address: Option<String>,
    pub dos: DosConfig,
    pub round: RoundConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::Regtest,
            coordinator_address: None,
            dos: DosConfig::default(),
            round: RoundConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = serde_json::from_str(&data)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, writing the defaults there first if it does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Wrote default config to {}", path.display());
            return Ok(config);
        }
        Self::load(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.round.validate()?;
        self.coordinator_script()?;
        if self.dos.severity == 0 || self.dos.duration_hours == 0 {
            bail!("dos severity and duration_hours must be positive");
        }
        Ok(())
    }

    /// Script paying the coordinator fee, if an address is configured.
    pub fn coordinator_script(&self) -> Result<Option<ScriptBuf>> {
        let Some(addr) = &self.coordinator_address else {
            return Ok(None);
        };
        let address = addr
            .parse::<Address<NetworkUnchecked>>()
            .with_context(|| format!("invalid coordinator address {}", addr))?
            .require_network(self.network)?;
        Ok(Some(address.script_pubkey()))
    }
}
