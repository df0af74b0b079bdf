use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use bigdecimal::BigDecimal;
use log::info;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};

use crate::error::{LedgerError, LedgerResult};
use crate::hash::HASH_LENGTH;

/// Longest miner signature a header may carry, in characters.
pub const MAX_MINER_SIGNATURE_LENGTH: usize = 50;

/// Chain-wide constants shared by every node of one ledger.
#[serde_as]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChainParams {
    #[serde(default = "default_chain_name")]
    pub chain_name: String,

    #[serde(default = "default_header_version")]
    pub header_version: u32,

    /// Number of blocks between two difficulty adjustments.
    #[serde(default = "default_retarget_interval")]
    pub retarget_interval: u64,

    #[serde(default = "default_target_seconds_per_block")]
    pub target_seconds_per_block: u64,

    /// Leading zero bits every header hash needs at difficulty 1.
    #[serde(default = "default_max_zero_bits")]
    pub max_zero_bits: u32,

    #[serde(default = "default_max_timestamp_skew_secs")]
    pub max_timestamp_skew_secs: u64,

    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_initial_difficulty")]
    pub initial_difficulty: BigDecimal,

    #[serde(default = "default_genesis_timestamp_ms")]
    pub genesis_timestamp_ms: i64,

    #[serde(default = "default_peer_query_timeout_secs")]
    pub peer_query_timeout_secs: u64,

    #[serde(default = "default_max_placeholder_wait_secs")]
    pub max_placeholder_wait_secs: u64,
}

fn default_chain_name() -> String {
    "tessera-main".to_string()
}
fn default_header_version() -> u32 {
    1
}
fn default_retarget_interval() -> u64 {
    100
}
fn default_target_seconds_per_block() -> u64 {
    60
}
fn default_max_zero_bits() -> u32 {
    12
}
fn default_max_timestamp_skew_secs() -> u64 {
    600
}
fn default_initial_difficulty() -> BigDecimal {
    BigDecimal::from(1)
}
fn default_genesis_timestamp_ms() -> i64 {
    // 2024-01-01T00:00:00Z
    1_704_067_200_000
}
fn default_peer_query_timeout_secs() -> u64 {
    5
}
fn default_max_placeholder_wait_secs() -> u64 {
    120
}

impl Default for ChainParams {
    fn default() -> Self {
        ChainParams {
            chain_name: default_chain_name(),
            header_version: default_header_version(),
            retarget_interval: default_retarget_interval(),
            target_seconds_per_block: default_target_seconds_per_block(),
            max_zero_bits: default_max_zero_bits(),
            max_timestamp_skew_secs: default_max_timestamp_skew_secs(),
            initial_difficulty: default_initial_difficulty(),
            genesis_timestamp_ms: default_genesis_timestamp_ms(),
            peer_query_timeout_secs: default_peer_query_timeout_secs(),
            max_placeholder_wait_secs: default_max_placeholder_wait_secs(),
        }
    }
}

impl ChainParams {
    /// Reads parameters from a TOML file, falling back to the defaults when the
    /// file does not exist.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let params: ChainParams = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read chain parameters from {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse chain parameters in {:?}", path))?
        } else {
            info!("No parameter file at {:?}, using defaults.", path);
            ChainParams::default()
        };

        params.validate()?;
        Ok(params)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize chain parameters to TOML")
    }

    pub fn validate(&self) -> LedgerResult<()> {
        if self.chain_name.is_empty() {
            return Err(LedgerError::IllegalArgument(
                "chain name must not be empty".to_string(),
            ));
        }
        if self.retarget_interval == 0 {
            return Err(LedgerError::IllegalArgument(
                "retarget interval must be at least one block".to_string(),
            ));
        }
        if self.target_seconds_per_block == 0 {
            return Err(LedgerError::IllegalArgument(
                "target block time must be positive".to_string(),
            ));
        }
        if self.max_zero_bits as usize >= HASH_LENGTH * 8 {
            return Err(LedgerError::IllegalArgument(format!(
                "max zero bits {} leaves no room in a {}-bit hash",
                self.max_zero_bits,
                HASH_LENGTH * 8
            )));
        }
        if self.initial_difficulty < BigDecimal::from(1) {
            return Err(LedgerError::IllegalArgument(format!(
                "initial difficulty {} is below 1",
                self.initial_difficulty
            )));
        }
        Ok(())
    }

    pub fn max_timestamp_skew_ms(&self) -> i64 {
        (self.max_timestamp_skew_secs as i64).saturating_mul(1000)
    }

    pub fn peer_query_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_query_timeout_secs)
    }

    pub fn max_placeholder_wait(&self) -> Duration {
        Duration::from_secs(self.max_placeholder_wait_secs)
    }

    /// Small parameters for tests: cheap proof of work and a short retarget interval.
    pub fn testing() -> Self {
        ChainParams {
            chain_name: "tessera-test".to_string(),
            retarget_interval: 2,
            target_seconds_per_block: 10,
            max_zero_bits: 4,
            ..ChainParams::default()
        }
    }
}

impl FromStr for ChainParams {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let params: ChainParams =
            toml::from_str(s).context("Failed to parse chain parameters")?;
        params.validate()?;
        Ok(params)
    }
}
