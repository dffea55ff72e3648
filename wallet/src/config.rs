// Wallet configuration
// Fee, selection, ring and privacy policy loaded from TOML

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::types::{Amount, CENT, COIN};

/// Smallest ring accepted for anonymous inputs
pub const MIN_RINGSIZE: usize = 3;
/// Largest ring accepted for anonymous inputs
pub const MAX_RINGSIZE: usize = 32;
/// Most real inputs one ring signature may carry
pub const MAX_ANON_INPUTS: usize = 32;
/// Anon-input transactions pay this multiple of the required fee
pub const ANON_FEE_MULTIPLIER: Amount = 2;
/// Attempts at drawing a usable ephemeral key
pub const EPHEMERAL_RETRIES: usize = 24;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub fees: FeeConfig,
    pub selection: SelectionConfig,
    pub ring: RingConfig,
    pub privacy: PrivacyConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    /// Outputs below this are refused
    pub dust_threshold: Amount,
    /// Preferred minimum change when approximating a subset sum
    pub change_threshold: Amount,
    /// Change may absorb extra fee only while it stays above this
    pub min_final_change: Amount,
    /// Largest transaction the builder will produce, in bytes
    pub max_tx_size: usize,
    pub max_fee_iterations: usize,
    pub sub_fee_tries: usize,
    /// Confirmation target handed to the fee estimator
    pub confirm_target: u32,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            dust_threshold: 546,
            change_threshold: CENT,
            min_final_change: CENT / 2,
            max_tx_size: 400_000,
            max_fee_iterations: 20,
            sub_fee_tries: 100,
            confirm_target: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub spend_zero_conf_change: bool,
    pub reject_long_chains: bool,
    pub max_ancestors: usize,
    pub max_descendants: usize,
    /// 0 for unlimited; otherwise sliding-window selection
    pub max_inputs: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            spend_zero_conf_change: true,
            reject_long_chains: true,
            max_ancestors: 25,
            max_descendants: 25,
            max_inputs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    pub ring_size: usize,
    pub inputs_per_sig: usize,
    /// Decoys must be at least this deep, plus `extra_depth`
    pub min_output_depth: i32,
    pub extra_depth: i32,
    /// Most recent outputs sampled half of the time
    pub group1: u64,
    /// Wider recent window sampled on 70% of the remaining draws
    pub group2: u64,
    pub max_tries: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            ring_size: 11,
            inputs_per_sig: 32,
            min_output_depth: 12,
            extra_depth: 2,
            group1: 2_400,
            group2: 24_000,
            max_tries: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// Split halves below this value never have fee subtracted
    pub fee_sub_exempt_threshold: Amount,
    pub force_blind_change_on_exact_match: bool,
    pub split_single_blind_output: bool,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            fee_sub_exempt_threshold: COIN / 10,
            force_blind_change_on_exact_match: true,
            split_single_blind_output: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database directory; a temporary database is used when unset
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, overridden by `RUST_LOG`
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl WalletConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse config file")
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }
}
