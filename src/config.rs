//! TOML configuration with environment overrides.
//!
//! Lookup order: explicit `--config` path, then
//! `<platform config dir>/hbar-gate/config.toml`. A missing file means
//! defaults; a present but malformed file is an error.

use crate::billing::pricing::{default_tiers, PricingTier};
use crate::error::GateError;
use crate::network::Network;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DAY_SECS: u64 = 24 * 3600;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub auth: AuthConfig,
    pub pricing: PricingConfig,
    pub settlement: SettlementConfig,
    pub mirror: MirrorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Name shown in the challenge purpose line.
    pub name: String,
    pub network: Network,
    /// Directory holding `auth.db` and `credits.db`.
    pub data_dir: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "hbar-gate".into(),
            network: Network::Testnet,
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// How long a signed challenge may be redeemed.
    pub challenge_ttl_secs: u64,
    /// Key lifetime when the caller does not ask for one.
    pub default_key_ttl_secs: u64,
    /// Upper bound for any requested key lifetime.
    pub max_key_ttl_secs: u64,
    /// Remaining lifetime below which a key should be rotated.
    pub rotation_threshold_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            challenge_ttl_secs: 300,
            default_key_ttl_secs: 30 * DAY_SECS,
            max_key_ttl_secs: 90 * DAY_SECS,
            rotation_threshold_secs: 7 * DAY_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub tiers: Vec<PricingTier>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Account that receives credit purchases.
    pub treasury_account: String,
    pub poll_interval_secs: u64,
    /// Host-side limit for `poll_until`; the pipeline itself never gives up.
    pub poll_timeout_secs: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            treasury_account: "0.0.800".into(),
            poll_interval_secs: 3,
            poll_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Overrides the public mirror node for the configured network.
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load from `path` (or the default location), then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(default_config_path);

        let mut config = match path {
            Some(ref p) if p.exists() => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config: {}", p.display()))?;
                let parsed: Config = toml::from_str(&raw)
                    .with_context(|| format!("Failed to parse config: {}", p.display()))?;
                tracing::debug!(path = %p.display(), "Loaded configuration");
                parsed
            }
            _ => Config::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(network) = std::env::var("HBAR_GATE_NETWORK") {
            match network.parse() {
                Ok(n) => self.service.network = n,
                Err(_) => tracing::warn!(value = %network, "Ignoring unknown HBAR_GATE_NETWORK"),
            }
        }
        if let Ok(url) = std::env::var("HBAR_GATE_MIRROR_URL") {
            if !url.trim().is_empty() {
                self.mirror.base_url = Some(url.trim().to_string());
            }
        }
        if let Ok(treasury) = std::env::var("HBAR_GATE_TREASURY") {
            if !treasury.trim().is_empty() {
                self.settlement.treasury_account = treasury.trim().to_string();
            }
        }
        if let Ok(dir) = std::env::var("HBAR_GATE_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.service.data_dir = PathBuf::from(dir.trim());
            }
        }
    }

    pub fn validate(&self) -> std::result::Result<(), GateError> {
        if self.service.name.trim().is_empty() {
            return Err(GateError::Config("service.name cannot be empty".into()));
        }
        if self.auth.challenge_ttl_secs == 0 {
            return Err(GateError::Config("auth.challenge_ttl_secs must be > 0".into()));
        }
        if self.auth.default_key_ttl_secs > self.auth.max_key_ttl_secs {
            return Err(GateError::Config(
                "auth.default_key_ttl_secs exceeds auth.max_key_ttl_secs".into(),
            ));
        }
        if self.auth.rotation_threshold_secs >= self.auth.default_key_ttl_secs {
            return Err(GateError::Config(
                "auth.rotation_threshold_secs must be shorter than the default key TTL".into(),
            ));
        }
        if !crate::auth::is_valid_account_id(&self.settlement.treasury_account) {
            return Err(GateError::Config(format!(
                "settlement.treasury_account is not an account id: {}",
                self.settlement.treasury_account
            )));
        }
        if self.settlement.poll_interval_secs == 0 {
            return Err(GateError::Config("settlement.poll_interval_secs must be > 0".into()));
        }
        crate::billing::pricing::validate_tiers(&self.pricing.tiers)?;
        Ok(())
    }

    /// Mirror node base URL for the configured network.
    pub fn mirror_url(&self) -> String {
        self.mirror
            .base_url
            .clone()
            .unwrap_or_else(|| self.service.network.mirror_url().to_string())
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "hbar-gate", "hbar-gate")
}

fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().join("config.toml"))
}

fn default_data_dir() -> PathBuf {
    project_dirs()
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".hbar-gate"))
}
