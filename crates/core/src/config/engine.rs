//! Engine configuration with profile support.
//!
//! Risk parameters and liquidation policy come in three profiles (default,
//! conservative, aggressive); a deployment may override individual fields.

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::risk_engine::RiskParameters;
use crate::u256_math;

/// Environment variable selecting a profile name or a profile file.
pub const ENGINE_PROFILE_VAR: &str = "ENGINE_PROFILE";

/// Main configuration structure for the engine and its liquidator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Profile name (for logging/identification)
    #[serde(default = "default_profile_name")]
    pub profile: String,

    /// Engine-wide risk parameters
    #[serde(default)]
    pub risk: RiskConfig,

    /// Liquidation execution parameters
    #[serde(default)]
    pub liquidation: LiquidationConfig,
}

fn default_profile_name() -> String {
    "default".to_string()
}

/// Risk parameters as decimal fractions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Fraction of a borrow repayable in one liquidation
    #[serde(default = "default_close_factor")]
    pub close_factor: f64,

    /// Collateral received per unit of debt repaid (>= 1.0)
    #[serde(default = "default_liquidation_incentive")]
    pub liquidation_incentive: f64,
}

fn default_close_factor() -> f64 {
    0.5
}
fn default_liquidation_incentive() -> f64 {
    1.08
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            close_factor: default_close_factor(),
            liquidation_incentive: default_liquidation_incentive(),
        }
    }
}

impl RiskConfig {
    pub fn to_parameters(&self) -> RiskParameters {
        RiskParameters {
            close_factor: u256_math::f64_to_wad(self.close_factor),
            liquidation_incentive: u256_math::f64_to_wad(self.liquidation_incentive),
        }
    }
}

/// Liquidation execution parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationConfig {
    /// Maximum gap between a swap route and oracle fair value (basis points)
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: u16,

    /// Minimum profit in whole debt-asset units (e.g. "10.5")
    #[serde(default = "default_min_profit")]
    pub min_profit: String,
}

fn default_max_slippage_bps() -> u16 {
    100
}
fn default_min_profit() -> String {
    "0".to_string()
}

impl Default for LiquidationConfig {
    fn default() -> Self {
        Self {
            max_slippage_bps: default_max_slippage_bps(),
            min_profit: default_min_profit(),
        }
    }
}

impl LiquidationConfig {
    /// Minimum profit in raw units of a `decimals`-decimal debt asset.
    pub fn min_profit_units(&self, decimals: u8) -> anyhow::Result<U256> {
        u256_math::parse_units(&self.min_profit, decimals)
            .map_err(|e| anyhow::anyhow!("invalid min_profit: {}", e))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            risk: RiskConfig::default(),
            liquidation: LiquidationConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Smaller incentive, tight slippage and a profit floor.
    pub fn conservative() -> Self {
        Self {
            profile: "conservative".to_string(),
            risk: RiskConfig {
                close_factor: 0.5,
                liquidation_incentive: 1.05,
            },
            liquidation: LiquidationConfig {
                max_slippage_bps: 50,
                min_profit: "10".to_string(),
            },
        }
    }

    /// Large liquidation slices and loose slippage.
    pub fn aggressive() -> Self {
        Self {
            profile: "aggressive".to_string(),
            risk: RiskConfig {
                close_factor: 0.9,
                liquidation_incentive: 1.1,
            },
            liquidation: LiquidationConfig {
                max_slippage_bps: 300,
                min_profit: "0".to_string(),
            },
        }
    }

    /// Profile by name. Supported: default, conservative, aggressive.
    pub fn load_profile(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "default" => Some(Self::default()),
            "conservative" | "safe" => Some(Self::conservative()),
            "aggressive" | "aggro" => Some(Self::aggressive()),
            _ => None,
        }
    }

    /// Profile from `ENGINE_PROFILE`: a profile name or a path to a TOML file.
    /// Falls back to the default profile.
    pub fn from_env() -> Self {
        let Ok(selected) = std::env::var(ENGINE_PROFILE_VAR) else {
            return Self::default();
        };
        if let Some(config) = Self::load_profile(&selected) {
            return config;
        }
        match Self::from_file(&selected) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(profile = %selected, error = %e, "Unknown engine profile, using default");
                Self::default()
            }
        }
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        tracing::info!(profile = %self.profile, "Engine configuration loaded");
        tracing::info!(
            close_factor = self.risk.close_factor,
            liquidation_incentive = self.risk.liquidation_incentive,
            "Risk parameters"
        );
        tracing::info!(
            max_slippage_bps = self.liquidation.max_slippage_bps,
            min_profit = %self.liquidation.min_profit,
            "Liquidation parameters"
        );
    }
}
