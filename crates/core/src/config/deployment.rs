//! Deployment configuration: assets, markets and the accounts around them.
//!
//! Amounts are decimal strings in whole tokens ("63000", "0.5") and are
//! converted with the asset's decimals when the deployment is resolved.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Full deployment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Deployment metadata
    pub deployment: DeploymentDetails,
    /// Underlying assets
    #[serde(default)]
    pub assets: Vec<AssetConfig>,
    /// Markets, listed in order
    #[serde(default)]
    pub markets: Vec<MarketConfig>,
    /// Engine configuration overrides
    #[serde(default)]
    pub engine: Option<EngineOverrides>,
    /// Flash liquidity source
    #[serde(default)]
    pub flash: Option<FlashConfig>,
    /// Swap venue for the conversion leg
    #[serde(default)]
    pub swap: Option<SwapVenueConfig>,
    /// Named accounts and their starting balances
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    /// Flash liquidation executor
    #[serde(default)]
    pub liquidator: Option<LiquidatorConfig>,
}

/// Deployment details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentDetails {
    /// Deployment name (e.g., "compound-local")
    pub name: String,
    /// Engine profile to start from; `ENGINE_PROFILE` when unset
    #[serde(default)]
    pub profile: Option<String>,
    /// Scenario run when none is named
    #[serde(default)]
    pub scenario: Option<String>,
}

/// Asset entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetConfig {
    /// Asset symbol (e.g., "WBTC")
    pub symbol: String,
    /// Token address (hex, may be "${ENV_VAR}")
    pub address: String,
    /// Token decimals
    pub decimals: u8,
    /// Initial oracle price in USD (decimal string)
    #[serde(default)]
    pub price_usd: Option<String>,
}

/// Market entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Claim token symbol (e.g., "cWBTC")
    pub symbol: String,
    /// Claim token address
    pub address: String,
    /// Underlying asset symbol
    pub underlying: String,
    #[serde(default)]
    pub collateral_factor: f64,
    #[serde(default)]
    pub reserve_factor: f64,
    #[serde(default)]
    pub protocol_seize_share: f64,
    /// Claim token decimals
    #[serde(default = "default_claim_decimals")]
    pub claim_decimals: u8,
    /// Initial exchange rate as a decimal (underlying units per claim unit);
    /// one whole claim per whole underlying when unset
    #[serde(default)]
    pub initial_exchange_rate: Option<String>,
    /// Borrow cap in whole underlying tokens
    #[serde(default)]
    pub borrow_cap: Option<String>,
    /// Supply cap in whole underlying tokens
    #[serde(default)]
    pub supply_cap: Option<String>,
    #[serde(default)]
    pub rate_model: RateModelConfig,
}

fn default_claim_decimals() -> u8 {
    crate::market::DEFAULT_CLAIM_DECIMALS
}

/// Interest rate model, yearly rates as decimal fractions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RateModelConfig {
    WhitePaper {
        #[serde(default)]
        base_rate_per_year: f64,
        #[serde(default)]
        multiplier_per_year: f64,
    },
    Jump {
        #[serde(default)]
        base_rate_per_year: f64,
        multiplier_per_year: f64,
        jump_multiplier_per_year: f64,
        kink: f64,
    },
}

impl Default for RateModelConfig {
    fn default() -> Self {
        Self::WhitePaper {
            base_rate_per_year: 0.0,
            multiplier_per_year: 0.0,
        }
    }
}

/// Engine overrides applied on top of the selected profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineOverrides {
    #[serde(default)]
    pub close_factor: Option<f64>,
    #[serde(default)]
    pub liquidation_incentive: Option<f64>,
    #[serde(default)]
    pub max_slippage_bps: Option<u16>,
    #[serde(default)]
    pub min_profit: Option<String>,
}

/// Flash liquidity source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashConfig {
    pub address: String,
    /// Fee in basis points
    #[serde(default = "default_flash_fee_bps")]
    pub fee_bps: u16,
    /// Asset symbol -> whole tokens of lendable liquidity
    #[serde(default)]
    pub liquidity: BTreeMap<String, String>,
}

fn default_flash_fee_bps() -> u16 {
    9
}

/// Swap venue quoting at oracle prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapVenueConfig {
    pub address: String,
    /// Fee in hundredths of basis points (3000 = 0.3%)
    #[serde(default = "default_swap_fee")]
    pub fee: u32,
    /// Asset symbol -> whole tokens held by the venue
    #[serde(default)]
    pub liquidity: BTreeMap<String, String>,
}

fn default_swap_fee() -> u32 {
    3000
}

/// Named account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    pub address: String,
    /// Asset symbol -> whole tokens issued at setup
    #[serde(default)]
    pub balances: BTreeMap<String, String>,
}

/// Flash liquidation executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidatorConfig {
    pub address: String,
    /// Symbol of the market whose debt the executor repays
    pub debt_market: String,
}

impl DeploymentConfig {
    /// Load deployment config from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: DeploymentConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn asset(&self, symbol: &str) -> Option<&AssetConfig> {
        self.assets.iter().find(|a| a.symbol == symbol)
    }

    pub fn market(&self, symbol: &str) -> Option<&MarketConfig> {
        self.markets.iter().find(|m| m.symbol == symbol)
    }
}
