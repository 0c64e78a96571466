//! Deployment loader: reads TOML from the config directory and resolves it.
//!
//! Layout under the config directory:
//! - `deployments/<name>.toml`: [`DeploymentConfig`]
//! - `scenarios/<name>.toml`: [`ScenarioConfig`]
//! - `profiles/<name>.toml`: optional [`EngineConfig`] profiles
//!
//! `${VAR}` references are expanded from the environment before parsing.

use super::{
    AccountConfig, DeploymentConfig, EngineConfig, EngineOverrides, RateModelConfig,
    ScenarioConfig,
};
use crate::u256_math;
use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Default deployment when `DEPLOYMENT` is unset.
pub const DEFAULT_DEPLOYMENT: &str = "compound-local";

/// Fully resolved deployment: addresses parsed, amounts in raw units.
#[derive(Debug, Clone)]
pub struct ResolvedDeployment {
    /// Deployment name
    pub name: String,
    /// Engine configuration (profile with deployment overrides applied)
    pub engine: EngineConfig,
    pub assets: Vec<ResolvedAsset>,
    /// Markets in listing order
    pub markets: Vec<ResolvedMarket>,
    pub flash: Option<ResolvedFlash>,
    pub swap: Option<ResolvedVenue>,
    pub accounts: Vec<ResolvedAccount>,
    pub liquidator: Option<ResolvedLiquidator>,
    /// Scenario run when none is named
    pub default_scenario: Option<String>,
}

/// Resolved asset configuration.
#[derive(Debug, Clone)]
pub struct ResolvedAsset {
    pub symbol: String,
    pub address: Address,
    pub decimals: u8,
    /// Initial price (USD per whole token, 1e18)
    pub price: Option<U256>,
}

/// Resolved market configuration. Mantissas at 1e18 scale.
#[derive(Debug, Clone)]
pub struct ResolvedMarket {
    pub symbol: String,
    pub address: Address,
    pub underlying: Address,
    pub collateral_factor: U256,
    pub reserve_factor: U256,
    pub protocol_seize_share: U256,
    pub claim_decimals: u8,
    pub initial_exchange_rate: Option<U256>,
    /// Underlying units, zero for unlimited
    pub borrow_cap: U256,
    /// Underlying units, zero for unlimited
    pub supply_cap: U256,
    pub rate_model: RateModelConfig,
}

#[derive(Debug, Clone)]
pub struct ResolvedFlash {
    pub address: Address,
    pub fee_bps: u16,
    /// (asset, raw amount)
    pub liquidity: Vec<(Address, U256)>,
}

#[derive(Debug, Clone)]
pub struct ResolvedVenue {
    pub address: Address,
    /// Hundredths of basis points
    pub fee: u32,
    /// (asset, raw amount)
    pub liquidity: Vec<(Address, U256)>,
}

#[derive(Debug, Clone)]
pub struct ResolvedAccount {
    pub name: String,
    pub address: Address,
    /// (asset, raw amount)
    pub balances: Vec<(Address, U256)>,
}

#[derive(Debug, Clone)]
pub struct ResolvedLiquidator {
    pub address: Address,
    pub debt_market: Address,
    /// Minimum profit in raw debt-asset units
    pub min_profit: U256,
    pub max_slippage_bps: u16,
}

impl ResolvedDeployment {
    pub fn asset_by_symbol(&self, symbol: &str) -> Option<&ResolvedAsset> {
        self.assets.iter().find(|a| a.symbol == symbol)
    }

    pub fn market_by_symbol(&self, symbol: &str) -> Option<&ResolvedMarket> {
        self.markets.iter().find(|m| m.symbol == symbol)
    }

    pub fn account_by_name(&self, name: &str) -> Option<&ResolvedAccount> {
        self.accounts.iter().find(|a| a.name == name)
    }
}

/// Deployment loader for unified configuration.
#[derive(Debug, Clone)]
pub struct DeploymentLoader {
    /// Config directory path
    config_dir: PathBuf,
}

impl DeploymentLoader {
    /// Create a new deployment loader from a config directory.
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            config_dir: config_dir.as_ref().to_path_buf(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Load and resolve a deployment by name.
    pub fn load(&self, deployment_name: &str) -> Result<ResolvedDeployment> {
        info!(deployment = deployment_name, "Loading deployment configuration");
        let path = self
            .config_dir
            .join("deployments")
            .join(format!("{}.toml", deployment_name));
        let config: DeploymentConfig = self
            .read_toml(&path)
            .with_context(|| format!("Failed to load deployment '{}'", deployment_name))?;
        self.resolve(config)
    }

    /// Load deployment from environment variable DEPLOYMENT.
    pub fn load_from_env(&self) -> Result<ResolvedDeployment> {
        let deployment_name =
            std::env::var("DEPLOYMENT").unwrap_or_else(|_| DEFAULT_DEPLOYMENT.to_string());
        self.load(&deployment_name)
    }

    /// Load a scenario by name.
    pub fn load_scenario(&self, scenario_name: &str) -> Result<ScenarioConfig> {
        let path = self
            .config_dir
            .join("scenarios")
            .join(format!("{}.toml", scenario_name));
        self.read_toml(&path)
            .with_context(|| format!("Failed to load scenario '{}'", scenario_name))
    }

    /// Engine profile: a built-in name, else `profiles/<name>.toml`.
    pub fn load_profile(&self, profile: &str) -> Result<EngineConfig> {
        if let Some(config) = EngineConfig::load_profile(profile) {
            return Ok(config);
        }
        let path = self.config_dir.join("profiles").join(format!("{}.toml", profile));
        self.read_toml(&path)
            .with_context(|| format!("Unknown engine profile '{}'", profile))
    }

    fn read_toml<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        toml::from_str(&expand_env(&content)).with_context(|| format!("Failed to parse {:?}", path))
    }

    /// Resolve a parsed deployment into addresses and raw amounts.
    pub fn resolve(&self, config: DeploymentConfig) -> Result<ResolvedDeployment> {
        let engine = self.build_engine_config(
            config.deployment.profile.as_deref(),
            config.engine.as_ref(),
        )?;

        let assets = config
            .assets
            .iter()
            .map(|asset| {
                let price = asset
                    .price_usd
                    .as_deref()
                    .map(|p| units(p, 18).with_context(|| format!("price of {}", asset.symbol)))
                    .transpose()?;
                Ok(ResolvedAsset {
                    symbol: asset.symbol.clone(),
                    address: parse_address(&asset.address)
                        .with_context(|| format!("asset {}", asset.symbol))?,
                    decimals: asset.decimals,
                    price,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let asset_lookup = |symbol: &str| -> Result<&ResolvedAsset> {
            assets
                .iter()
                .find(|a| a.symbol == symbol)
                .ok_or_else(|| anyhow::anyhow!("Unknown asset '{}'", symbol))
        };
        let amounts = |balances: &BTreeMap<String, String>| -> Result<Vec<(Address, U256)>> {
            balances
                .iter()
                .map(|(symbol, amount)| {
                    let asset = asset_lookup(symbol)?;
                    Ok((asset.address, units(amount, asset.decimals)?))
                })
                .collect()
        };

        let markets = config
            .markets
            .iter()
            .map(|market| {
                let underlying = asset_lookup(&market.underlying)
                    .with_context(|| format!("market {}", market.symbol))?;
                let cap = |value: &Option<String>| -> Result<U256> {
                    value
                        .as_deref()
                        .map(|v| units(v, underlying.decimals))
                        .transpose()
                        .map(|v| v.unwrap_or(U256::ZERO))
                };
                Ok(ResolvedMarket {
                    symbol: market.symbol.clone(),
                    address: parse_address(&market.address)
                        .with_context(|| format!("market {}", market.symbol))?,
                    underlying: underlying.address,
                    collateral_factor: u256_math::f64_to_wad(market.collateral_factor),
                    reserve_factor: u256_math::f64_to_wad(market.reserve_factor),
                    protocol_seize_share: u256_math::f64_to_wad(market.protocol_seize_share),
                    claim_decimals: market.claim_decimals,
                    initial_exchange_rate: market
                        .initial_exchange_rate
                        .as_deref()
                        .map(|r| units(r, 18))
                        .transpose()?,
                    borrow_cap: cap(&market.borrow_cap)?,
                    supply_cap: cap(&market.supply_cap)?,
                    rate_model: market.rate_model.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let flash = config
            .flash
            .as_ref()
            .map(|flash| -> Result<ResolvedFlash> {
                Ok(ResolvedFlash {
                    address: parse_address(&flash.address).context("flash source")?,
                    fee_bps: flash.fee_bps,
                    liquidity: amounts(&flash.liquidity)?,
                })
            })
            .transpose()?;

        let swap = config
            .swap
            .as_ref()
            .map(|venue| -> Result<ResolvedVenue> {
                Ok(ResolvedVenue {
                    address: parse_address(&venue.address).context("swap venue")?,
                    fee: venue.fee,
                    liquidity: amounts(&venue.liquidity)?,
                })
            })
            .transpose()?;

        let accounts = config
            .accounts
            .iter()
            .map(|account: &AccountConfig| {
                Ok(ResolvedAccount {
                    name: account.name.clone(),
                    address: parse_address(&account.address)
                        .with_context(|| format!("account {}", account.name))?,
                    balances: amounts(&account.balances)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let liquidator = config
            .liquidator
            .as_ref()
            .map(|liquidator| -> Result<ResolvedLiquidator> {
                let market = markets
                    .iter()
                    .find(|m| m.symbol == liquidator.debt_market)
                    .ok_or_else(|| anyhow::anyhow!("Unknown debt market '{}'", liquidator.debt_market))?;
                let decimals = assets
                    .iter()
                    .find(|a| a.address == market.underlying)
                    .map(|a| a.decimals)
                    .unwrap_or(18);
                Ok(ResolvedLiquidator {
                    address: parse_address(&liquidator.address).context("liquidator")?,
                    debt_market: market.address,
                    min_profit: engine.liquidation.min_profit_units(decimals)?,
                    max_slippage_bps: engine.liquidation.max_slippage_bps,
                })
            })
            .transpose()?;

        Ok(ResolvedDeployment {
            name: config.deployment.name.clone(),
            engine,
            assets,
            markets,
            flash,
            swap,
            accounts,
            liquidator,
            default_scenario: config.deployment.scenario.clone(),
        })
    }

    fn build_engine_config(
        &self,
        profile: Option<&str>,
        overrides: Option<&EngineOverrides>,
    ) -> Result<EngineConfig> {
        // Start with base config from profile or environment
        let mut config = match profile {
            Some(profile) => self.load_profile(profile)?,
            None => EngineConfig::from_env(),
        };

        // Apply overrides
        if let Some(ovr) = overrides {
            if let Some(v) = ovr.close_factor {
                config.risk.close_factor = v;
            }
            if let Some(v) = ovr.liquidation_incentive {
                config.risk.liquidation_incentive = v;
            }
            if let Some(v) = ovr.max_slippage_bps {
                config.liquidation.max_slippage_bps = v;
            }
            if let Some(v) = &ovr.min_profit {
                config.liquidation.min_profit = v.clone();
            }
        }

        Ok(config)
    }
}

/// Replace every `${VAR}` with the variable's value. Unset variables are
/// left as written.
pub fn expand_env(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var_name = &after[..end];
                match std::env::var(var_name) {
                    Ok(value) => output.push_str(&value),
                    Err(_) => output.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                output.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    output.push_str(rest);
    output
}

fn parse_address(value: &str) -> Result<Address> {
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", value, e))
}

fn units(value: &str, decimals: u8) -> Result<U256> {
    u256_math::parse_units(value, decimals).map_err(|e| anyhow::anyhow!(e))
}

/// Load a deployment from the default config directory.
///
/// Uses CONFIG_DIR env var or defaults to "./config".
pub fn load_deployment(deployment_name: &str) -> Result<ResolvedDeployment> {
    DeploymentLoader::new(config_dir_from_env()).load(deployment_name)
}

/// Load deployment from DEPLOYMENT env var.
pub fn load_deployment_from_env() -> Result<ResolvedDeployment> {
    DeploymentLoader::new(config_dir_from_env()).load_from_env()
}

/// CONFIG_DIR env var or "./config".
pub fn config_dir_from_env() -> PathBuf {
    std::env::var("CONFIG_DIR")
        .unwrap_or_else(|_| "./config".to_string())
        .into()
}
