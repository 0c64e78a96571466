//! Scripted scenarios run against a deployment.
//!
//! Accounts are referenced by name (or hex address), markets by claim symbol
//! and assets by symbol. Amounts are whole-token decimal strings; `"max"` is
//! accepted where noted.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Keyword for "the largest amount the operation allows".
pub const MAX_AMOUNT: &str = "max";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub scenario: ScenarioDetails,
    #[serde(default)]
    pub steps: Vec<ScenarioStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioDetails {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// One scripted action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioStep {
    #[serde(flatten)]
    pub action: ScenarioAction,
    /// The step must fail; a success aborts the scenario
    #[serde(default)]
    pub expect_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScenarioAction {
    Mint {
        account: String,
        market: String,
        amount: String,
    },
    /// `claims` in whole claim tokens, or "max" for the full balance
    Redeem {
        account: String,
        market: String,
        claims: String,
    },
    RedeemUnderlying {
        account: String,
        market: String,
        amount: String,
    },
    Borrow {
        account: String,
        market: String,
        amount: String,
    },
    /// "max" repays the full owed balance
    Repay {
        account: String,
        market: String,
        amount: String,
    },
    RepayBehalf {
        payer: String,
        borrower: String,
        market: String,
        amount: String,
    },
    EnterMarkets {
        account: String,
        markets: Vec<String>,
    },
    ExitMarket {
        account: String,
        market: String,
    },
    TransferClaims {
        from: String,
        to: String,
        market: String,
        claims: String,
    },
    SetPrice {
        asset: String,
        price_usd: String,
    },
    SetCollateralFactor {
        market: String,
        collateral_factor: f64,
    },
    PauseMarket {
        market: String,
        paused: bool,
    },
    AdvanceBlocks {
        blocks: u64,
    },
    /// Direct liquidation funded by the liquidator's own balance
    Liquidate {
        liquidator: String,
        borrower: String,
        repay_market: String,
        collateral_market: String,
        amount: String,
    },
    /// Flash liquidation through the deployment's executor; "max" repays the
    /// close-factor maximum, and an omitted collateral market picks the
    /// largest collateral
    FlashLiquidate {
        initiator: String,
        borrower: String,
        #[serde(default)]
        collateral_market: Option<String>,
        amount: String,
    },
    /// Record the account's liquidity in the report
    CheckLiquidity {
        account: String,
    },
}

impl ScenarioAction {
    /// Short name for logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mint { .. } => "mint",
            Self::Redeem { .. } => "redeem",
            Self::RedeemUnderlying { .. } => "redeem_underlying",
            Self::Borrow { .. } => "borrow",
            Self::Repay { .. } => "repay",
            Self::RepayBehalf { .. } => "repay_behalf",
            Self::EnterMarkets { .. } => "enter_markets",
            Self::ExitMarket { .. } => "exit_market",
            Self::TransferClaims { .. } => "transfer_claims",
            Self::SetPrice { .. } => "set_price",
            Self::SetCollateralFactor { .. } => "set_collateral_factor",
            Self::PauseMarket { .. } => "pause_market",
            Self::AdvanceBlocks { .. } => "advance_blocks",
            Self::Liquidate { .. } => "liquidate",
            Self::FlashLiquidate { .. } => "flash_liquidate",
            Self::CheckLiquidity { .. } => "check_liquidity",
        }
    }
}

impl ScenarioConfig {
    /// Load a scenario from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: ScenarioConfig = toml::from_str(&content)?;
        Ok(config)
    }
}
