//! Money market core logic.
//!
//! This crate provides a Compound-style lending protocol and the tooling
//! around it:
//! - Token ledger and asset registry
//! - Markets with claim tokens, borrow indices and interest accrual
//! - Risk engine: collateral factors, account liquidity, liquidation rules
//! - Atomic protocol operations with rollback and re-entrancy locks
//! - Flash liquidity and a flash-loan funded liquidation executor
//! - Deployment configuration and scripted scenarios

mod assets;
pub mod config;
mod deploy;
mod error;
mod flash;
mod ledger;
mod liquidator;
mod market;
mod position;
mod protocol;
mod risk_engine;
mod shared;
pub mod u256_math;

pub use assets::{Asset, AssetRegistry};
pub use config::{
    load_deployment, load_deployment_from_env, DeploymentLoader, EngineConfig, ResolvedDeployment,
    ScenarioConfig,
};
pub use deploy::{
    AccountSummary, Deployment, DirectLiquidation, LiquidityCheck, ScenarioReport, StepResult,
    StepStatus,
};
pub use error::{DenyReason, ProtocolError, ProtocolResult};
pub use flash::{FlashCallback, FlashLiquiditySource, PoolFlashLender};
pub use ledger::TokenLedger;
pub use liquidator::{LiquidationExecutor, LiquidationReport, ProfitEstimate};
pub use market::{
    Accrual, BorrowSnapshot, Market, MarketParams, MarketStatus, MarketsView, Seizure,
    BORROW_RATE_MAX, DEFAULT_CLAIM_DECIMALS,
};
pub use position::{AccountLiquidity, AccountPosition, CollateralEntry, DebtEntry};
pub use protocol::{AccountSnapshot, LiquidationOutcome, Protocol, Redemption, RISK_ENGINE_ID};
pub use risk_engine::{
    AdminCap, MarketRiskParams, Operation, RiskEngine, RiskParameters, COLLATERAL_FACTOR_MAX,
};
pub use shared::SharedProtocol;
