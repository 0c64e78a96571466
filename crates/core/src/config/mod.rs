//! Configuration for deployments of the money market.
//!
//! This module provides:
//! - Engine configuration (risk parameters and liquidation policy profiles)
//! - Deployment configuration (assets, markets, accounts, services)
//! - Scenario scripts run against a deployment
//! - The loader resolving all of it from a config directory

mod deployment;
mod engine;
mod loader;
mod scenario;

// Re-export engine config (profiles)
pub use engine::{EngineConfig, LiquidationConfig, RiskConfig, ENGINE_PROFILE_VAR};

// Re-export deployment config
pub use deployment::{
    AccountConfig, AssetConfig, DeploymentConfig, DeploymentDetails, EngineOverrides,
    FlashConfig, LiquidatorConfig, MarketConfig, RateModelConfig, SwapVenueConfig,
};

// Re-export scenario scripts
pub use scenario::{ScenarioAction, ScenarioConfig, ScenarioDetails, ScenarioStep, MAX_AMOUNT};

// Re-export deployment loader
pub use loader::{
    config_dir_from_env, expand_env, load_deployment, load_deployment_from_env, DeploymentLoader,
    ResolvedAccount, ResolvedAsset, ResolvedDeployment, ResolvedFlash, ResolvedLiquidator,
    ResolvedMarket, ResolvedVenue, DEFAULT_DEPLOYMENT,
};
