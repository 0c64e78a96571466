//! External collaborators of the money-market engine.
//!
//! This crate provides the narrow interfaces the engine consumes, plus
//! reference implementations used by scenarios and tests:
//! - Price oracle: USD prices per asset
//! - Interest rate models: per-block borrow/supply rates
//! - Swap routing: quotes for the conversion leg of a liquidation

pub mod oracle;
pub mod rate_model;
pub mod swap;

use alloy::primitives::U256;

pub use oracle::{PriceOracle, SimplePriceOracle};
pub use rate_model::{
    utilization_rate, InterestRateModel, JumpRateModel, WhitePaperInterestRateModel,
    BLOCKS_PER_YEAR,
};
pub use swap::{
    FeeTier, OracleRouter, RouteLeg, SwapParams, SwapRoute, SwapRouter, SwapRouterRegistry,
    DEFAULT_SLIPPAGE_BPS,
};

/// WAD constant: 1e18, the fixed-point scale for prices, rates and factors.
pub const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000u64, 0, 0, 0]);
