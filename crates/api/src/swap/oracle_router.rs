//! Oracle-priced swap router.
//!
//! Quotes a single-hop conversion at the oracle's mid price minus a fee tier,
//! filled by one liquidity account (`pool`). Good enough for simulation and
//! for sizing a liquidation before a real venue is consulted.

use super::{RouteLeg, SwapParams, SwapRoute, SwapRouter};
use crate::oracle::PriceOracle;
use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::debug;

/// Fee denominator: fees are in hundredths of basis points.
const FEE_DENOMINATOR: u32 = 1_000_000;

/// Uniswap-style fee tiers (hundredths of basis points).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FeeTier {
    /// 0.01% - Ultra stable pairs (e.g., USDC/USDT)
    Lowest = 100,
    /// 0.05% - Stable pairs
    Low = 500,
    /// 0.3% - Standard pairs
    Medium = 3000,
    /// 1% - Exotic pairs
    High = 10000,
}

/// Router quoting at oracle prices.
#[derive(Debug, Clone)]
pub struct OracleRouter {
    oracle: Arc<dyn PriceOracle>,
    /// Liquidity account that fills the quote
    pool: Address,
    /// Fee in hundredths of basis points
    fee: u32,
}

impl OracleRouter {
    /// Create a router with a raw fee (hundredths of basis points).
    pub fn new(oracle: Arc<dyn PriceOracle>, pool: Address, fee: u32) -> Self {
        Self {
            oracle,
            pool,
            fee: fee.min(FEE_DENOMINATOR),
        }
    }

    /// Create a router using a standard fee tier.
    pub fn with_tier(oracle: Arc<dyn PriceOracle>, pool: Address, tier: FeeTier) -> Self {
        Self::new(oracle, pool, tier as u32)
    }

    /// The liquidity account this router quotes against.
    pub fn pool(&self) -> Address {
        self.pool
    }

    /// Fee in hundredths of basis points.
    pub fn fee(&self) -> u32 {
        self.fee
    }

    /// Convert `amount_in` at mid price, before fees.
    fn mid_quote(&self, params: &SwapParams, price_in: U256, price_out: U256) -> Result<U256> {
        let scale_in = U256::from(10u64).pow(U256::from(params.decimals_in));
        let scale_out = U256::from(10u64).pow(U256::from(params.decimals_out));

        // USD value at 1e18 scale, then back into output units
        let value = params
            .amount_in
            .checked_mul(price_in)
            .context("swap input value overflow")?
            / scale_in;
        let out = value
            .checked_mul(scale_out)
            .context("swap output overflow")?
            / price_out;
        Ok(out)
    }
}

impl SwapRouter for OracleRouter {
    fn name(&self) -> &str {
        "oracle"
    }

    fn quote(&self, params: &SwapParams) -> Result<SwapRoute> {
        let price_in = self
            .oracle
            .checked_price(params.token_in)
            .with_context(|| format!("no price for {}", params.token_in))?;
        let price_out = self
            .oracle
            .checked_price(params.token_out)
            .with_context(|| format!("no price for {}", params.token_out))?;

        let mid = self.mid_quote(params, price_in, price_out)?;
        let expected_output = mid * U256::from(FEE_DENOMINATOR - self.fee) / U256::from(FEE_DENOMINATOR);
        let slippage = U256::from(10_000u16.saturating_sub(params.slippage_bps));
        let min_output = expected_output * slippage / U256::from(10_000u16);

        debug!(
            token_in = %params.token_in,
            token_out = %params.token_out,
            amount_in = %params.amount_in,
            expected_output = %expected_output,
            fee = self.fee,
            "Oracle route quoted"
        );

        Ok(SwapRoute {
            router: self.name().to_string(),
            token_in: params.token_in,
            token_out: params.token_out,
            amount_in: params.amount_in,
            expected_output,
            min_output,
            legs: vec![RouteLeg {
                token_in: params.token_in,
                token_out: params.token_out,
                pool: self.pool,
                fee: self.fee,
                amount_in: params.amount_in,
                amount_out: expected_output,
            }],
        })
    }
}
