//! Quotes for the conversion leg of a flash liquidation.
//!
//! Seized collateral usually differs from the asset owed to the flash
//! source, so the liquidator converts one into the other before repaying.
//! A [`SwapRouter`] only prices that conversion: it returns the legs to
//! settle and the output to expect. Moving balances is left to the caller.
//!
//! ```rust,ignore
//! use moneymarket_api::swap::{OracleRouter, SwapParams, SwapRouterRegistry};
//!
//! let routers = SwapRouterRegistry::new()
//!     .with_router(Arc::new(OracleRouter::new(oracle, venue, 3000)));
//! let route = routers.best_route(&SwapParams::new(wbtc, usdt, seized, 8, 6))?;
//! ```

mod oracle_router;

pub use oracle_router::{FeeTier, OracleRouter};

use alloy::primitives::{Address, U256};
use anyhow::{bail, Result};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

/// Slippage allowed when the caller does not choose one.
pub const DEFAULT_SLIPPAGE_BPS: u16 = 50;

/// What the caller wants converted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapParams {
    pub token_in: Address,
    pub token_out: Address,
    /// Raw input amount in `token_in` units
    pub amount_in: U256,
    pub decimals_in: u8,
    pub decimals_out: u8,
    /// `min_output` sits this far below the expected output
    pub slippage_bps: u16,
}

impl SwapParams {
    pub fn new(
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        decimals_in: u8,
        decimals_out: u8,
    ) -> Self {
        Self {
            token_in,
            token_out,
            amount_in,
            decimals_in,
            decimals_out,
            slippage_bps: DEFAULT_SLIPPAGE_BPS,
        }
    }

    pub fn with_slippage_bps(mut self, slippage_bps: u16) -> Self {
        self.slippage_bps = slippage_bps.min(10_000);
        self
    }
}

/// One settlement step: `amount_in` goes to `pool`, `amount_out` comes back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteLeg {
    pub token_in: Address,
    pub token_out: Address,
    pub pool: Address,
    /// Hundredths of a basis point
    pub fee: u32,
    pub amount_in: U256,
    pub amount_out: U256,
}

/// A priced conversion. Legs settle in order, each feeding the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapRoute {
    /// Router that produced the quote
    pub router: String,
    pub token_in: Address,
    pub token_out: Address,
    pub amount_in: U256,
    pub expected_output: U256,
    pub min_output: U256,
    pub legs: Vec<RouteLeg>,
}

impl SwapRoute {
    /// Every asset the route touches, input first.
    pub fn path(&self) -> Vec<Address> {
        let mut path = vec![self.token_in];
        path.extend(self.legs.iter().map(|leg| leg.token_out));
        path
    }

    pub fn is_direct(&self) -> bool {
        self.legs.len() == 1
    }

    /// Legs chain from `token_in` to `token_out` and the last leg pays
    /// `expected_output`.
    pub fn is_consistent(&self) -> bool {
        let Some(last) = self.legs.last() else {
            return false;
        };
        let chained = self
            .legs
            .windows(2)
            .all(|w| w[0].token_out == w[1].token_in && w[0].amount_out == w[1].amount_in);
        self.legs[0].token_in == self.token_in
            && self.legs[0].amount_in == self.amount_in
            && last.token_out == self.token_out
            && last.amount_out == self.expected_output
            && chained
    }
}

/// Prices conversions between assets.
pub trait SwapRouter: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn quote(&self, params: &SwapParams) -> Result<SwapRoute>;
}

/// Set of routers queried together.
#[derive(Debug, Default, Clone)]
pub struct SwapRouterRegistry {
    routers: Vec<Arc<dyn SwapRouter>>,
}

impl SwapRouterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_router(mut self, router: Arc<dyn SwapRouter>) -> Self {
        self.routers.push(router);
        self
    }

    pub fn router(&self, name: &str) -> Option<Arc<dyn SwapRouter>> {
        self.routers.iter().find(|r| r.name() == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.routers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }

    /// Ask every router and keep the quote paying the most. Ties go to the
    /// router registered first. Fails only when no router can quote.
    pub fn best_route(&self, params: &SwapParams) -> Result<SwapRoute> {
        let mut best: Option<SwapRoute> = None;
        let mut failures = Vec::new();

        for router in &self.routers {
            match router.quote(params) {
                Ok(route) if !route.is_consistent() => {
                    failures.push(format!("{}: inconsistent route", router.name()));
                }
                Ok(route) => {
                    if best.as_ref().map_or(true, |b| route.expected_output > b.expected_output) {
                        best = Some(route);
                    }
                }
                Err(e) => {
                    debug!(router = router.name(), error = %e, "Router could not quote");
                    failures.push(format!("{}: {}", router.name(), e));
                }
            }
        }

        match best {
            Some(route) => Ok(route),
            None if failures.is_empty() => bail!(
                "no router registered for {} -> {}",
                params.token_in,
                params.token_out
            ),
            None => bail!(
                "no route for {} -> {} ({})",
                params.token_in,
                params.token_out,
                failures.join("; ")
            ),
        }
    }
}
