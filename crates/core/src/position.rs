//! Account position breakdown used by the liquidity computation.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::u256_math;

/// Collateral held in one entered market.
#[derive(Debug, Clone)]
pub struct CollateralEntry {
    /// Market (claim token) address
    pub market: Address,
    /// Underlying asset address
    pub asset: Address,
    /// Claim balance
    pub claims: U256,
    /// Claims converted at the market's exchange rate (underlying decimals)
    pub underlying_amount: U256,
    /// Oracle price (USD per whole token, 1e18)
    pub price: U256,
    /// Underlying decimals
    pub decimals: u8,
    /// Collateral factor (1e18)
    pub collateral_factor: U256,
    /// USD value (1e18)
    pub value_usd: U256,
    /// USD value weighted by the collateral factor (1e18)
    pub risk_adjusted_usd: U256,
}

/// Debt owed in one market.
#[derive(Debug, Clone)]
pub struct DebtEntry {
    /// Market (claim token) address
    pub market: Address,
    /// Underlying asset address
    pub asset: Address,
    /// Owed balance (underlying decimals)
    pub owed: U256,
    /// Oracle price (USD per whole token, 1e18)
    pub price: U256,
    /// Underlying decimals
    pub decimals: u8,
    /// USD value (1e18)
    pub value_usd: U256,
}

/// Excess collateral or shortfall, in USD at 1e18 scale.
///
/// At most one of the two fields is nonzero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountLiquidity {
    pub liquidity: U256,
    pub shortfall: U256,
}

impl AccountLiquidity {
    pub fn from_totals(collateral_usd: U256, debt_usd: U256) -> Self {
        if collateral_usd >= debt_usd {
            Self {
                liquidity: collateral_usd - debt_usd,
                shortfall: U256::ZERO,
            }
        } else {
            Self {
                liquidity: U256::ZERO,
                shortfall: debt_usd - collateral_usd,
            }
        }
    }

    /// Whether the account can be liquidated.
    pub fn is_liquidatable(&self) -> bool {
        !self.shortfall.is_zero()
    }

    /// Signed USD value for display: liquidity positive, shortfall negative.
    pub fn net_usd(&self) -> f64 {
        if self.is_liquidatable() {
            -u256_math::wad_to_f64(self.shortfall)
        } else {
            u256_math::wad_to_f64(self.liquidity)
        }
    }
}

/// Priced view of an account across all markets.
#[derive(Debug, Clone, Default)]
pub struct AccountPosition {
    pub account: Address,
    /// One entry per entered market
    pub collateral: SmallVec<[CollateralEntry; 4]>,
    /// One entry per market with nonzero debt
    pub debts: SmallVec<[DebtEntry; 4]>,
    /// Extra USD counted against the account by a hypothetical redeem/borrow
    pub hypothetical_usd: U256,
}

impl AccountPosition {
    pub fn new(account: Address) -> Self {
        Self {
            account,
            ..Default::default()
        }
    }

    pub fn total_collateral_usd(&self) -> U256 {
        self.collateral
            .iter()
            .fold(U256::ZERO, |acc, c| acc.saturating_add(c.value_usd))
    }

    pub fn total_risk_adjusted_usd(&self) -> U256 {
        self.collateral
            .iter()
            .fold(U256::ZERO, |acc, c| acc.saturating_add(c.risk_adjusted_usd))
    }

    /// Debt plus hypothetical effects.
    pub fn total_debt_usd(&self) -> U256 {
        self.debts
            .iter()
            .fold(self.hypothetical_usd, |acc, d| acc.saturating_add(d.value_usd))
    }

    pub fn liquidity(&self) -> AccountLiquidity {
        AccountLiquidity::from_totals(self.total_risk_adjusted_usd(), self.total_debt_usd())
    }

    /// Health factor (risk-adjusted collateral / debt). Display only.
    pub fn health_factor(&self) -> f64 {
        let debt = self.total_debt_usd();
        if debt.is_zero() {
            return f64::INFINITY;
        }
        u256_math::wad_to_f64(self.total_risk_adjusted_usd()) / u256_math::wad_to_f64(debt)
    }

    /// Get the largest collateral position by USD value.
    pub fn largest_collateral(&self) -> Option<&CollateralEntry> {
        self.collateral
            .iter()
            .filter(|c| !c.claims.is_zero())
            .max_by(|a, b| a.value_usd.cmp(&b.value_usd))
    }

    /// Get the largest debt position by USD value.
    pub fn largest_debt(&self) -> Option<&DebtEntry> {
        self.debts.iter().max_by(|a, b| a.value_usd.cmp(&b.value_usd))
    }

    pub fn debt_in(&self, market: Address) -> Option<&DebtEntry> {
        self.debts.iter().find(|d| d.market == market)
    }

    pub fn collateral_in(&self, market: Address) -> Option<&CollateralEntry> {
        self.collateral.iter().find(|c| c.market == market)
    }
}
