//! Interest rate models.
//!
//! A model turns a market's cash, borrows and reserves into per-block rates.
//! The curve shape is pluggable; the engine only relies on the trait.

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::WAD;

/// Approximate number of blocks per year (15 second blocks).
pub const BLOCKS_PER_YEAR: u64 = 2_102_400;

/// Per-block interest rates, 1e18 scale.
pub trait InterestRateModel: Send + Sync + Debug {
    /// Borrow rate per block.
    fn borrow_rate(&self, cash: U256, borrows: U256, reserves: U256) -> U256;

    /// Supply rate per block: the borrow rate, minus the reserve cut, spread
    /// over the utilized share of the pool.
    fn supply_rate(&self, cash: U256, borrows: U256, reserves: U256, reserve_factor: U256) -> U256 {
        let one_minus_reserve_factor = WAD.saturating_sub(reserve_factor);
        let borrow_rate = self.borrow_rate(cash, borrows, reserves);
        let rate_to_pool = borrow_rate.saturating_mul(one_minus_reserve_factor) / WAD;
        utilization_rate(cash, borrows, reserves).saturating_mul(rate_to_pool) / WAD
    }

    /// `(borrow_rate, supply_rate)` per block.
    fn rates(&self, cash: U256, borrows: U256, reserves: U256, reserve_factor: U256) -> (U256, U256) {
        (
            self.borrow_rate(cash, borrows, reserves),
            self.supply_rate(cash, borrows, reserves, reserve_factor),
        )
    }
}

/// Utilization: `borrows / (cash + borrows - reserves)`, 1e18 scale.
pub fn utilization_rate(cash: U256, borrows: U256, reserves: U256) -> U256 {
    if borrows.is_zero() {
        return U256::ZERO;
    }
    let denominator = cash.saturating_add(borrows).saturating_sub(reserves);
    if denominator.is_zero() {
        return U256::ZERO;
    }
    borrows.saturating_mul(WAD) / denominator
}

/// Linear model: `base + utilization * multiplier`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitePaperInterestRateModel {
    /// Multiplier of utilization, per block
    pub multiplier_per_block: U256,
    /// Rate at zero utilization, per block
    pub base_rate_per_block: U256,
}

impl WhitePaperInterestRateModel {
    /// Build from yearly rates (1e18 scale).
    pub fn new(base_rate_per_year: U256, multiplier_per_year: U256) -> Self {
        let blocks = U256::from(BLOCKS_PER_YEAR);
        Self {
            base_rate_per_block: base_rate_per_year / blocks,
            multiplier_per_block: multiplier_per_year / blocks,
        }
    }

    /// A model that never charges interest.
    pub fn zero() -> Self {
        Self::new(U256::ZERO, U256::ZERO)
    }
}

impl InterestRateModel for WhitePaperInterestRateModel {
    fn borrow_rate(&self, cash: U256, borrows: U256, reserves: U256) -> U256 {
        let ur = utilization_rate(cash, borrows, reserves);
        (ur.saturating_mul(self.multiplier_per_block) / WAD).saturating_add(self.base_rate_per_block)
    }
}

/// Kinked model: linear up to `kink`, steeper `jump_multiplier` above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JumpRateModel {
    pub base_rate_per_block: U256,
    pub multiplier_per_block: U256,
    pub jump_multiplier_per_block: U256,
    /// Utilization at which the jump multiplier applies
    pub kink: U256,
}

impl JumpRateModel {
    /// Build from yearly rates (1e18 scale) and a kink utilization.
    pub fn new(
        base_rate_per_year: U256,
        multiplier_per_year: U256,
        jump_multiplier_per_year: U256,
        kink: U256,
    ) -> Self {
        let blocks = U256::from(BLOCKS_PER_YEAR);
        Self {
            base_rate_per_block: base_rate_per_year / blocks,
            multiplier_per_block: multiplier_per_year / blocks,
            jump_multiplier_per_block: jump_multiplier_per_year / blocks,
            kink,
        }
    }
}

impl InterestRateModel for JumpRateModel {
    fn borrow_rate(&self, cash: U256, borrows: U256, reserves: U256) -> U256 {
        let ur = utilization_rate(cash, borrows, reserves);
        if ur <= self.kink {
            return (ur.saturating_mul(self.multiplier_per_block) / WAD)
                .saturating_add(self.base_rate_per_block);
        }
        let normal_rate = (self.kink.saturating_mul(self.multiplier_per_block) / WAD)
            .saturating_add(self.base_rate_per_block);
        let excess = ur - self.kink;
        (excess.saturating_mul(self.jump_multiplier_per_block) / WAD).saturating_add(normal_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pct(p: u64) -> U256 {
        WAD * U256::from(p) / U256::from(100u64)
    }

    #[test]
    fn test_utilization_rate() {
        // No borrows
        assert_eq!(utilization_rate(U256::from(100u64), U256::ZERO, U256::ZERO), U256::ZERO);

        // 50 borrowed out of 100 total
        let ur = utilization_rate(U256::from(50u64), U256::from(50u64), U256::ZERO);
        assert_eq!(ur, pct(50));

        // Reserves shrink the denominator
        let ur = utilization_rate(U256::from(60u64), U256::from(50u64), U256::from(10u64));
        assert_eq!(ur, pct(50));
    }

    #[test]
    fn test_zero_model_charges_nothing() {
        let model = WhitePaperInterestRateModel::zero();
        let (borrow, supply) =
            model.rates(U256::from(1_000u64), U256::from(9_000u64), U256::ZERO, pct(10));
        assert_eq!(borrow, U256::ZERO);
        assert_eq!(supply, U256::ZERO);
    }

    #[test]
    fn test_white_paper_rates() {
        // 5% base, 20% multiplier per year
        let model = WhitePaperInterestRateModel::new(pct(5), pct(20));
        let cash = U256::from(500u64);
        let borrows = U256::from(500u64);

        let borrow = model.borrow_rate(cash, borrows, U256::ZERO);
        // 5% + 50% * 20% = 15% per year
        let expected = model.base_rate_per_block + model.multiplier_per_block / U256::from(2u64);
        assert_eq!(borrow, expected);

        // Supply earns on half the pool, minus a 10% reserve cut
        let supply = model.supply_rate(cash, borrows, U256::ZERO, pct(10));
        assert!(supply < borrow);
        assert!(supply > U256::ZERO);
    }

    #[test]
    fn test_jump_rate_above_kink() {
        let model = JumpRateModel::new(pct(2), pct(10), pct(200), pct(80));

        let below = model.borrow_rate(U256::from(30u64), U256::from(70u64), U256::ZERO);
        let at_kink = model.borrow_rate(U256::from(20u64), U256::from(80u64), U256::ZERO);
        let above = model.borrow_rate(U256::from(10u64), U256::from(90u64), U256::ZERO);

        assert!(below < at_kink);
        // Slope above the kink is much steeper than below it
        assert!(above - at_kink > (at_kink - below) * U256::from(5u64));
    }
}
