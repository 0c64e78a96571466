//! Flash-loan funded liquidation executor.
//!
//! One call borrows the debt asset, repays part of an underwater borrow,
//! redeems the seized collateral, converts it back into the debt asset, repays
//! the loan and hands the spread to the initiator. The whole chain is one
//! protocol transaction: any failing step restores the state from before the
//! call.

use alloy::primitives::{Address, U256};
use moneymarket_api::{SwapParams, SwapRoute, SwapRouterRegistry};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::error::{ProtocolError, ProtocolResult};
use crate::flash::FlashLiquiditySource;
use crate::protocol::Protocol;
use crate::u256_math;

/// Default tolerated gap between a route and the oracle's fair value (1%).
const DEFAULT_MAX_SLIPPAGE_BPS: u16 = 100;

/// Liquidation executor bound to one debt market.
#[derive(Debug, Clone)]
pub struct LiquidationExecutor {
    /// Ledger account the executor acts from
    address: Address,
    /// Market whose borrows this executor repays
    debt_market: Address,
    flash: Arc<dyn FlashLiquiditySource>,
    routers: SwapRouterRegistry,
    /// Slippage tolerance (basis points)
    max_slippage_bps: u16,
    /// Minimum profit in debt-asset units
    min_profit: U256,
}

impl LiquidationExecutor {
    pub fn new(
        address: Address,
        debt_market: Address,
        flash: Arc<dyn FlashLiquiditySource>,
        routers: SwapRouterRegistry,
    ) -> Self {
        Self {
            address,
            debt_market,
            flash,
            routers,
            max_slippage_bps: DEFAULT_MAX_SLIPPAGE_BPS,
            min_profit: U256::ZERO,
        }
    }

    /// Set slippage tolerance.
    pub fn with_max_slippage_bps(mut self, max_slippage_bps: u16) -> Self {
        self.max_slippage_bps = max_slippage_bps.min(10_000);
        self
    }

    /// Set minimum profit threshold (debt-asset units).
    pub fn with_min_profit(mut self, min_profit: U256) -> Self {
        self.min_profit = min_profit;
        self
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn debt_market(&self) -> Address {
        self.debt_market
    }

    pub fn min_profit(&self) -> U256 {
        self.min_profit
    }

    /// Liquidate `repay_amount` of `borrower`'s debt against
    /// `collateral_market` and pay the profit to `initiator`.
    #[instrument(skip(self, protocol), fields(borrower = %borrower, collateral = %collateral_market))]
    pub fn liquidate_entry(
        &self,
        protocol: &mut Protocol,
        initiator: Address,
        borrower: Address,
        repay_amount: U256,
        collateral_market: Address,
    ) -> ProtocolResult<LiquidationReport> {
        protocol.transaction(|p| {
            p.acquire_lock(self.address)?;
            let report = self.execute(p, initiator, borrower, repay_amount, collateral_market)?;
            p.release_lock(self.address);
            Ok(report)
        })
    }

    fn execute(
        &self,
        protocol: &mut Protocol,
        initiator: Address,
        borrower: Address,
        repay_amount: U256,
        collateral_market: Address,
    ) -> ProtocolResult<LiquidationReport> {
        let debt = protocol.market(self.debt_market)?;
        let debt_asset = debt.underlying();
        let debt_decimals = debt.underlying_decimals();
        let collateral = protocol.market(collateral_market)?;
        let collateral_asset = collateral.underlying();
        let collateral_decimals = collateral.underlying_decimals();

        let starting_balance = protocol.balance_of(debt_asset, self.address);
        let mut report = LiquidationReport {
            borrower,
            initiator,
            debt_market: self.debt_market,
            collateral_market,
            repaid: U256::ZERO,
            seized_claims: U256::ZERO,
            claims_to_reserves: U256::ZERO,
            collateral_redeemed: U256::ZERO,
            swap_output: None,
            flash_fee: U256::ZERO,
            profit: U256::ZERO,
        };

        info!(
            borrower = %borrower,
            debt_market = %self.debt_market,
            repay_amount = %repay_amount,
            flash_source = %self.flash.address(),
            "Starting flash liquidation"
        );

        let fee = self.flash.flash_loan(
            protocol,
            self.address,
            debt_asset,
            repay_amount,
            &mut |p, fee| {
                p.accrue_account(borrower, &[self.debt_market, collateral_market])?;
                p.liquidation_allowed(
                    self.address,
                    borrower,
                    self.debt_market,
                    collateral_market,
                    repay_amount,
                )?;

                p.approve(self.address, self.debt_market, debt_asset, repay_amount);
                let outcome = p.liquidate_borrow(
                    self.address,
                    borrower,
                    self.debt_market,
                    repay_amount,
                    collateral_market,
                )?;
                report.repaid = outcome.repaid;
                report.seized_claims = outcome.seizure.seized;
                report.claims_to_reserves = outcome.seizure.to_reserves;

                let redemption =
                    p.redeem(self.address, collateral_market, outcome.seizure.to_liquidator)?;
                report.collateral_redeemed = redemption.amount;

                if collateral_asset != debt_asset {
                    let output = self.swap(
                        p,
                        collateral_asset,
                        debt_asset,
                        redemption.amount,
                        collateral_decimals,
                        debt_decimals,
                    )?;
                    report.swap_output = Some(output);
                }

                let obligation = u256_math::add(repay_amount, fee)?;
                let proceeds = p
                    .balance_of(debt_asset, self.address)
                    .saturating_sub(starting_balance);
                if proceeds < obligation {
                    return Err(ProtocolError::proceeds(obligation, proceeds));
                }
                p.transfer(debt_asset, self.address, self.flash.address(), obligation)
            },
        )?;
        report.flash_fee = fee;

        let profit = protocol
            .balance_of(debt_asset, self.address)
            .saturating_sub(starting_balance);
        if profit < self.min_profit {
            debug!(profit = %profit, min_profit = %self.min_profit, "Profit below minimum");
            let obligation = u256_math::add(repay_amount, fee)?;
            return Err(ProtocolError::proceeds(
                u256_math::add(obligation, self.min_profit)?,
                u256_math::add(obligation, profit)?,
            ));
        }
        protocol.transfer(debt_asset, self.address, initiator, profit)?;
        report.profit = profit;

        info!(
            borrower = %borrower,
            initiator = %initiator,
            repaid = %report.repaid,
            seized = %report.seized_claims,
            redeemed = %report.collateral_redeemed,
            flash_fee = %fee,
            profit = u256_math::to_f64_units(profit, debt_decimals),
            "Flash liquidation complete"
        );
        Ok(report)
    }

    /// Quote and settle a conversion of `amount_in` against the route's pools.
    /// Returns what the executor actually received in `token_out`.
    fn swap(
        &self,
        protocol: &mut Protocol,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        decimals_in: u8,
        decimals_out: u8,
    ) -> ProtocolResult<U256> {
        let route = self.quote(protocol, token_in, token_out, amount_in, decimals_in, decimals_out)?;

        let before = protocol.balance_of(token_out, self.address);
        for leg in &route.legs {
            protocol.transfer(leg.token_in, self.address, leg.pool, leg.amount_in)?;
            protocol.transfer(leg.token_out, leg.pool, self.address, leg.amount_out)?;
        }
        let output = protocol
            .balance_of(token_out, self.address)
            .saturating_sub(before);
        debug!(
            token_in = %token_in,
            token_out = %token_out,
            amount_in = %amount_in,
            output = %output,
            legs = route.legs.len(),
            router = %route.router,
            "Swap settled"
        );
        Ok(output)
    }

    /// Get a route and check it against the oracle's fair value.
    fn quote(
        &self,
        protocol: &Protocol,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        decimals_in: u8,
        decimals_out: u8,
    ) -> ProtocolResult<SwapRoute> {
        let params = SwapParams::new(token_in, token_out, amount_in, decimals_in, decimals_out)
            .with_slippage_bps(self.max_slippage_bps);
        let route = self
            .routers
            .best_route(&params)
            .map_err(|e| ProtocolError::SwapFailed(e.to_string()))?;

        if route.token_in != token_in || route.token_out != token_out || route.amount_in != amount_in {
            return Err(ProtocolError::SwapFailed(format!(
                "route {} -> {} does not match the requested swap",
                route.token_in, route.token_out
            )));
        }
        if !route.is_consistent() {
            return Err(ProtocolError::SwapFailed(format!(
                "{} returned legs that do not chain",
                route.router
            )));
        }

        let engine = protocol.risk_engine();
        let value_usd = u256_math::usd_value(amount_in, engine.price(token_in)?, decimals_in)?;
        let fair = u256_math::amount_for_usd(value_usd, engine.price(token_out)?, decimals_out)?;
        let floor = u256_math::apply_basis_points(fair, self.max_slippage_bps);
        if route.expected_output < floor {
            return Err(ProtocolError::SwapFailed(format!(
                "route output {} below oracle floor {}",
                route.expected_output, floor
            )));
        }
        Ok(route)
    }

    /// Profit of liquidating the largest allowed slice of `borrower`'s debt
    /// against `collateral_market`. Reads a scratch copy of the protocol.
    pub fn estimate(
        &self,
        protocol: &Protocol,
        borrower: Address,
        collateral_market: Address,
    ) -> ProtocolResult<ProfitEstimate> {
        let mut scratch = protocol.clone();
        scratch.accrue_account(borrower, &[self.debt_market, collateral_market])?;

        let repay_amount = scratch.max_repay(borrower, self.debt_market)?;
        scratch.liquidation_allowed(
            self.address,
            borrower,
            self.debt_market,
            collateral_market,
            repay_amount,
        )?;

        let debt = scratch.market(self.debt_market)?;
        let debt_asset = debt.underlying();
        let debt_decimals = debt.underlying_decimals();
        let collateral = scratch.market(collateral_market)?;
        let collateral_asset = collateral.underlying();
        let collateral_decimals = collateral.underlying_decimals();
        let seize_share = collateral.protocol_seize_share();

        let seize_claims =
            scratch.liquidate_calculate_seize_claims(self.debt_market, collateral_market, repay_amount)?;
        let to_reserves = u256_math::wad_mul(seize_claims, seize_share)?;
        let rate = scratch.exchange_rate_stored(collateral_market)?;
        let collateral_amount = u256_math::wad_mul(seize_claims - to_reserves, rate)?;

        let expected_proceeds = if collateral_asset == debt_asset {
            collateral_amount
        } else {
            self.quote(
                &scratch,
                collateral_asset,
                debt_asset,
                collateral_amount,
                collateral_decimals,
                debt_decimals,
            )?
            .expected_output
        };

        let estimate = ProfitEstimate {
            repay_amount,
            seize_claims,
            collateral_amount,
            expected_proceeds,
            flash_fee: self.flash.flash_fee(debt_asset, repay_amount),
            decimals: debt_decimals,
        };
        debug!(borrower = %borrower, estimate = %estimate, "Liquidation estimated");
        Ok(estimate)
    }

    /// Entered market holding `borrower`'s largest collateral value.
    pub fn best_collateral(&self, protocol: &Protocol, borrower: Address) -> ProtocolResult<Option<Address>> {
        let position = protocol.account_position(borrower)?;
        Ok(position.largest_collateral().map(|c| c.market))
    }
}

/// Profit estimate breakdown for a liquidation, in debt-asset units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfitEstimate {
    /// Debt repaid (the close-factor maximum)
    pub repay_amount: U256,
    /// Claims seized from the borrower
    pub seize_claims: U256,
    /// Collateral underlying redeemed by the executor
    pub collateral_amount: U256,
    /// Debt asset expected back from redemption and swap
    pub expected_proceeds: U256,
    pub flash_fee: U256,
    /// Debt asset decimals
    pub decimals: u8,
}

impl ProfitEstimate {
    /// Flash loan principal plus fee.
    pub fn obligation(&self) -> U256 {
        self.repay_amount.saturating_add(self.flash_fee)
    }

    /// Proceeds left after the obligation; `None` when underwater.
    pub fn net_profit(&self) -> Option<U256> {
        self.expected_proceeds.checked_sub(self.obligation())
    }

    /// Check if the liquidation is profitable given a minimum threshold.
    pub fn is_profitable(&self, min_profit: U256) -> bool {
        self.net_profit().is_some_and(|profit| profit >= min_profit)
    }
}

impl fmt::Display for ProfitEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let units = |v: U256| u256_math::to_f64_units(v, self.decimals);
        let net = units(self.expected_proceeds) - units(self.obligation());
        write!(
            f,
            "proceeds={:.2} - repay={:.2} - fee={:.2} = net={:.2}",
            units(self.expected_proceeds),
            units(self.repay_amount),
            units(self.flash_fee),
            net
        )
    }
}

/// Result of a liquidation execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiquidationReport {
    pub borrower: Address,
    pub initiator: Address,
    pub debt_market: Address,
    pub collateral_market: Address,
    /// Debt repaid for the borrower
    pub repaid: U256,
    /// Claims taken from the borrower, including the reserves share
    pub seized_claims: U256,
    pub claims_to_reserves: U256,
    /// Collateral underlying redeemed by the executor
    pub collateral_redeemed: U256,
    /// Debt asset received from the swap leg, if there was one
    pub swap_output: Option<U256>,
    pub flash_fee: U256,
    /// Debt asset paid to the initiator
    pub profit: U256,
}
