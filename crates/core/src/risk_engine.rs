//! Risk engine: membership, collateral factors and per-operation authorization.
//!
//! The engine owns the risk parameters and market memberships. Market state
//! is read through a [`MarketsView`] so every decision is made against the
//! same snapshot the protocol is about to mutate.

use alloy::primitives::{Address, U256};
use moneymarket_api::PriceOracle;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{DenyReason, ProtocolError, ProtocolResult};
use crate::market::{MarketStatus, MarketsView};
use crate::position::{AccountLiquidity, AccountPosition, CollateralEntry, DebtEntry};
use crate::u256_math::{self, WAD};

/// Maximum collateral factor (0.9).
pub const COLLATERAL_FACTOR_MAX: U256 =
    U256::from_limbs([900_000_000_000_000_000u64, 0, 0, 0]);

/// Proof of administrative authority.
///
/// Only the protocol constructor hands one out; every risk-parameter
/// mutation takes it by reference.
#[derive(Debug)]
pub struct AdminCap {
    _private: (),
}

impl AdminCap {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

/// Operations gated by [`RiskEngine::authorize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Mint,
    Redeem,
    Borrow,
    Repay,
    Transfer,
}

/// Engine-wide liquidation parameters (1e18 mantissas).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskParameters {
    /// Fraction of a borrow repayable in one liquidation
    pub close_factor: U256,
    /// Collateral received per unit of debt repaid (>= 1)
    pub liquidation_incentive: U256,
}

impl Default for RiskParameters {
    fn default() -> Self {
        Self {
            close_factor: WAD / U256::from(2u64),
            liquidation_incentive: u256_math::f64_to_wad(1.08),
        }
    }
}

impl RiskParameters {
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.close_factor.is_zero() || self.close_factor > WAD {
            return Err(ProtocolError::InvalidParameter(
                "close factor must be in (0, 1]".to_string(),
            ));
        }
        if self.liquidation_incentive < WAD {
            return Err(ProtocolError::InvalidParameter(
                "liquidation incentive below 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-market risk parameters. Present only for listed markets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketRiskParams {
    /// Share of collateral value counted toward borrowing power (1e18)
    pub collateral_factor: U256,
    /// Maximum total borrows in underlying units (0 = unlimited)
    pub borrow_cap: U256,
    /// Maximum total supply in underlying units (0 = unlimited)
    pub supply_cap: U256,
    pub mint_paused: bool,
    pub borrow_paused: bool,
}

impl MarketRiskParams {
    pub fn status(&self) -> MarketStatus {
        if self.mint_paused || self.borrow_paused {
            MarketStatus::Paused
        } else {
            MarketStatus::Listed
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskEngine {
    id: Address,
    oracle: Arc<dyn PriceOracle>,
    params: RiskParameters,
    markets: HashMap<Address, MarketRiskParams>,
    memberships: HashMap<Address, SmallVec<[Address; 4]>>,
}

impl RiskEngine {
    /// Engine with default parameters (close factor 0.5, incentive 1.08).
    pub fn new(id: Address, oracle: Arc<dyn PriceOracle>) -> Self {
        Self {
            id,
            oracle,
            params: RiskParameters::default(),
            markets: HashMap::new(),
            memberships: HashMap::new(),
        }
    }

    pub fn with_parameters(
        id: Address,
        oracle: Arc<dyn PriceOracle>,
        params: RiskParameters,
    ) -> ProtocolResult<Self> {
        params.validate()?;
        Ok(Self {
            params,
            ..Self::new(id, oracle)
        })
    }

    /// Identifier markets record as their controller.
    pub fn id(&self) -> Address {
        self.id
    }

    pub fn oracle(&self) -> &Arc<dyn PriceOracle> {
        &self.oracle
    }

    pub fn params(&self) -> RiskParameters {
        self.params
    }

    pub fn close_factor(&self) -> U256 {
        self.params.close_factor
    }

    pub fn liquidation_incentive(&self) -> U256 {
        self.params.liquidation_incentive
    }

    pub fn market_params(&self, market: Address) -> Option<&MarketRiskParams> {
        self.markets.get(&market)
    }

    pub fn is_listed(&self, market: Address) -> bool {
        self.markets.contains_key(&market)
    }

    pub fn status(&self, market: Address) -> MarketStatus {
        self.markets
            .get(&market)
            .map(|p| p.status())
            .unwrap_or(MarketStatus::Unlisted)
    }

    /// Markets `account` has entered, in entry order.
    pub fn memberships(&self, account: Address) -> &[Address] {
        self.memberships
            .get(&account)
            .map(|m| m.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_member(&self, account: Address, market: Address) -> bool {
        self.memberships(account).contains(&market)
    }

    /// Oracle price of `asset`, rejecting missing or zero prices.
    pub fn price(&self, asset: Address) -> Result<U256, DenyReason> {
        self.oracle
            .checked_price(asset)
            .ok_or(DenyReason::PriceUnavailable)
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Enter each market as collateral. Entering twice is a no-op.
    pub fn enter_markets(&mut self, account: Address, markets: &[Address]) -> ProtocolResult<()> {
        if let Some(unlisted) = markets.iter().find(|m| !self.is_listed(**m)) {
            debug!(account = %account, market = %unlisted, "Enter denied: market not listed");
            return Err(DenyReason::MarketNotListed.into());
        }

        let entered = self.memberships.entry(account).or_default();
        for market in markets {
            if !entered.contains(market) {
                entered.push(*market);
                info!(account = %account, market = %market, "Market entered");
            }
        }
        Ok(())
    }

    /// Stop using `market` as collateral.
    ///
    /// Fails with `NonzeroBalance` while the account owes debt there or while
    /// removing its collateral would leave it short.
    pub fn exit_market(
        &mut self,
        view: MarketsView<'_>,
        account: Address,
        market: Address,
    ) -> ProtocolResult<()> {
        if !self.is_member(account, market) {
            return Ok(());
        }

        let state = view.market(market)?;
        if !state.borrow_balance(account)?.is_zero() {
            return Err(ProtocolError::NonzeroBalance);
        }
        let claims = state.claims_of(account);
        let after = self.hypothetical_liquidity(view, account, market, claims, U256::ZERO)?;
        if after.is_liquidatable() {
            return Err(ProtocolError::NonzeroBalance);
        }

        if let Some(entered) = self.memberships.get_mut(&account) {
            entered.retain(|m| *m != market);
        }
        info!(account = %account, market = %market, "Market exited");
        Ok(())
    }

    // ========================================================================
    // Liquidity
    // ========================================================================

    /// Priced breakdown of `account`, with an optional hypothetical redeem of
    /// `redeem_claims` and borrow of `borrow_amount` in `modify`.
    pub fn account_position(
        &self,
        view: MarketsView<'_>,
        account: Address,
        modify: Option<Address>,
        redeem_claims: U256,
        borrow_amount: U256,
    ) -> ProtocolResult<AccountPosition> {
        let mut position = AccountPosition::new(account);

        for &address in self.memberships(account) {
            let market = view.market(address)?;
            let claims = market.claims_of(account);
            let redeeming = if modify == Some(address) {
                redeem_claims
            } else {
                U256::ZERO
            };
            if claims.is_zero() && redeeming.is_zero() {
                continue;
            }

            let collateral_factor = self
                .markets
                .get(&address)
                .map(|p| p.collateral_factor)
                .unwrap_or(U256::ZERO);
            let price = self.price(market.underlying())?;
            let decimals = market.underlying_decimals();
            let rate = view.exchange_rate(market)?;

            let underlying_amount = u256_math::wad_mul(claims, rate)?;
            let value_usd = u256_math::usd_value(underlying_amount, price, decimals)?;
            let risk_adjusted_usd = u256_math::wad_mul(value_usd, collateral_factor)?;

            if !redeeming.is_zero() {
                let redeemed = u256_math::wad_mul(redeeming, rate)?;
                let redeemed_usd = u256_math::usd_value(redeemed, price, decimals)?;
                position.hypothetical_usd = u256_math::add(
                    position.hypothetical_usd,
                    u256_math::wad_mul(redeemed_usd, collateral_factor)?,
                )?;
            }

            position.collateral.push(CollateralEntry {
                market: address,
                asset: market.underlying(),
                claims,
                underlying_amount,
                price,
                decimals,
                collateral_factor,
                value_usd,
                risk_adjusted_usd,
            });
        }

        // Debt counts in every market, entered or not
        for market in view.iter() {
            let owed = market.borrow_balance(account)?;
            let borrowing = if modify == Some(market.address()) {
                borrow_amount
            } else {
                U256::ZERO
            };
            if owed.is_zero() && borrowing.is_zero() {
                continue;
            }

            let price = self.price(market.underlying())?;
            let decimals = market.underlying_decimals();

            if !borrowing.is_zero() {
                position.hypothetical_usd = u256_math::add(
                    position.hypothetical_usd,
                    u256_math::usd_value(borrowing, price, decimals)?,
                )?;
            }
            if !owed.is_zero() {
                position.debts.push(DebtEntry {
                    market: market.address(),
                    asset: market.underlying(),
                    owed,
                    price,
                    decimals,
                    value_usd: u256_math::usd_value(owed, price, decimals)?,
                });
            }
        }

        Ok(position)
    }

    /// Liquidity or shortfall of `account` against stored market state.
    pub fn account_liquidity(
        &self,
        view: MarketsView<'_>,
        account: Address,
    ) -> ProtocolResult<AccountLiquidity> {
        self.account_position(view, account, None, U256::ZERO, U256::ZERO)
            .map(|p| p.liquidity())
    }

    /// Liquidity after hypothetically redeeming `redeem_claims` and
    /// borrowing `borrow_amount` in `market`.
    pub fn hypothetical_liquidity(
        &self,
        view: MarketsView<'_>,
        account: Address,
        market: Address,
        redeem_claims: U256,
        borrow_amount: U256,
    ) -> ProtocolResult<AccountLiquidity> {
        self.account_position(view, account, Some(market), redeem_claims, borrow_amount)
            .map(|p| p.liquidity())
    }

    // ========================================================================
    // Authorization
    // ========================================================================

    /// Allow or deny `operation` by `account` on `market`.
    ///
    /// `amount` is underlying for mint/borrow/repay and claims for
    /// redeem/transfer. Failures while pricing the account deny the
    /// operation.
    pub fn authorize(
        &self,
        view: MarketsView<'_>,
        operation: Operation,
        account: Address,
        market: Address,
        amount: U256,
    ) -> Result<(), DenyReason> {
        let result = self.check(view, operation, account, market, amount);
        if let Err(reason) = result {
            debug!(
                ?operation,
                account = %account,
                market = %market,
                amount = %amount,
                %reason,
                "Operation denied"
            );
        }
        result
    }

    fn check(
        &self,
        view: MarketsView<'_>,
        operation: Operation,
        account: Address,
        market: Address,
        amount: U256,
    ) -> Result<(), DenyReason> {
        let params = self
            .markets
            .get(&market)
            .ok_or(DenyReason::MarketNotListed)?;

        match operation {
            Operation::Mint => {
                if params.mint_paused {
                    return Err(DenyReason::MarketPaused);
                }
                if !params.supply_cap.is_zero() {
                    let state = view.market(market).map_err(|_| DenyReason::MarketNotListed)?;
                    let supplied = view
                        .exchange_rate(state)
                        .and_then(|rate| Ok(u256_math::wad_mul(state.total_supply(), rate)?))
                        .map_err(Self::deny)?;
                    let next = supplied
                        .checked_add(amount)
                        .ok_or(DenyReason::SupplyCapExceeded)?;
                    if next > params.supply_cap {
                        return Err(DenyReason::SupplyCapExceeded);
                    }
                }
                Ok(())
            }
            Operation::Redeem | Operation::Transfer => {
                if !self.is_member(account, market) {
                    return Ok(());
                }
                let after = self
                    .hypothetical_liquidity(view, account, market, amount, U256::ZERO)
                    .map_err(Self::deny)?;
                if after.is_liquidatable() {
                    return Err(DenyReason::InsufficientCollateral);
                }
                Ok(())
            }
            Operation::Borrow => {
                if params.borrow_paused {
                    return Err(DenyReason::MarketPaused);
                }
                let state = view.market(market).map_err(|_| DenyReason::MarketNotListed)?;
                self.price(state.underlying())?;
                if !params.borrow_cap.is_zero() {
                    let next = state
                        .total_borrows()
                        .checked_add(amount)
                        .ok_or(DenyReason::BorrowCapExceeded)?;
                    if next > params.borrow_cap {
                        return Err(DenyReason::BorrowCapExceeded);
                    }
                }
                let after = self
                    .hypothetical_liquidity(view, account, market, U256::ZERO, amount)
                    .map_err(Self::deny)?;
                if after.is_liquidatable() {
                    return Err(DenyReason::InsufficientCollateral);
                }
                Ok(())
            }
            Operation::Repay => Ok(()),
        }
    }

    /// Whether `liquidator` may repay `repay_amount` of `borrower`'s debt in
    /// `repay_market` and seize from `collateral_market`.
    pub fn liquidation_allowed(
        &self,
        view: MarketsView<'_>,
        liquidator: Address,
        borrower: Address,
        repay_market: Address,
        collateral_market: Address,
        repay_amount: U256,
    ) -> Result<(), DenyReason> {
        let result = (|| {
            if !self.is_listed(repay_market) || !self.is_listed(collateral_market) {
                return Err(DenyReason::MarketNotListed);
            }
            if liquidator == borrower {
                return Err(DenyReason::SelfLiquidation);
            }
            let liquidity = self
                .account_liquidity(view, borrower)
                .map_err(Self::deny)?;
            if !liquidity.is_liquidatable() {
                return Err(DenyReason::InsufficientShortfall);
            }
            let max_repay = self
                .max_repay(view, borrower, repay_market)
                .map_err(Self::deny)?;
            if repay_amount > max_repay {
                return Err(DenyReason::TooMuchRepay);
            }
            Ok(())
        })();

        if let Err(reason) = result {
            debug!(
                borrower = %borrower,
                repay_market = %repay_market,
                collateral_market = %collateral_market,
                repay_amount = %repay_amount,
                %reason,
                "Liquidation denied"
            );
        }
        result
    }

    /// Whether claims of `collateral_market` may be seized for a repayment in
    /// `borrowed_market`.
    pub fn seize_allowed(
        &self,
        view: MarketsView<'_>,
        collateral_market: Address,
        borrowed_market: Address,
        liquidator: Address,
        borrower: Address,
    ) -> Result<(), DenyReason> {
        if !self.is_listed(collateral_market) || !self.is_listed(borrowed_market) {
            return Err(DenyReason::MarketNotListed);
        }
        let collateral = view
            .market(collateral_market)
            .map_err(|_| DenyReason::MarketNotListed)?;
        let borrowed = view
            .market(borrowed_market)
            .map_err(|_| DenyReason::MarketNotListed)?;
        if collateral.controller() != borrowed.controller() {
            return Err(DenyReason::ControllerMismatch);
        }
        if liquidator == borrower {
            return Err(DenyReason::SelfLiquidation);
        }
        Ok(())
    }

    /// Claims of `collateral_market` owed to a liquidator repaying
    /// `repay_amount` in `repay_market`.
    ///
    /// `usd(repay) * incentive`, converted to collateral underlying at its
    /// price and decimals, then to claims at the stored exchange rate.
    pub fn liquidate_calculate_seize_claims(
        &self,
        view: MarketsView<'_>,
        repay_market: Address,
        collateral_market: Address,
        repay_amount: U256,
    ) -> ProtocolResult<U256> {
        let borrowed = view.market(repay_market)?;
        let collateral = view.market(collateral_market)?;
        let borrowed_price = self.price(borrowed.underlying())?;
        let collateral_price = self.price(collateral.underlying())?;

        let repay_usd =
            u256_math::usd_value(repay_amount, borrowed_price, borrowed.underlying_decimals())?;
        let seize_usd = u256_math::wad_mul(repay_usd, self.params.liquidation_incentive)?;
        let seize_underlying = u256_math::amount_for_usd(
            seize_usd,
            collateral_price,
            collateral.underlying_decimals(),
        )?;
        let rate = view.exchange_rate(collateral)?;
        Ok(u256_math::wad_div(seize_underlying, rate)?)
    }

    /// Largest repayment a single liquidation may make: `close_factor * owed`.
    pub fn max_repay(
        &self,
        view: MarketsView<'_>,
        borrower: Address,
        repay_market: Address,
    ) -> ProtocolResult<U256> {
        let owed = view.market(repay_market)?.borrow_balance(borrower)?;
        Ok(u256_math::wad_mul(owed, self.params.close_factor)?)
    }

    fn deny(err: ProtocolError) -> DenyReason {
        match err.deny_reason() {
            Some(reason) => reason,
            None => {
                debug!(error = %err, "Pricing failed during authorization");
                DenyReason::InsufficientCollateral
            }
        }
    }

    // ========================================================================
    // Administration
    // ========================================================================

    /// List a market. One-time.
    pub fn list_market(&mut self, _admin: &AdminCap, market: Address) -> ProtocolResult<()> {
        if self.is_listed(market) {
            return Err(ProtocolError::MarketAlreadyListed(market));
        }
        self.markets.insert(market, MarketRiskParams::default());
        info!(market = %market, "Market listed");
        Ok(())
    }

    pub fn set_price_oracle(&mut self, _admin: &AdminCap, oracle: Arc<dyn PriceOracle>) {
        self.oracle = oracle;
        info!("Price oracle updated");
    }

    pub fn set_close_factor(&mut self, _admin: &AdminCap, close_factor: U256) -> ProtocolResult<()> {
        let params = RiskParameters {
            close_factor,
            ..self.params
        };
        params.validate()?;
        self.params = params;
        info!(close_factor = u256_math::wad_to_f64(close_factor), "Close factor updated");
        Ok(())
    }

    pub fn set_liquidation_incentive(
        &mut self,
        _admin: &AdminCap,
        incentive: U256,
    ) -> ProtocolResult<()> {
        let params = RiskParameters {
            liquidation_incentive: incentive,
            ..self.params
        };
        params.validate()?;
        self.params = params;
        info!(
            liquidation_incentive = u256_math::wad_to_f64(incentive),
            "Liquidation incentive updated"
        );
        Ok(())
    }

    /// Set the collateral factor of `market`, whose underlying is `asset`.
    /// A nonzero factor requires a live price.
    pub fn set_collateral_factor(
        &mut self,
        _admin: &AdminCap,
        market: Address,
        asset: Address,
        collateral_factor: U256,
    ) -> ProtocolResult<()> {
        if collateral_factor > COLLATERAL_FACTOR_MAX {
            return Err(ProtocolError::InvalidParameter(
                "collateral factor above 0.9".to_string(),
            ));
        }
        if !collateral_factor.is_zero() {
            self.price(asset)?;
        }
        self.listed_mut(market)?.collateral_factor = collateral_factor;
        info!(
            market = %market,
            collateral_factor = u256_math::wad_to_f64(collateral_factor),
            "Collateral factor updated"
        );
        Ok(())
    }

    pub fn set_borrow_cap(&mut self, _admin: &AdminCap, market: Address, cap: U256) -> ProtocolResult<()> {
        self.listed_mut(market)?.borrow_cap = cap;
        info!(market = %market, cap = %cap, "Borrow cap updated");
        Ok(())
    }

    pub fn set_supply_cap(&mut self, _admin: &AdminCap, market: Address, cap: U256) -> ProtocolResult<()> {
        self.listed_mut(market)?.supply_cap = cap;
        info!(market = %market, cap = %cap, "Supply cap updated");
        Ok(())
    }

    pub fn set_mint_paused(&mut self, _admin: &AdminCap, market: Address, paused: bool) -> ProtocolResult<()> {
        self.listed_mut(market)?.mint_paused = paused;
        info!(market = %market, paused, "Mint pause updated");
        Ok(())
    }

    pub fn set_borrow_paused(&mut self, _admin: &AdminCap, market: Address, paused: bool) -> ProtocolResult<()> {
        self.listed_mut(market)?.borrow_paused = paused;
        info!(market = %market, paused, "Borrow pause updated");
        Ok(())
    }

    /// Pause or resume both mint and borrow.
    pub fn set_market_paused(&mut self, admin: &AdminCap, market: Address, paused: bool) -> ProtocolResult<()> {
        self.set_mint_paused(admin, market, paused)?;
        self.set_borrow_paused(admin, market, paused)
    }

    fn listed_mut(&mut self, market: Address) -> ProtocolResult<&mut MarketRiskParams> {
        self.markets
            .get_mut(&market)
            .ok_or(ProtocolError::AuthorizationDenied(DenyReason::MarketNotListed))
    }
}
