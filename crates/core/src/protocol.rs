//! Protocol world state and the entry point for every state change.
//!
//! Each public operation runs inside [`Protocol::transaction`]: a snapshot
//! is taken before the closure runs and restored if it returns an error, so
//! an operation either commits every effect or none. Operations nest; the
//! outermost failing transaction is the one that logs the revert.

use alloy::primitives::{Address, U256};
use moneymarket_api::{InterestRateModel, PriceOracle};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::assets::{Asset, AssetRegistry};
use crate::error::{ProtocolError, ProtocolResult};
use crate::ledger::TokenLedger;
use crate::market::{Market, MarketParams, MarketStatus, MarketsView, Seizure};
use crate::position::{AccountLiquidity, AccountPosition};
use crate::risk_engine::{AdminCap, Operation, RiskEngine, RiskParameters};
use crate::u256_math;

/// Identifier of the protocol's own risk engine.
pub const RISK_ENGINE_ID: Address = Address::repeat_byte(0xcc);

/// Result of a redemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redemption {
    /// Claims burned
    pub claims: U256,
    /// Underlying paid out
    pub amount: U256,
}

/// `(claims, owed, exchange_rate)` of an account in one market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub claims: U256,
    pub owed: U256,
    pub exchange_rate: U256,
}

/// Result of a liquidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationOutcome {
    /// Debt actually repaid
    pub repaid: U256,
    /// Claims taken from the borrower and how they were split
    pub seizure: Seizure,
}

#[derive(Debug, Clone)]
pub struct Protocol {
    ledger: TokenLedger,
    assets: AssetRegistry,
    markets: BTreeMap<Address, Market>,
    risk: RiskEngine,
    block: u64,
    /// Held re-entrancy locks
    locks: HashSet<Address>,
    /// Nesting depth of open transactions
    depth: usize,
}

impl Protocol {
    /// Create an empty protocol with default risk parameters.
    ///
    /// The returned [`AdminCap`] is the only way to mutate risk parameters.
    pub fn new(oracle: Arc<dyn PriceOracle>) -> (Self, AdminCap) {
        Self::from_engine(RiskEngine::new(RISK_ENGINE_ID, oracle))
    }

    pub fn with_parameters(
        oracle: Arc<dyn PriceOracle>,
        params: RiskParameters,
    ) -> ProtocolResult<(Self, AdminCap)> {
        Ok(Self::from_engine(RiskEngine::with_parameters(
            RISK_ENGINE_ID,
            oracle,
            params,
        )?))
    }

    fn from_engine(risk: RiskEngine) -> (Self, AdminCap) {
        let protocol = Self {
            ledger: TokenLedger::new(),
            assets: AssetRegistry::new(),
            markets: BTreeMap::new(),
            risk,
            block: 0,
            locks: HashSet::new(),
            depth: 0,
        };
        (protocol, AdminCap::new())
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Run `f` atomically: on error every effect of `f` is rolled back.
    pub fn transaction<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> ProtocolResult<T>,
    ) -> ProtocolResult<T> {
        self.atomic("transaction", f)
    }

    /// Snapshots are clones, but market claim/borrow tables and ledger tables
    /// are copy-on-write, so a snapshot costs one copy per table the
    /// operation actually writes.
    fn atomic<T>(
        &mut self,
        operation: &'static str,
        f: impl FnOnce(&mut Self) -> ProtocolResult<T>,
    ) -> ProtocolResult<T> {
        let snapshot = self.clone();
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;

        if let Err(err) = &result {
            *self = snapshot;
            if self.depth == 0 {
                warn!(operation, error = %err, "Operation reverted");
            } else {
                debug!(operation, error = %err, depth = self.depth, "Nested operation reverted");
            }
        }
        result
    }

    /// Take the re-entrancy lock `key`.
    pub fn acquire_lock(&mut self, key: Address) -> ProtocolResult<()> {
        if !self.locks.insert(key) {
            return Err(ProtocolError::Reentrancy);
        }
        Ok(())
    }

    pub fn release_lock(&mut self, key: Address) {
        self.locks.remove(&key);
    }

    pub fn is_locked(&self, key: Address) -> bool {
        self.locks.contains(&key)
    }

    // ========================================================================
    // Blocks
    // ========================================================================

    pub fn block(&self) -> u64 {
        self.block
    }

    pub fn advance_blocks(&mut self, blocks: u64) -> ProtocolResult<u64> {
        self.block = self
            .block
            .checked_add(blocks)
            .ok_or(ProtocolError::MathOverflow)?;
        debug!(block = self.block, "Blocks advanced");
        Ok(self.block)
    }

    /// Move to `block`. Blocks never go backwards.
    pub fn set_block(&mut self, block: u64) -> ProtocolResult<()> {
        if block < self.block {
            return Err(ProtocolError::InvalidParameter(format!(
                "block {} is before current block {}",
                block, self.block
            )));
        }
        self.block = block;
        Ok(())
    }

    // ========================================================================
    // Assets and balances
    // ========================================================================

    pub fn register_asset(&mut self, _admin: &AdminCap, asset: Asset) -> ProtocolResult<()> {
        info!(asset = %asset.address, symbol = %asset.symbol, decimals = asset.decimals, "Asset registered");
        self.assets.register(asset)
    }

    pub fn assets(&self) -> &AssetRegistry {
        &self.assets
    }

    pub fn ledger(&self) -> &TokenLedger {
        &self.ledger
    }

    /// Issue `amount` of a registered asset to `to`. Setup only.
    pub fn faucet(&mut self, asset: Address, to: Address, amount: U256) -> ProtocolResult<()> {
        if !self.assets.contains(&asset) {
            return Err(ProtocolError::UnknownAsset(asset));
        }
        self.ledger.faucet(asset, to, amount)
    }

    pub fn approve(&mut self, owner: Address, spender: Address, asset: Address, amount: U256) {
        self.ledger.approve(asset, owner, spender, amount);
    }

    pub fn transfer(
        &mut self,
        asset: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> ProtocolResult<()> {
        self.ledger.transfer(asset, from, to, amount)
    }

    pub fn balance_of(&self, asset: Address, holder: Address) -> U256 {
        self.ledger.balance_of(asset, holder)
    }

    pub fn allowance(&self, asset: Address, owner: Address, spender: Address) -> U256 {
        self.ledger.allowance(asset, owner, spender)
    }

    // ========================================================================
    // Markets: views
    // ========================================================================

    pub fn view(&self) -> MarketsView<'_> {
        MarketsView::new(&self.markets, &self.ledger)
    }

    pub fn risk_engine(&self) -> &RiskEngine {
        &self.risk
    }

    pub fn market(&self, market: Address) -> ProtocolResult<&Market> {
        self.markets
            .get(&market)
            .ok_or(ProtocolError::UnknownMarket(market))
    }

    fn market_mut(&mut self, market: Address) -> ProtocolResult<&mut Market> {
        self.markets
            .get_mut(&market)
            .ok_or(ProtocolError::UnknownMarket(market))
    }

    pub fn markets(&self) -> impl Iterator<Item = &Market> {
        self.markets.values()
    }

    pub fn market_by_symbol(&self, symbol: &str) -> Option<&Market> {
        self.markets.values().find(|m| m.symbol() == symbol)
    }

    pub fn market_status(&self, market: Address) -> MarketStatus {
        self.risk.status(market)
    }

    /// Underlying held by the market.
    pub fn cash(&self, market: Address) -> ProtocolResult<U256> {
        let state = self.market(market)?;
        Ok(self.view().cash(state))
    }

    pub fn exchange_rate_stored(&self, market: Address) -> ProtocolResult<U256> {
        let state = self.market(market)?;
        self.view().exchange_rate(state)
    }

    pub fn exchange_rate_current(&mut self, market: Address) -> ProtocolResult<U256> {
        self.atomic("exchange_rate_current", |p| {
            p.accrue(market)?;
            p.exchange_rate_stored(market)
        })
    }

    pub fn claims_of(&self, market: Address, account: Address) -> ProtocolResult<U256> {
        Ok(self.market(market)?.claims_of(account))
    }

    /// Underlying value of `account`'s claims at the stored exchange rate.
    pub fn balance_of_underlying(&self, market: Address, account: Address) -> ProtocolResult<U256> {
        let claims = self.claims_of(market, account)?;
        let rate = self.exchange_rate_stored(market)?;
        Ok(u256_math::wad_mul(claims, rate)?)
    }

    pub fn borrow_balance_stored(&self, market: Address, account: Address) -> ProtocolResult<U256> {
        self.market(market)?.borrow_balance(account)
    }

    pub fn borrow_balance_current(&mut self, market: Address, account: Address) -> ProtocolResult<U256> {
        self.atomic("borrow_balance_current", |p| {
            p.accrue(market)?;
            p.borrow_balance_stored(market, account)
        })
    }

    pub fn account_snapshot(&self, market: Address, account: Address) -> ProtocolResult<AccountSnapshot> {
        let state = self.market(market)?;
        Ok(AccountSnapshot {
            claims: state.claims_of(account),
            owed: state.borrow_balance(account)?,
            exchange_rate: self.view().exchange_rate(state)?,
        })
    }

    pub fn borrow_rate_per_block(&self, market: Address) -> ProtocolResult<U256> {
        let state = self.market(market)?;
        Ok(state.rates(self.view().cash(state)).0)
    }

    pub fn supply_rate_per_block(&self, market: Address) -> ProtocolResult<U256> {
        let state = self.market(market)?;
        Ok(state.rates(self.view().cash(state)).1)
    }

    /// Share of the market's assets currently borrowed (1e18).
    pub fn utilization(&self, market: Address) -> ProtocolResult<U256> {
        let state = self.market(market)?;
        Ok(moneymarket_api::utilization_rate(
            self.view().cash(state),
            state.total_borrows(),
            state.total_reserves(),
        ))
    }

    // ========================================================================
    // Risk: views
    // ========================================================================

    /// Liquidity of `account` after accruing interest on every market.
    pub fn account_liquidity(&mut self, account: Address) -> ProtocolResult<AccountLiquidity> {
        self.atomic("account_liquidity", |p| {
            p.accrue_all()?;
            p.account_liquidity_stored(account)
        })
    }

    /// Liquidity of `account` against stored market state.
    pub fn account_liquidity_stored(&self, account: Address) -> ProtocolResult<AccountLiquidity> {
        self.risk.account_liquidity(self.view(), account)
    }

    pub fn account_position(&self, account: Address) -> ProtocolResult<AccountPosition> {
        self.risk
            .account_position(self.view(), account, None, U256::ZERO, U256::ZERO)
    }

    pub fn hypothetical_liquidity(
        &self,
        account: Address,
        market: Address,
        redeem_claims: U256,
        borrow_amount: U256,
    ) -> ProtocolResult<AccountLiquidity> {
        self.risk
            .hypothetical_liquidity(self.view(), account, market, redeem_claims, borrow_amount)
    }

    pub fn liquidation_allowed(
        &self,
        liquidator: Address,
        borrower: Address,
        repay_market: Address,
        collateral_market: Address,
        repay_amount: U256,
    ) -> ProtocolResult<()> {
        self.risk.liquidation_allowed(
            self.view(),
            liquidator,
            borrower,
            repay_market,
            collateral_market,
            repay_amount,
        )?;
        Ok(())
    }

    pub fn liquidate_calculate_seize_claims(
        &self,
        repay_market: Address,
        collateral_market: Address,
        repay_amount: U256,
    ) -> ProtocolResult<U256> {
        self.risk.liquidate_calculate_seize_claims(
            self.view(),
            repay_market,
            collateral_market,
            repay_amount,
        )
    }

    pub fn max_repay(&self, borrower: Address, repay_market: Address) -> ProtocolResult<U256> {
        self.risk.max_repay(self.view(), borrower, repay_market)
    }

    fn authorize(
        &self,
        operation: Operation,
        account: Address,
        market: Address,
        amount: U256,
    ) -> ProtocolResult<()> {
        self.risk
            .authorize(self.view(), operation, account, market, amount)?;
        Ok(())
    }

    // ========================================================================
    // Membership
    // ========================================================================

    pub fn enter_markets(&mut self, account: Address, markets: &[Address]) -> ProtocolResult<()> {
        self.atomic("enter_markets", |p| p.risk.enter_markets(account, markets))
    }

    pub fn exit_market(&mut self, account: Address, market: Address) -> ProtocolResult<()> {
        self.atomic("exit_market", |p| {
            p.accrue_all()?;
            let view = MarketsView::new(&p.markets, &p.ledger);
            p.risk.exit_market(view, account, market)
        })
    }

    // ========================================================================
    // Interest
    // ========================================================================

    pub fn accrue_interest(&mut self, market: Address) -> ProtocolResult<()> {
        self.atomic("accrue_interest", |p| p.accrue(market))
    }

    fn accrue(&mut self, market: Address) -> ProtocolResult<()> {
        let cash = self.cash(market)?;
        let block = self.block;
        let state = self.market_mut(market)?;
        if let Some(accrual) = state.accrue_interest(cash, block)? {
            debug!(
                market = %market,
                blocks = accrual.blocks,
                borrow_rate = %accrual.borrow_rate,
                interest = %accrual.interest,
                borrow_index = %accrual.borrow_index,
                "Interest accrued"
            );
        }
        Ok(())
    }

    /// Accrue every market `account`'s liquidity depends on before risk
    /// checks run against it: its memberships, the markets where it owes and
    /// the markets operated on.
    pub fn accrue_account(&mut self, account: Address, operated: &[Address]) -> ProtocolResult<()> {
        self.atomic("accrue_account", |p| p.accrue_involved(account, operated))
    }

    fn accrue_involved(&mut self, account: Address, operated: &[Address]) -> ProtocolResult<()> {
        let mut involved: BTreeSet<Address> = operated.iter().copied().collect();
        involved.extend(self.risk.memberships(account).iter().copied());
        involved.extend(
            self.markets
                .values()
                .filter(|m| !m.borrow_snapshot(account).principal.is_zero())
                .map(|m| m.address()),
        );
        for market in involved {
            self.accrue(market)?;
        }
        Ok(())
    }

    fn accrue_all(&mut self) -> ProtocolResult<()> {
        let markets: Vec<Address> = self.markets.keys().copied().collect();
        for market in markets {
            self.accrue(market)?;
        }
        Ok(())
    }

    // ========================================================================
    // Supply
    // ========================================================================

    /// Supply `amount` of underlying for claims at the pre-mint exchange rate.
    ///
    /// The minter must have approved the market for `amount`.
    pub fn mint(&mut self, minter: Address, market: Address, amount: U256) -> ProtocolResult<U256> {
        self.atomic("mint", |p| {
            if amount.is_zero() {
                return Err(ProtocolError::InvalidAmount);
            }
            p.accrue(market)?;
            p.authorize(Operation::Mint, minter, market, amount)?;

            let rate = p.exchange_rate_stored(market)?;
            let claims = u256_math::wad_div(amount, rate)?;
            if claims.is_zero() {
                return Err(ProtocolError::InvalidAmount);
            }

            let underlying = p.market(market)?.underlying();
            p.ledger
                .transfer_from(underlying, market, minter, market, amount)?;
            p.market_mut(market)?.mint_claims(minter, claims)?;

            info!(minter = %minter, market = %market, amount = %amount, claims = %claims, "Mint");
            Ok(claims)
        })
    }

    /// Burn `claims` for underlying, truncating the payout.
    pub fn redeem(&mut self, redeemer: Address, market: Address, claims: U256) -> ProtocolResult<Redemption> {
        self.atomic("redeem", |p| {
            if claims.is_zero() {
                return Err(ProtocolError::InvalidAmount);
            }
            p.accrue_involved(redeemer, &[market])?;
            let rate = p.exchange_rate_stored(market)?;
            let amount = u256_math::wad_mul(claims, rate)?;
            p.redeem_fresh(redeemer, market, claims, amount)
        })
    }

    /// Withdraw exactly `amount` of underlying, burning claims rounded up.
    pub fn redeem_underlying(
        &mut self,
        redeemer: Address,
        market: Address,
        amount: U256,
    ) -> ProtocolResult<Redemption> {
        self.atomic("redeem_underlying", |p| {
            if amount.is_zero() {
                return Err(ProtocolError::InvalidAmount);
            }
            p.accrue_involved(redeemer, &[market])?;
            let rate = p.exchange_rate_stored(market)?;
            let claims = u256_math::wad_div_up(amount, rate)?;
            p.redeem_fresh(redeemer, market, claims, amount)
        })
    }

    fn redeem_fresh(
        &mut self,
        redeemer: Address,
        market: Address,
        claims: U256,
        amount: U256,
    ) -> ProtocolResult<Redemption> {
        if amount.is_zero() {
            return Err(ProtocolError::InvalidAmount);
        }
        if self.claims_of(market, redeemer)? < claims {
            return Err(ProtocolError::InsufficientBalance);
        }
        self.authorize(Operation::Redeem, redeemer, market, claims)?;
        if self.cash(market)? < amount {
            return Err(ProtocolError::InsufficientLiquidity);
        }

        let underlying = self.market(market)?.underlying();
        self.market_mut(market)?.burn_claims(redeemer, claims)?;
        self.ledger.transfer(underlying, market, redeemer, amount)?;

        info!(redeemer = %redeemer, market = %market, claims = %claims, amount = %amount, "Redeem");
        Ok(Redemption { claims, amount })
    }

    /// Move claims between accounts, keeping `from` solvent.
    pub fn transfer_claims(
        &mut self,
        from: Address,
        to: Address,
        market: Address,
        claims: U256,
    ) -> ProtocolResult<()> {
        self.atomic("transfer_claims", |p| {
            if claims.is_zero() {
                return Err(ProtocolError::InvalidAmount);
            }
            if from == to {
                return Err(ProtocolError::InvalidParameter(
                    "transfer to self".to_string(),
                ));
            }
            p.accrue_involved(from, &[market])?;
            if p.claims_of(market, from)? < claims {
                return Err(ProtocolError::InsufficientBalance);
            }
            p.authorize(Operation::Transfer, from, market, claims)?;
            p.market_mut(market)?.move_claims(from, to, claims)?;

            info!(from = %from, to = %to, market = %market, claims = %claims, "Claims transferred");
            Ok(())
        })
    }

    // ========================================================================
    // Debt
    // ========================================================================

    /// Borrow `amount` of underlying. Returns the new owed balance.
    pub fn borrow(&mut self, borrower: Address, market: Address, amount: U256) -> ProtocolResult<U256> {
        self.atomic("borrow", |p| {
            if amount.is_zero() {
                return Err(ProtocolError::InvalidAmount);
            }
            p.accrue_involved(borrower, &[market])?;
            p.authorize(Operation::Borrow, borrower, market, amount)?;
            if p.cash(market)? < amount {
                return Err(ProtocolError::InsufficientLiquidity);
            }

            let underlying = p.market(market)?.underlying();
            let owed = p.market_mut(market)?.record_borrow(borrower, amount)?;
            p.ledger.transfer(underlying, market, borrower, amount)?;

            info!(borrower = %borrower, market = %market, amount = %amount, owed = %owed, "Borrow");
            Ok(owed)
        })
    }

    /// Repay the payer's own debt. See [`Protocol::repay_borrow_behalf`].
    pub fn repay_borrow(&mut self, payer: Address, market: Address, amount: U256) -> ProtocolResult<U256> {
        self.repay_borrow_behalf(payer, payer, market, amount)
    }

    /// Repay `borrower`'s debt from `payer`'s balance.
    ///
    /// `U256::MAX` repays the full owed balance; larger amounts are clamped
    /// to it. Returns the amount actually repaid.
    pub fn repay_borrow_behalf(
        &mut self,
        payer: Address,
        borrower: Address,
        market: Address,
        amount: U256,
    ) -> ProtocolResult<U256> {
        self.atomic("repay_borrow", |p| {
            if amount.is_zero() {
                return Err(ProtocolError::InvalidAmount);
            }
            p.accrue(market)?;
            p.repay_fresh(payer, borrower, market, amount)
        })
    }

    fn repay_fresh(
        &mut self,
        payer: Address,
        borrower: Address,
        market: Address,
        amount: U256,
    ) -> ProtocolResult<U256> {
        self.authorize(Operation::Repay, payer, market, amount)?;

        let state = self.market(market)?;
        let underlying = state.underlying();
        let owed = state.borrow_balance(borrower)?;
        let repaid = u256_math::min(amount, owed);
        if repaid.is_zero() {
            return Ok(U256::ZERO);
        }

        self.ledger
            .transfer_from(underlying, market, payer, market, repaid)?;
        let remaining = self.market_mut(market)?.record_repay(borrower, repaid)?;

        info!(
            payer = %payer,
            borrower = %borrower,
            market = %market,
            repaid = %repaid,
            remaining = %remaining,
            "Repay"
        );
        Ok(repaid)
    }

    // ========================================================================
    // Liquidation
    // ========================================================================

    /// Repay `repay_amount` of `borrower`'s debt in `repay_market` and seize
    /// discounted claims of `collateral_market`.
    ///
    /// The liquidator must have approved `repay_market` for the repayment.
    pub fn liquidate_borrow(
        &mut self,
        liquidator: Address,
        borrower: Address,
        repay_market: Address,
        repay_amount: U256,
        collateral_market: Address,
    ) -> ProtocolResult<LiquidationOutcome> {
        self.atomic("liquidate_borrow", |p| {
            if repay_amount.is_zero() || repay_amount == U256::MAX {
                return Err(ProtocolError::InvalidAmount);
            }
            p.accrue_involved(borrower, &[repay_market, collateral_market])?;
            p.liquidation_allowed(
                liquidator,
                borrower,
                repay_market,
                collateral_market,
                repay_amount,
            )?;

            let repaid = p.repay_fresh(liquidator, borrower, repay_market, repay_amount)?;
            let seize_claims =
                p.liquidate_calculate_seize_claims(repay_market, collateral_market, repaid)?;
            if p.claims_of(collateral_market, borrower)? < seize_claims {
                return Err(ProtocolError::SeizeTooMuch);
            }
            let seizure = p.liquidate_borrow_seize(
                collateral_market,
                repay_market,
                liquidator,
                borrower,
                seize_claims,
            )?;

            info!(
                liquidator = %liquidator,
                borrower = %borrower,
                repay_market = %repay_market,
                collateral_market = %collateral_market,
                repaid = %repaid,
                seized = %seizure.seized,
                to_reserves = %seizure.to_reserves,
                "Liquidation"
            );
            Ok(LiquidationOutcome { repaid, seizure })
        })
    }

    /// Move `seize_claims` of `collateral_market` from the borrower to the
    /// liquidator. Only reachable through [`Protocol::liquidate_borrow`].
    pub(crate) fn liquidate_borrow_seize(
        &mut self,
        collateral_market: Address,
        seizer_market: Address,
        liquidator: Address,
        borrower: Address,
        seize_claims: U256,
    ) -> ProtocolResult<Seizure> {
        self.risk.seize_allowed(
            self.view(),
            collateral_market,
            seizer_market,
            liquidator,
            borrower,
        )?;
        let rate = self.exchange_rate_stored(collateral_market)?;
        self.market_mut(collateral_market)?
            .seize(liquidator, borrower, seize_claims, rate)
    }

    // ========================================================================
    // Reserves
    // ========================================================================

    /// Donate `amount` of underlying from `from` to the market's reserves.
    pub fn add_reserves(&mut self, from: Address, market: Address, amount: U256) -> ProtocolResult<U256> {
        self.atomic("add_reserves", |p| {
            if amount.is_zero() {
                return Err(ProtocolError::InvalidAmount);
            }
            p.accrue(market)?;
            let underlying = p.market(market)?.underlying();
            p.ledger
                .transfer_from(underlying, market, from, market, amount)?;
            let reserves = p.market_mut(market)?.add_reserves(amount)?;
            info!(from = %from, market = %market, amount = %amount, reserves = %reserves, "Reserves added");
            Ok(reserves)
        })
    }

    /// Withdraw `amount` of reserves to `to`.
    pub fn reduce_reserves(
        &mut self,
        _admin: &AdminCap,
        market: Address,
        amount: U256,
        to: Address,
    ) -> ProtocolResult<U256> {
        self.atomic("reduce_reserves", |p| {
            p.accrue(market)?;
            if p.cash(market)? < amount {
                return Err(ProtocolError::InsufficientLiquidity);
            }
            let underlying = p.market(market)?.underlying();
            let reserves = p.market_mut(market)?.reduce_reserves(amount)?;
            p.ledger.transfer(underlying, market, to, amount)?;
            info!(market = %market, amount = %amount, to = %to, reserves = %reserves, "Reserves reduced");
            Ok(reserves)
        })
    }

    // ========================================================================
    // Administration
    // ========================================================================

    /// Create an unlisted market. Returns its address.
    pub fn add_market(&mut self, _admin: &AdminCap, mut params: MarketParams) -> ProtocolResult<Address> {
        let decimals = self.assets.decimals(&params.underlying)?;
        if self.markets.contains_key(&params.address) {
            return Err(ProtocolError::InvalidParameter(format!(
                "market {} already exists",
                params.address
            )));
        }
        if params.controller.is_none() {
            params.controller = Some(self.risk.id());
        }

        let market = Market::new(params, decimals, self.block)?;
        let address = market.address();
        info!(
            market = %address,
            symbol = market.symbol(),
            underlying = %market.underlying(),
            initial_exchange_rate = %market.initial_exchange_rate(),
            "Market created"
        );
        self.markets.insert(address, market);
        Ok(address)
    }

    /// List an existing market with the risk engine. One-time.
    pub fn list_market(&mut self, admin: &AdminCap, market: Address) -> ProtocolResult<()> {
        self.market(market)?;
        self.risk.list_market(admin, market)
    }

    /// Create and list a market.
    pub fn support_market(&mut self, admin: &AdminCap, params: MarketParams) -> ProtocolResult<Address> {
        self.atomic("support_market", |p| {
            let market = p.add_market(admin, params)?;
            p.list_market(admin, market)?;
            Ok(market)
        })
    }

    pub fn set_price_oracle(&mut self, admin: &AdminCap, oracle: Arc<dyn PriceOracle>) {
        self.risk.set_price_oracle(admin, oracle);
    }

    pub fn set_close_factor(&mut self, admin: &AdminCap, close_factor: U256) -> ProtocolResult<()> {
        self.risk.set_close_factor(admin, close_factor)
    }

    pub fn set_liquidation_incentive(&mut self, admin: &AdminCap, incentive: U256) -> ProtocolResult<()> {
        self.risk.set_liquidation_incentive(admin, incentive)
    }

    pub fn set_collateral_factor(
        &mut self,
        admin: &AdminCap,
        market: Address,
        collateral_factor: U256,
    ) -> ProtocolResult<()> {
        let underlying = self.market(market)?.underlying();
        self.risk
            .set_collateral_factor(admin, market, underlying, collateral_factor)
    }

    pub fn set_borrow_cap(&mut self, admin: &AdminCap, market: Address, cap: U256) -> ProtocolResult<()> {
        self.risk.set_borrow_cap(admin, market, cap)
    }

    pub fn set_supply_cap(&mut self, admin: &AdminCap, market: Address, cap: U256) -> ProtocolResult<()> {
        self.risk.set_supply_cap(admin, market, cap)
    }

    pub fn set_mint_paused(&mut self, admin: &AdminCap, market: Address, paused: bool) -> ProtocolResult<()> {
        self.risk.set_mint_paused(admin, market, paused)
    }

    pub fn set_borrow_paused(&mut self, admin: &AdminCap, market: Address, paused: bool) -> ProtocolResult<()> {
        self.risk.set_borrow_paused(admin, market, paused)
    }

    pub fn set_market_paused(&mut self, admin: &AdminCap, market: Address, paused: bool) -> ProtocolResult<()> {
        self.atomic("set_market_paused", |p| {
            p.risk.set_market_paused(admin, market, paused)
        })
    }

    pub fn set_reserve_factor(&mut self, _admin: &AdminCap, market: Address, reserve_factor: U256) -> ProtocolResult<()> {
        self.atomic("set_reserve_factor", |p| {
            p.accrue(market)?;
            p.market_mut(market)?.set_reserve_factor(reserve_factor)?;
            info!(market = %market, reserve_factor = %reserve_factor, "Reserve factor updated");
            Ok(())
        })
    }

    pub fn set_protocol_seize_share(&mut self, _admin: &AdminCap, market: Address, share: U256) -> ProtocolResult<()> {
        self.atomic("set_protocol_seize_share", |p| {
            p.accrue(market)?;
            p.market_mut(market)?.set_protocol_seize_share(share)?;
            info!(market = %market, share = %share, "Protocol seize share updated");
            Ok(())
        })
    }

    /// Replace the rate model. Interest up to now accrues under the old one.
    pub fn set_interest_rate_model(
        &mut self,
        _admin: &AdminCap,
        market: Address,
        model: Arc<dyn InterestRateModel>,
    ) -> ProtocolResult<()> {
        self.atomic("set_interest_rate_model", |p| {
            p.accrue(market)?;
            p.market_mut(market)?.set_rate_model(model);
            info!(market = %market, "Interest rate model updated");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DenyReason;
    use crate::u256_math::WAD;
    use moneymarket_api::{SimplePriceOracle, WhitePaperInterestRateModel};

    const TOKEN: Address = Address::repeat_byte(0x70);
    const C_TOKEN: Address = Address::repeat_byte(0xc7);
    const ALICE: Address = Address::repeat_byte(0x01);
    const BOB: Address = Address::repeat_byte(0x02);

    /// One 18-decimal market at a 1:1 initial exchange rate.
    fn single_market() -> (Protocol, AdminCap, Arc<SimplePriceOracle>) {
        let oracle = Arc::new(SimplePriceOracle::new());
        oracle.set_price_usd(TOKEN, 100);
        let (mut protocol, admin) = Protocol::new(oracle.clone());
        protocol
            .register_asset(&admin, Asset::new(TOKEN, "TEST", 18))
            .unwrap();
        let params = MarketParams::new(
            C_TOKEN,
            "cTEST",
            TOKEN,
            Arc::new(WhitePaperInterestRateModel::zero()),
        )
        .with_initial_exchange_rate(WAD);
        protocol.support_market(&admin, params).unwrap();
        protocol
            .set_collateral_factor(&admin, C_TOKEN, WAD / U256::from(2u64))
            .unwrap();

        for account in [ALICE, BOB] {
            protocol
                .faucet(TOKEN, account, U256::from(1_000_000u64))
                .unwrap();
            protocol.approve(account, C_TOKEN, TOKEN, U256::MAX);
        }
        (protocol, admin, oracle)
    }

    #[test]
    fn test_mint_and_redeem_one_unit() {
        let (mut protocol, _admin, _) = single_market();

        let claims = protocol.mint(ALICE, C_TOKEN, U256::from(1u64)).unwrap();
        assert_eq!(claims, U256::from(1u64));
        assert_eq!(protocol.claims_of(C_TOKEN, ALICE).unwrap(), U256::from(1u64));

        let redemption = protocol.redeem(ALICE, C_TOKEN, U256::from(1u64)).unwrap();
        assert_eq!(redemption.amount, U256::from(1u64));
        assert_eq!(protocol.claims_of(C_TOKEN, ALICE).unwrap(), U256::ZERO);
        assert_eq!(protocol.balance_of(TOKEN, ALICE), U256::from(1_000_000u64));
    }

    #[test]
    fn test_borrow_and_repay_one_unit() {
        let (mut protocol, _admin, _) = single_market();
        protocol.mint(ALICE, C_TOKEN, U256::from(10_000u64)).unwrap();

        let before = protocol.balance_of(TOKEN, ALICE);
        protocol.borrow(ALICE, C_TOKEN, U256::from(1u64)).unwrap();
        assert_eq!(protocol.balance_of(TOKEN, ALICE), before + U256::from(1u64));

        let repaid = protocol
            .repay_borrow(ALICE, C_TOKEN, U256::from(1u64))
            .unwrap();
        assert_eq!(repaid, U256::from(1u64));
        assert_eq!(protocol.balance_of(TOKEN, ALICE), before);
        assert_eq!(
            protocol.borrow_balance_stored(C_TOKEN, ALICE).unwrap(),
            U256::ZERO
        );
    }

    #[test]
    fn test_mint_requires_allowance() {
        let (mut protocol, _admin, _) = single_market();
        protocol.approve(ALICE, C_TOKEN, TOKEN, U256::from(5u64));

        let result = protocol.mint(ALICE, C_TOKEN, U256::from(6u64));
        assert!(matches!(result, Err(ProtocolError::TransferFailure(_))));
        assert_eq!(protocol.market(C_TOKEN).unwrap().total_supply(), U256::ZERO);
    }

    #[test]
    fn test_zero_claims_mint_rejected() {
        let (mut protocol, admin, _) = single_market();
        let other = Address::repeat_byte(0xc8);
        // Default rate for 18 decimals underlying: 1e28
        protocol
            .support_market(
                &admin,
                MarketParams::new(
                    other,
                    "cTEST2",
                    TOKEN,
                    Arc::new(WhitePaperInterestRateModel::zero()),
                ),
            )
            .unwrap();
        protocol.approve(ALICE, other, TOKEN, U256::MAX);

        assert_eq!(
            protocol.mint(ALICE, other, U256::from(1u64)),
            Err(ProtocolError::InvalidAmount)
        );
        assert_eq!(
            protocol.mint(ALICE, C_TOKEN, U256::ZERO),
            Err(ProtocolError::InvalidAmount)
        );
    }

    #[test]
    fn test_redeem_underlying_rounds_claims_up() {
        let (mut protocol, _admin, _) = single_market();
        protocol.mint(ALICE, C_TOKEN, U256::from(1_000u64)).unwrap();
        // Donate to push the rate to 1.5
        protocol.transfer(TOKEN, BOB, C_TOKEN, U256::from(500u64)).unwrap();
        assert_eq!(
            protocol.exchange_rate_stored(C_TOKEN).unwrap(),
            WAD + WAD / U256::from(2u64)
        );

        // 10 underlying at 1.5 = 6.67 claims, rounded up to 7
        let redemption = protocol
            .redeem_underlying(ALICE, C_TOKEN, U256::from(10u64))
            .unwrap();
        assert_eq!(redemption.claims, U256::from(7u64));
        assert_eq!(redemption.amount, U256::from(10u64));

        // 7 claims at 1.5 = 10.5, truncated to 10
        let redemption = protocol.redeem(ALICE, C_TOKEN, U256::from(7u64)).unwrap();
        assert_eq!(redemption.amount, U256::from(10u64));
    }

    #[test]
    fn test_redeem_more_than_balance() {
        let (mut protocol, _admin, _) = single_market();
        protocol.mint(ALICE, C_TOKEN, U256::from(100u64)).unwrap();
        assert_eq!(
            protocol.redeem(ALICE, C_TOKEN, U256::from(101u64)),
            Err(ProtocolError::InsufficientBalance)
        );
    }

    #[test]
    fn test_borrow_limited_by_collateral() {
        let (mut protocol, _admin, _) = single_market();
        protocol.mint(ALICE, C_TOKEN, U256::from(100u64)).unwrap();
        protocol.enter_markets(ALICE, &[C_TOKEN]).unwrap();
        protocol.mint(BOB, C_TOKEN, U256::from(1_000u64)).unwrap();
        protocol.enter_markets(BOB, &[C_TOKEN]).unwrap();

        // 1,000 claims at a 0.5 collateral factor back 500
        protocol.borrow(BOB, C_TOKEN, U256::from(500u64)).unwrap();
        assert_eq!(
            protocol.borrow(BOB, C_TOKEN, U256::from(1u64)),
            Err(ProtocolError::AuthorizationDenied(DenyReason::InsufficientCollateral))
        );

        // Redeeming collateral that backs the loan is denied
        assert_eq!(
            protocol.redeem(BOB, C_TOKEN, U256::from(1u64)),
            Err(ProtocolError::AuthorizationDenied(DenyReason::InsufficientCollateral))
        );
        protocol.borrow(ALICE, C_TOKEN, U256::from(50u64)).unwrap();
        assert_eq!(protocol.cash(C_TOKEN).unwrap(), U256::from(550u64));
    }

    #[test]
    fn test_insufficient_cash() {
        let (mut protocol, admin, oracle) = single_market();
        let collateral = Address::repeat_byte(0x71);
        let c_collateral = Address::repeat_byte(0xc9);
        oracle.set_price_usd(collateral, 100);
        protocol
            .register_asset(&admin, Asset::new(collateral, "COLL", 18))
            .unwrap();
        protocol
            .support_market(
                &admin,
                MarketParams::new(
                    c_collateral,
                    "cCOLL",
                    collateral,
                    Arc::new(WhitePaperInterestRateModel::zero()),
                )
                .with_initial_exchange_rate(WAD),
            )
            .unwrap();
        protocol
            .set_collateral_factor(&admin, c_collateral, WAD / U256::from(2u64))
            .unwrap();
        protocol.faucet(collateral, BOB, U256::from(1_000u64)).unwrap();
        protocol.approve(BOB, c_collateral, collateral, U256::MAX);
        protocol.mint(BOB, c_collateral, U256::from(1_000u64)).unwrap();
        protocol.enter_markets(BOB, &[c_collateral]).unwrap();

        protocol.mint(ALICE, C_TOKEN, U256::from(10u64)).unwrap();
        assert_eq!(
            protocol.borrow(BOB, C_TOKEN, U256::from(11u64)),
            Err(ProtocolError::InsufficientLiquidity)
        );
        protocol.borrow(BOB, C_TOKEN, U256::from(10u64)).unwrap();

        // ALICE cannot withdraw cash that is lent out
        assert_eq!(
            protocol.redeem(ALICE, C_TOKEN, U256::from(1u64)),
            Err(ProtocolError::InsufficientLiquidity)
        );
    }

    #[test]
    fn test_repay_max_and_clamp() {
        let (mut protocol, _admin, _) = single_market();
        protocol.mint(ALICE, C_TOKEN, U256::from(1_000u64)).unwrap();
        protocol.enter_markets(ALICE, &[C_TOKEN]).unwrap();
        protocol.borrow(ALICE, C_TOKEN, U256::from(100u64)).unwrap();

        // Over-repay clamps
        let repaid = protocol
            .repay_borrow_behalf(BOB, ALICE, C_TOKEN, U256::from(60u64))
            .unwrap();
        assert_eq!(repaid, U256::from(60u64));
        let repaid = protocol
            .repay_borrow(ALICE, C_TOKEN, U256::from(1_000u64))
            .unwrap();
        assert_eq!(repaid, U256::from(40u64));

        protocol.borrow(ALICE, C_TOKEN, U256::from(25u64)).unwrap();
        let repaid = protocol.repay_borrow(ALICE, C_TOKEN, U256::MAX).unwrap();
        assert_eq!(repaid, U256::from(25u64));
        assert_eq!(protocol.market(C_TOKEN).unwrap().total_borrows(), U256::ZERO);
    }

    #[test]
    fn test_transfer_claims_keeps_sender_solvent() {
        let (mut protocol, _admin, _) = single_market();
        protocol.mint(ALICE, C_TOKEN, U256::from(1_000u64)).unwrap();
        protocol.enter_markets(ALICE, &[C_TOKEN]).unwrap();
        protocol.borrow(ALICE, C_TOKEN, U256::from(400u64)).unwrap();

        // 1,000 * 0.5 = 500 of power, 400 used: 200 claims may move
        protocol
            .transfer_claims(ALICE, BOB, C_TOKEN, U256::from(200u64))
            .unwrap();
        assert_eq!(protocol.claims_of(C_TOKEN, BOB).unwrap(), U256::from(200u64));
        assert_eq!(
            protocol.transfer_claims(ALICE, BOB, C_TOKEN, U256::from(1u64)),
            Err(ProtocolError::AuthorizationDenied(DenyReason::InsufficientCollateral))
        );
        assert!(protocol
            .transfer_claims(BOB, BOB, C_TOKEN, U256::from(1u64))
            .is_err());
    }

    #[test]
    fn test_failed_operation_rolls_back() {
        let (mut protocol, _admin, _) = single_market();
        protocol.mint(ALICE, C_TOKEN, U256::from(1_000u64)).unwrap();

        let result = protocol.transaction(|p| {
            p.mint(BOB, C_TOKEN, U256::from(500u64))?;
            p.redeem(ALICE, C_TOKEN, U256::from(2_000u64))
        });
        assert_eq!(result, Err(ProtocolError::InsufficientBalance));
        assert_eq!(protocol.claims_of(C_TOKEN, BOB).unwrap(), U256::ZERO);
        assert_eq!(protocol.balance_of(TOKEN, BOB), U256::from(1_000_000u64));
        assert_eq!(protocol.cash(C_TOKEN).unwrap(), U256::from(1_000u64));
    }

    #[test]
    fn test_reserves() {
        let (mut protocol, admin, _) = single_market();
        protocol.mint(ALICE, C_TOKEN, U256::from(1_000u64)).unwrap();
        protocol.add_reserves(BOB, C_TOKEN, U256::from(100u64)).unwrap();
        assert_eq!(
            protocol.market(C_TOKEN).unwrap().total_reserves(),
            U256::from(100u64)
        );
        // Reserves do not belong to suppliers
        assert_eq!(protocol.exchange_rate_stored(C_TOKEN).unwrap(), WAD);

        assert_eq!(
            protocol.reduce_reserves(&admin, C_TOKEN, U256::from(101u64), BOB),
            Err(ProtocolError::InvalidAmount)
        );
        protocol
            .reduce_reserves(&admin, C_TOKEN, U256::from(100u64), BOB)
            .unwrap();
        assert_eq!(protocol.balance_of(TOKEN, BOB), U256::from(1_000_000u64));
    }

    #[test]
    fn test_relisting_fails() {
        let (mut protocol, admin, _) = single_market();
        assert_eq!(
            protocol.list_market(&admin, C_TOKEN),
            Err(ProtocolError::MarketAlreadyListed(C_TOKEN))
        );
        assert_eq!(
            protocol.list_market(&admin, Address::repeat_byte(0x99)),
            Err(ProtocolError::UnknownMarket(Address::repeat_byte(0x99)))
        );
    }

    #[test]
    fn test_unknown_underlying() {
        let (mut protocol, admin, _) = single_market();
        let missing = Address::repeat_byte(0x42);
        let params = MarketParams::new(
            Address::repeat_byte(0xca),
            "cMISSING",
            missing,
            Arc::new(WhitePaperInterestRateModel::zero()),
        );
        assert_eq!(
            protocol.add_market(&admin, params),
            Err(ProtocolError::UnknownAsset(missing))
        );
    }

    #[test]
    fn test_blocks_move_forward() {
        let (mut protocol, _admin, _) = single_market();
        protocol.advance_blocks(10).unwrap();
        assert_eq!(protocol.block(), 10);
        assert!(protocol.set_block(5).is_err());
        protocol.set_block(12).unwrap();
        assert_eq!(protocol.block(), 12);
    }

    #[test]
    fn test_locks() {
        let (mut protocol, _admin, _) = single_market();
        let key = Address::repeat_byte(0xaa);
        protocol.acquire_lock(key).unwrap();
        assert_eq!(protocol.acquire_lock(key), Err(ProtocolError::Reentrancy));
        protocol.release_lock(key);
        assert!(!protocol.is_locked(key));
    }
}
