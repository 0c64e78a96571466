//! Money-market accounting for a single listed asset.
//!
//! A [`Market`] tracks claims issued to suppliers, per-account borrow
//! snapshots and the aggregate borrows/reserves. Its cash is never stored:
//! it is the ledger balance of the underlying held at the market's address,
//! read through a [`MarketsView`].
//!
//! Methods here are pure accounting. Token movements, authorization and
//! atomicity are the protocol's job.

use alloy::primitives::{Address, U256};
use moneymarket_api::InterestRateModel;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{ProtocolError, ProtocolResult};
use crate::ledger::TokenLedger;
use crate::u256_math::{self, pow10, WAD};

/// Maximum borrow rate per block (0.0005% per block).
pub const BORROW_RATE_MAX: U256 = U256::from_limbs([5_000_000_000_000u64, 0, 0, 0]);

/// Default claim token decimals.
pub const DEFAULT_CLAIM_DECIMALS: u8 = 8;

/// Lifecycle of a market. Listing is one-way; pausing is reversible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketStatus {
    Unlisted,
    Listed,
    Paused,
}

/// Borrow balance checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorrowSnapshot {
    /// Owed amount at the time of the last interaction
    pub principal: U256,
    /// Market borrow index at the time of the last interaction
    pub interest_index: U256,
}

impl BorrowSnapshot {
    /// Owed amount under `borrow_index`.
    pub fn owed(&self, borrow_index: U256) -> ProtocolResult<U256> {
        if self.principal.is_zero() || self.interest_index.is_zero() {
            return Ok(U256::ZERO);
        }
        Ok(u256_math::mul_div(
            self.principal,
            borrow_index,
            self.interest_index,
        )?)
    }
}

/// Parameters for creating a market.
#[derive(Debug, Clone)]
pub struct MarketParams {
    /// Claim token address (the market's own account)
    pub address: Address,
    /// Claim token symbol (e.g., "cUSDT")
    pub symbol: String,
    /// Underlying asset address; must be registered
    pub underlying: Address,
    pub claim_decimals: u8,
    /// Exchange rate before the first mint; derived from decimals when unset
    pub initial_exchange_rate: Option<U256>,
    pub reserve_factor: U256,
    pub protocol_seize_share: U256,
    pub rate_model: Arc<dyn InterestRateModel>,
    /// Risk engine governing the market; the protocol's own engine when unset
    pub controller: Option<Address>,
}

impl MarketParams {
    pub fn new(
        address: Address,
        symbol: impl Into<String>,
        underlying: Address,
        rate_model: Arc<dyn InterestRateModel>,
    ) -> Self {
        Self {
            address,
            symbol: symbol.into(),
            underlying,
            claim_decimals: DEFAULT_CLAIM_DECIMALS,
            initial_exchange_rate: None,
            reserve_factor: U256::ZERO,
            protocol_seize_share: U256::ZERO,
            rate_model,
            controller: None,
        }
    }

    pub fn with_initial_exchange_rate(mut self, rate: U256) -> Self {
        self.initial_exchange_rate = Some(rate);
        self
    }

    pub fn with_claim_decimals(mut self, decimals: u8) -> Self {
        self.claim_decimals = decimals;
        self
    }

    pub fn with_reserve_factor(mut self, reserve_factor: U256) -> Self {
        self.reserve_factor = reserve_factor;
        self
    }

    pub fn with_protocol_seize_share(mut self, share: U256) -> Self {
        self.protocol_seize_share = share;
        self
    }

    pub fn with_controller(mut self, controller: Address) -> Self {
        self.controller = Some(controller);
        self
    }
}

/// Interest accrued by one call to [`Market::accrue_interest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accrual {
    pub blocks: u64,
    pub borrow_rate: U256,
    pub interest: U256,
    pub borrow_index: U256,
}

/// Claims split of a seizure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seizure {
    /// Claims taken from the borrower
    pub seized: U256,
    /// Claims credited to the liquidator
    pub to_liquidator: U256,
    /// Claims burned into reserves
    pub to_reserves: U256,
    /// Underlying added to reserves
    pub reserves_added: U256,
}

#[derive(Debug, Clone)]
pub struct Market {
    address: Address,
    symbol: String,
    underlying: Address,
    underlying_decimals: u8,
    claim_decimals: u8,
    controller: Address,
    initial_exchange_rate: U256,
    reserve_factor: U256,
    protocol_seize_share: U256,
    rate_model: Arc<dyn InterestRateModel>,

    total_supply: U256,
    total_borrows: U256,
    total_reserves: U256,
    borrow_index: U256,
    accrual_block: u64,

    // Shared until written so protocol snapshots stay cheap
    claims: Arc<HashMap<Address, U256>>,
    borrows: Arc<HashMap<Address, BorrowSnapshot>>,
}

impl Market {
    /// Create an unlisted market at `current_block`.
    pub fn new(
        params: MarketParams,
        underlying_decimals: u8,
        current_block: u64,
    ) -> ProtocolResult<Self> {
        if params.reserve_factor > WAD {
            return Err(ProtocolError::InvalidParameter(
                "reserve factor above 1".to_string(),
            ));
        }
        if params.protocol_seize_share > WAD {
            return Err(ProtocolError::InvalidParameter(
                "protocol seize share above 1".to_string(),
            ));
        }

        let initial_exchange_rate = match params.initial_exchange_rate {
            Some(rate) => rate,
            None => {
                // One whole claim per whole underlying
                let exponent = 18u16 + underlying_decimals as u16;
                let exponent = exponent
                    .checked_sub(params.claim_decimals as u16)
                    .ok_or_else(|| {
                        ProtocolError::InvalidParameter(
                            "claim decimals exceed 18 + underlying decimals".to_string(),
                        )
                    })?;
                pow10(u8::try_from(exponent).map_err(|_| ProtocolError::MathOverflow)?)
            }
        };
        if initial_exchange_rate.is_zero() {
            return Err(ProtocolError::InvalidParameter(
                "initial exchange rate is zero".to_string(),
            ));
        }

        Ok(Self {
            address: params.address,
            symbol: params.symbol,
            underlying: params.underlying,
            underlying_decimals,
            claim_decimals: params.claim_decimals,
            controller: params.controller.unwrap_or(Address::ZERO),
            initial_exchange_rate,
            reserve_factor: params.reserve_factor,
            protocol_seize_share: params.protocol_seize_share,
            rate_model: params.rate_model,
            total_supply: U256::ZERO,
            total_borrows: U256::ZERO,
            total_reserves: U256::ZERO,
            borrow_index: WAD,
            accrual_block: current_block,
            claims: Arc::default(),
            borrows: Arc::default(),
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn underlying(&self) -> Address {
        self.underlying
    }

    pub fn underlying_decimals(&self) -> u8 {
        self.underlying_decimals
    }

    pub fn claim_decimals(&self) -> u8 {
        self.claim_decimals
    }

    pub fn controller(&self) -> Address {
        self.controller
    }

    pub fn initial_exchange_rate(&self) -> U256 {
        self.initial_exchange_rate
    }

    pub fn reserve_factor(&self) -> U256 {
        self.reserve_factor
    }

    pub fn protocol_seize_share(&self) -> U256 {
        self.protocol_seize_share
    }

    pub fn rate_model(&self) -> &Arc<dyn InterestRateModel> {
        &self.rate_model
    }

    pub fn total_supply(&self) -> U256 {
        self.total_supply
    }

    pub fn total_borrows(&self) -> U256 {
        self.total_borrows
    }

    pub fn total_reserves(&self) -> U256 {
        self.total_reserves
    }

    pub fn borrow_index(&self) -> U256 {
        self.borrow_index
    }

    pub fn accrual_block(&self) -> u64 {
        self.accrual_block
    }

    /// Claim balance of `account`.
    pub fn claims_of(&self, account: Address) -> U256 {
        self.claims.get(&account).copied().unwrap_or(U256::ZERO)
    }

    /// Borrow snapshot of `account` (zeroed if it never borrowed).
    pub fn borrow_snapshot(&self, account: Address) -> BorrowSnapshot {
        self.borrows.get(&account).copied().unwrap_or_default()
    }

    /// Owed balance of `account` at the stored borrow index.
    pub fn borrow_balance(&self, account: Address) -> ProtocolResult<U256> {
        self.borrow_snapshot(account).owed(self.borrow_index)
    }

    /// Accounts holding a nonzero borrow principal.
    pub fn borrowers(&self) -> impl Iterator<Item = Address> + '_ {
        self.borrows
            .iter()
            .filter(|(_, snapshot)| !snapshot.principal.is_zero())
            .map(|(account, _)| *account)
    }

    /// `(cash + borrows - reserves) * 1e18 / supply`, or the initial rate
    /// while no claims exist.
    pub fn exchange_rate(&self, cash: U256) -> ProtocolResult<U256> {
        if self.total_supply.is_zero() {
            return Ok(self.initial_exchange_rate);
        }
        let assets = u256_math::sub(
            u256_math::add(cash, self.total_borrows)?,
            self.total_reserves,
        )?;
        Ok(u256_math::wad_div(assets, self.total_supply)?)
    }

    /// Borrow and supply rate per block at the current state.
    pub fn rates(&self, cash: U256) -> (U256, U256) {
        self.rate_model.rates(
            cash,
            self.total_borrows,
            self.total_reserves,
            self.reserve_factor,
        )
    }

    /// Accrue simple interest from `accrual_block` to `current_block`.
    ///
    /// Returns `None` when no block has passed since the last accrual.
    pub fn accrue_interest(
        &mut self,
        cash: U256,
        current_block: u64,
    ) -> ProtocolResult<Option<Accrual>> {
        if current_block <= self.accrual_block {
            return Ok(None);
        }

        let borrow_rate =
            self.rate_model
                .borrow_rate(cash, self.total_borrows, self.total_reserves);
        if borrow_rate > BORROW_RATE_MAX {
            return Err(ProtocolError::BorrowRateTooHigh);
        }

        let blocks = current_block - self.accrual_block;
        let factor = u256_math::mul(borrow_rate, U256::from(blocks))?;
        let interest = u256_math::wad_mul(factor, self.total_borrows)?;
        let total_borrows = u256_math::add(self.total_borrows, interest)?;
        let total_reserves = u256_math::add(
            self.total_reserves,
            u256_math::wad_mul(interest, self.reserve_factor)?,
        )?;
        let borrow_index = u256_math::add(
            self.borrow_index,
            u256_math::wad_mul(factor, self.borrow_index)?,
        )?;

        self.total_borrows = total_borrows;
        self.total_reserves = total_reserves;
        self.borrow_index = borrow_index;
        self.accrual_block = current_block;

        Ok(Some(Accrual {
            blocks,
            borrow_rate,
            interest,
            borrow_index,
        }))
    }

    pub(crate) fn mint_claims(&mut self, account: Address, claims: U256) -> ProtocolResult<()> {
        let supply = u256_math::add(self.total_supply, claims)?;
        let balance = u256_math::add(self.claims_of(account), claims)?;
        self.total_supply = supply;
        Arc::make_mut(&mut self.claims).insert(account, balance);
        Ok(())
    }

    pub(crate) fn burn_claims(&mut self, account: Address, claims: U256) -> ProtocolResult<()> {
        let balance = self.claims_of(account);
        if balance < claims {
            return Err(ProtocolError::InsufficientBalance);
        }
        self.total_supply = u256_math::sub(self.total_supply, claims)?;
        Arc::make_mut(&mut self.claims).insert(account, balance - claims);
        Ok(())
    }

    pub(crate) fn move_claims(
        &mut self,
        from: Address,
        to: Address,
        claims: U256,
    ) -> ProtocolResult<()> {
        let from_balance = self.claims_of(from);
        if from_balance < claims {
            return Err(ProtocolError::InsufficientBalance);
        }
        if from == to {
            return Ok(());
        }
        let to_balance = u256_math::add(self.claims_of(to), claims)?;
        Arc::make_mut(&mut self.claims).insert(from, from_balance - claims);
        Arc::make_mut(&mut self.claims).insert(to, to_balance);
        Ok(())
    }

    /// Record a new borrow of `amount` on top of the current owed balance.
    pub(crate) fn record_borrow(&mut self, account: Address, amount: U256) -> ProtocolResult<U256> {
        let owed = u256_math::add(self.borrow_balance(account)?, amount)?;
        let total_borrows = u256_math::add(self.total_borrows, amount)?;
        Arc::make_mut(&mut self.borrows).insert(
            account,
            BorrowSnapshot {
                principal: owed,
                interest_index: self.borrow_index,
            },
        );
        self.total_borrows = total_borrows;
        Ok(owed)
    }

    /// Record a repayment of `amount` (at most the owed balance).
    pub(crate) fn record_repay(&mut self, account: Address, amount: U256) -> ProtocolResult<U256> {
        let owed = self.borrow_balance(account)?;
        let remaining = owed.checked_sub(amount).ok_or(ProtocolError::InvalidAmount)?;
        Arc::make_mut(&mut self.borrows).insert(
            account,
            BorrowSnapshot {
                principal: remaining,
                interest_index: self.borrow_index,
            },
        );
        // Per-account truncation can leave the aggregate a few units below the sum
        self.total_borrows = self.total_borrows.saturating_sub(amount);
        Ok(remaining)
    }

    /// Move `seize_claims` from `borrower` to `liquidator`, burning the
    /// protocol share into reserves at `exchange_rate`.
    pub(crate) fn seize(
        &mut self,
        liquidator: Address,
        borrower: Address,
        seize_claims: U256,
        exchange_rate: U256,
    ) -> ProtocolResult<Seizure> {
        if self.claims_of(borrower) < seize_claims {
            return Err(ProtocolError::SeizeTooMuch);
        }

        let to_reserves = u256_math::wad_mul(seize_claims, self.protocol_seize_share)?;
        let to_liquidator = seize_claims - to_reserves;
        let reserves_added = u256_math::wad_mul(to_reserves, exchange_rate)?;

        self.move_claims(borrower, liquidator, to_liquidator)?;
        self.burn_claims(borrower, to_reserves)?;
        self.total_reserves = u256_math::add(self.total_reserves, reserves_added)?;

        Ok(Seizure {
            seized: seize_claims,
            to_liquidator,
            to_reserves,
            reserves_added,
        })
    }

    pub(crate) fn add_reserves(&mut self, amount: U256) -> ProtocolResult<U256> {
        self.total_reserves = u256_math::add(self.total_reserves, amount)?;
        Ok(self.total_reserves)
    }

    pub(crate) fn reduce_reserves(&mut self, amount: U256) -> ProtocolResult<U256> {
        if amount > self.total_reserves {
            return Err(ProtocolError::InvalidAmount);
        }
        self.total_reserves -= amount;
        Ok(self.total_reserves)
    }

    pub(crate) fn set_reserve_factor(&mut self, reserve_factor: U256) -> ProtocolResult<()> {
        if reserve_factor > WAD {
            return Err(ProtocolError::InvalidParameter(
                "reserve factor above 1".to_string(),
            ));
        }
        self.reserve_factor = reserve_factor;
        Ok(())
    }

    pub(crate) fn set_protocol_seize_share(&mut self, share: U256) -> ProtocolResult<()> {
        if share > WAD {
            return Err(ProtocolError::InvalidParameter(
                "protocol seize share above 1".to_string(),
            ));
        }
        self.protocol_seize_share = share;
        Ok(())
    }

    pub(crate) fn set_rate_model(&mut self, model: Arc<dyn InterestRateModel>) {
        self.rate_model = model;
    }
}

/// Read-only view over every market and the balances backing them.
#[derive(Debug, Clone, Copy)]
pub struct MarketsView<'a> {
    pub markets: &'a BTreeMap<Address, Market>,
    pub ledger: &'a TokenLedger,
}

impl<'a> MarketsView<'a> {
    pub fn new(markets: &'a BTreeMap<Address, Market>, ledger: &'a TokenLedger) -> Self {
        Self { markets, ledger }
    }

    pub fn market(&self, address: Address) -> ProtocolResult<&'a Market> {
        self.markets
            .get(&address)
            .ok_or(ProtocolError::UnknownMarket(address))
    }

    /// Underlying held by the market.
    pub fn cash(&self, market: &Market) -> U256 {
        self.ledger.balance_of(market.underlying, market.address)
    }

    pub fn exchange_rate(&self, market: &Market) -> ProtocolResult<U256> {
        market.exchange_rate(self.cash(market))
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a Market> {
        self.markets.values()
    }
}
