//! Flash liquidity: assets lent for the duration of a callback.

use alloy::primitives::{Address, U256};
use std::fmt::Debug;
use tracing::{debug, info};

use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::Protocol;
use crate::u256_math;

/// Borrower callback. Receives the protocol and the fee owed on top of the
/// principal.
pub type FlashCallback<'a> = dyn FnMut(&mut Protocol, U256) -> ProtocolResult<()> + 'a;

/// Source of flash loans.
///
/// The principal is credited to the receiver before the callback runs;
/// principal plus fee must be back in the source's account when it returns.
pub trait FlashLiquiditySource: Send + Sync + Debug {
    /// Ledger account holding the lendable liquidity.
    fn address(&self) -> Address;

    /// Fee charged for borrowing `amount` of `asset`.
    fn flash_fee(&self, asset: Address, amount: U256) -> U256;

    /// Largest loan currently available.
    fn max_flash_loan(&self, protocol: &Protocol, asset: Address) -> U256 {
        protocol.balance_of(asset, self.address())
    }

    /// Lend `amount` of `asset` to `receiver` while `callback` runs.
    /// Returns the fee that was charged.
    fn flash_loan(
        &self,
        protocol: &mut Protocol,
        receiver: Address,
        asset: Address,
        amount: U256,
        callback: &mut FlashCallback<'_>,
    ) -> ProtocolResult<U256>;
}

/// Flash lender whose liquidity is its own ledger balance.
#[derive(Debug, Clone)]
pub struct PoolFlashLender {
    address: Address,
    /// Fee in basis points, rounded up
    fee_bps: u16,
}

impl PoolFlashLender {
    pub fn new(address: Address, fee_bps: u16) -> Self {
        Self { address, fee_bps }
    }

    pub fn fee_bps(&self) -> u16 {
        self.fee_bps
    }
}

impl FlashLiquiditySource for PoolFlashLender {
    fn address(&self) -> Address {
        self.address
    }

    fn flash_fee(&self, _asset: Address, amount: U256) -> U256 {
        u256_math::basis_points_of(amount, self.fee_bps)
    }

    fn flash_loan(
        &self,
        protocol: &mut Protocol,
        receiver: Address,
        asset: Address,
        amount: U256,
        callback: &mut FlashCallback<'_>,
    ) -> ProtocolResult<U256> {
        if amount.is_zero() {
            return Err(ProtocolError::InvalidAmount);
        }

        protocol.transaction(|p| {
            // One loan in flight per lender
            p.acquire_lock(self.address)?;

            let before = p.balance_of(asset, self.address);
            if before < amount {
                return Err(ProtocolError::InsufficientLiquidity);
            }
            let fee = self.flash_fee(asset, amount);
            let owed = u256_math::add(before, fee)?;

            p.transfer(asset, self.address, receiver, amount)?;
            debug!(lender = %self.address, receiver = %receiver, asset = %asset, amount = %amount, fee = %fee, "Flash loan issued");

            callback(p, fee)?;

            let after = p.balance_of(asset, self.address);
            if after < owed {
                debug!(expected = %owed, actual = %after, "Flash loan not repaid");
                return Err(ProtocolError::FlashLoanNotRepaid);
            }

            p.release_lock(self.address);
            info!(lender = %self.address, receiver = %receiver, amount = %amount, fee = %fee, "Flash loan repaid");
            Ok(fee)
        })
    }
}
