//! Fungible balances with allowances for underlying assets.
//!
//! One ledger tracks every asset: markets, the flash source and the swap
//! venue are plain account addresses holding balances here.

use alloy::primitives::{Address, U256};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ProtocolError, ProtocolResult};

/// Tables are copy-on-write: cloning the ledger shares them until one side
/// writes.
#[derive(Debug, Clone, Default)]
pub struct TokenLedger {
    /// (asset, holder) -> balance
    balances: Arc<HashMap<(Address, Address), U256>>,
    /// (asset, owner, spender) -> allowance
    allowances: Arc<HashMap<(Address, Address, Address), U256>>,
    /// asset -> total issued through the faucet
    supplies: HashMap<Address, U256>,
}

impl TokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance_of(&self, asset: Address, holder: Address) -> U256 {
        self.balances
            .get(&(asset, holder))
            .copied()
            .unwrap_or(U256::ZERO)
    }

    pub fn allowance(&self, asset: Address, owner: Address, spender: Address) -> U256 {
        self.allowances
            .get(&(asset, owner, spender))
            .copied()
            .unwrap_or(U256::ZERO)
    }

    pub fn total_supply(&self, asset: Address) -> U256 {
        self.supplies.get(&asset).copied().unwrap_or(U256::ZERO)
    }

    /// Issue new tokens to `to`. Setup only.
    pub fn faucet(&mut self, asset: Address, to: Address, amount: U256) -> ProtocolResult<()> {
        let supply = self
            .total_supply(asset)
            .checked_add(amount)
            .ok_or(ProtocolError::MathOverflow)?;
        let balance = self
            .balance_of(asset, to)
            .checked_add(amount)
            .ok_or(ProtocolError::MathOverflow)?;
        self.supplies.insert(asset, supply);
        Arc::make_mut(&mut self.balances).insert((asset, to), balance);
        Ok(())
    }

    /// Set the allowance of `spender` over `owner`'s balance.
    /// `U256::MAX` is an infinite allowance that is never decremented.
    pub fn approve(&mut self, asset: Address, owner: Address, spender: Address, amount: U256) {
        Arc::make_mut(&mut self.allowances).insert((asset, owner, spender), amount);
    }

    pub fn transfer(
        &mut self,
        asset: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> ProtocolResult<()> {
        let from_balance = self.balance_of(asset, from);
        if from_balance < amount {
            return Err(ProtocolError::TransferFailure(format!(
                "{} holds {} of {}, needs {}",
                from, from_balance, asset, amount
            )));
        }
        if from == to || amount.is_zero() {
            return Ok(());
        }

        let to_balance = self
            .balance_of(asset, to)
            .checked_add(amount)
            .ok_or(ProtocolError::MathOverflow)?;
        Arc::make_mut(&mut self.balances).insert((asset, from), from_balance - amount);
        Arc::make_mut(&mut self.balances).insert((asset, to), to_balance);
        Ok(())
    }

    /// Move `amount` from `from` to `to` on behalf of `spender`.
    pub fn transfer_from(
        &mut self,
        asset: Address,
        spender: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> ProtocolResult<()> {
        let allowance = self.allowance(asset, from, spender);
        if allowance < amount {
            return Err(ProtocolError::TransferFailure(format!(
                "{} allowed {} of {} to {}, needs {}",
                from, allowance, asset, spender, amount
            )));
        }
        self.transfer(asset, from, to, amount)?;
        if allowance != U256::MAX {
            Arc::make_mut(&mut self.allowances)
                .insert((asset, from, spender), allowance - amount);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USDT: Address = Address::repeat_byte(0xd7);
    const ALICE: Address = Address::repeat_byte(0x01);
    const BOB: Address = Address::repeat_byte(0x02);
    const MARKET: Address = Address::repeat_byte(0xc0);

    #[test]
    fn test_faucet_and_transfer() {
        let mut ledger = TokenLedger::new();
        ledger.faucet(USDT, ALICE, U256::from(100u64)).unwrap();
        ledger.transfer(USDT, ALICE, BOB, U256::from(30u64)).unwrap();

        assert_eq!(ledger.balance_of(USDT, ALICE), U256::from(70u64));
        assert_eq!(ledger.balance_of(USDT, BOB), U256::from(30u64));
        assert_eq!(ledger.total_supply(USDT), U256::from(100u64));
    }

    #[test]
    fn test_transfer_insufficient_balance() {
        let mut ledger = TokenLedger::new();
        ledger.faucet(USDT, ALICE, U256::from(10u64)).unwrap();

        let result = ledger.transfer(USDT, ALICE, BOB, U256::from(11u64));
        assert!(matches!(result, Err(ProtocolError::TransferFailure(_))));
        assert_eq!(ledger.balance_of(USDT, ALICE), U256::from(10u64));
    }

    #[test]
    fn test_transfer_from_consumes_allowance() {
        let mut ledger = TokenLedger::new();
        ledger.faucet(USDT, ALICE, U256::from(100u64)).unwrap();
        ledger.approve(USDT, ALICE, MARKET, U256::from(60u64));

        ledger
            .transfer_from(USDT, MARKET, ALICE, MARKET, U256::from(40u64))
            .unwrap();
        assert_eq!(ledger.allowance(USDT, ALICE, MARKET), U256::from(20u64));

        let result = ledger.transfer_from(USDT, MARKET, ALICE, MARKET, U256::from(21u64));
        assert!(matches!(result, Err(ProtocolError::TransferFailure(_))));
    }

    #[test]
    fn test_infinite_allowance() {
        let mut ledger = TokenLedger::new();
        ledger.faucet(USDT, ALICE, U256::from(100u64)).unwrap();
        ledger.approve(USDT, ALICE, MARKET, U256::MAX);

        ledger
            .transfer_from(USDT, MARKET, ALICE, MARKET, U256::from(100u64))
            .unwrap();
        assert_eq!(ledger.allowance(USDT, ALICE, MARKET), U256::MAX);
    }

    #[test]
    fn test_clone_is_independent_after_write() {
        let mut ledger = TokenLedger::new();
        ledger.faucet(USDT, ALICE, U256::from(100u64)).unwrap();
        ledger.approve(USDT, ALICE, MARKET, U256::from(50u64));
        let snapshot = ledger.clone();
        assert!(Arc::ptr_eq(&ledger.balances, &snapshot.balances));

        ledger.transfer(USDT, ALICE, BOB, U256::from(30u64)).unwrap();
        assert!(Arc::ptr_eq(&ledger.allowances, &snapshot.allowances));
        assert_eq!(snapshot.balance_of(USDT, ALICE), U256::from(100u64));
        assert_eq!(snapshot.balance_of(USDT, BOB), U256::ZERO);
        assert_eq!(ledger.balance_of(USDT, BOB), U256::from(30u64));
    }
}
