mod common;

use alloy::primitives::U256;
use common::*;
use moneymarket_api::WhitePaperInterestRateModel;
use moneymarket_core::{DenyReason, ProtocolError};
use std::sync::Arc;

fn with_interest() -> Fixture {
    let mut f = Fixture::supplied(50_000);
    f.protocol
        .set_interest_rate_model(
            &f.admin,
            C_USDT,
            Arc::new(WhitePaperInterestRateModel::new(pct(5), pct(20))),
        )
        .unwrap();
    f.protocol
        .set_reserve_factor(&f.admin, C_USDT, pct(10))
        .unwrap();
    f.protocol.borrow(BORROWER, C_USDT, usdt(10_000)).unwrap();
    f
}

#[test]
fn accrual_grows_debt_and_reserves() {
    let mut f = with_interest();
    let rate_before = f.protocol.exchange_rate_stored(C_USDT).unwrap();
    let borrow_rate = f.protocol.borrow_rate_per_block(C_USDT).unwrap();
    let supply_rate = f.protocol.supply_rate_per_block(C_USDT).unwrap();
    assert!(!borrow_rate.is_zero());
    assert!(supply_rate < borrow_rate);

    f.protocol.advance_blocks(1_000).unwrap();
    f.protocol.accrue_interest(C_USDT).unwrap();

    let market = f.protocol.market(C_USDT).unwrap();
    assert_eq!(market.accrual_block(), f.protocol.block());
    let interest = market.total_borrows() - usdt(10_000);
    assert!(!interest.is_zero());
    assert_eq!(market.total_reserves(), interest / U256::from(10u64));
    assert_eq!(
        f.protocol.borrow_balance_stored(C_USDT, BORROWER).unwrap(),
        market.total_borrows()
    );
    assert!(f.protocol.exchange_rate_stored(C_USDT).unwrap() > rate_before);
}

#[test]
fn accrual_is_idempotent_within_a_block() {
    let mut f = with_interest();
    f.protocol.advance_blocks(50).unwrap();
    f.protocol.accrue_interest(C_USDT).unwrap();

    let totals = |f: &Fixture| {
        let m = f.protocol.market(C_USDT).unwrap();
        (
            m.total_borrows(),
            m.total_reserves(),
            m.total_supply(),
            m.borrow_index(),
            m.accrual_block(),
        )
    };
    let first = totals(&f);
    f.protocol.accrue_interest(C_USDT).unwrap();
    assert_eq!(totals(&f), first);
}

#[test]
fn repaying_in_full_clears_accrued_interest() {
    let mut f = with_interest();
    f.protocol.advance_blocks(10_000).unwrap();
    let owed = f.protocol.borrow_balance_current(C_USDT, BORROWER).unwrap();
    assert!(owed > usdt(10_000));

    f.protocol.faucet(USDT, BORROWER, usdt(1_000)).unwrap();
    let repaid = f.protocol.repay_borrow(BORROWER, C_USDT, U256::MAX).unwrap();
    assert_eq!(repaid, owed);
    assert_eq!(
        f.protocol.borrow_balance_stored(C_USDT, BORROWER).unwrap(),
        U256::ZERO
    );
}

#[test]
fn suppliers_earn_the_spread() {
    let mut f = with_interest();
    f.protocol.advance_blocks(100_000).unwrap();
    f.protocol.faucet(USDT, BORROWER, usdt(10_000)).unwrap();
    f.protocol.repay_borrow(BORROWER, C_USDT, U256::MAX).unwrap();

    let claims = f.protocol.claims_of(C_USDT, OPERATOR).unwrap();
    let underlying = f.protocol.balance_of_underlying(C_USDT, OPERATOR).unwrap();
    assert!(underlying > usdt(1_000_000));

    let redemption = f.protocol.redeem(OPERATOR, C_USDT, claims).unwrap();
    assert_eq!(redemption.amount, underlying);
    // Reserves stay behind in the market
    let market = f.protocol.market(C_USDT).unwrap();
    assert_eq!(market.total_supply(), U256::ZERO);
    assert!(f.protocol.cash(C_USDT).unwrap() >= market.total_reserves());
}

#[test]
fn excessive_borrow_rate_halts_the_market() {
    let mut f = with_interest();
    // 2000% a year is above the per-block ceiling
    f.protocol
        .set_interest_rate_model(
            &f.admin,
            C_USDT,
            Arc::new(WhitePaperInterestRateModel::new(WAD * U256::from(20u64), U256::ZERO)),
        )
        .unwrap();
    f.protocol.advance_blocks(1).unwrap();
    assert_eq!(
        f.protocol.borrow(BORROWER, C_USDT, usdt(1)).unwrap_err(),
        ProtocolError::BorrowRateTooHigh
    );
    assert_eq!(
        f.protocol.accrue_interest(C_USDT).unwrap_err(),
        ProtocolError::BorrowRateTooHigh
    );

    // Replacing the model needs an accrual, which the old model blocks
    assert!(f
        .protocol
        .set_interest_rate_model(
            &f.admin,
            C_USDT,
            Arc::new(WhitePaperInterestRateModel::zero()),
        )
        .is_err());
}

/// 2 WBTC at $50k back $80,000; the USDT debt leaves $1,500 of headroom
/// that a million blocks of interest eat through.
fn interest_pending_elsewhere() -> Fixture {
    let mut f = Fixture::supplied(50_000);
    f.protocol
        .set_interest_rate_model(
            &f.admin,
            C_USDT,
            Arc::new(WhitePaperInterestRateModel::new(pct(5), pct(20))),
        )
        .unwrap();
    f.protocol.borrow(BORROWER, C_USDT, usdt(78_000)).unwrap();
    f.protocol
        .borrow(BORROWER, C_WBTC, U256::from(1_000_000u64))
        .unwrap();
    assert!(!f.protocol.account_liquidity(BORROWER).unwrap().is_liquidatable());
    f.protocol.advance_blocks(1_000_000).unwrap();
    f
}

#[test]
fn interest_in_other_markets_counts_against_new_risk() {
    let mut f = interest_pending_elsewhere();
    let usdt_accrued_at = f.protocol.market(C_USDT).unwrap().accrual_block();
    let denied = Some(DenyReason::InsufficientCollateral);

    let borrow = f.protocol.borrow(BORROWER, C_WBTC, U256::from(1_000u64));
    assert_eq!(borrow.unwrap_err().deny_reason(), denied);
    let redeem = f.protocol.redeem(BORROWER, C_WBTC, U256::from(1_000_000u64));
    assert_eq!(redeem.unwrap_err().deny_reason(), denied);
    let transfer = f
        .protocol
        .transfer_claims(BORROWER, KEEPER, C_WBTC, U256::from(1_000_000u64));
    assert_eq!(transfer.unwrap_err().deny_reason(), denied);

    // Denials roll back the accrual they triggered
    assert_eq!(
        f.protocol.market(C_USDT).unwrap().accrual_block(),
        usdt_accrued_at
    );
    assert_eq!(
        f.protocol.claims_of(C_WBTC, BORROWER).unwrap(),
        wbtc(2)
    );

    f.protocol.accrue_account(BORROWER, &[]).unwrap();
    assert_eq!(
        f.protocol.market(C_USDT).unwrap().accrual_block(),
        f.protocol.block()
    );
    assert!(f.protocol.account_liquidity_stored(BORROWER).unwrap().is_liquidatable());
}

#[test]
fn interest_in_other_markets_makes_borrower_liquidatable() {
    let mut f = interest_pending_elsewhere();
    f.protocol.faucet(WBTC, LIQUIDATOR, wbtc(1)).unwrap();

    // Neither cWBTC leg carries interest; the shortfall comes from cUSDT
    let outcome = f
        .protocol
        .liquidate_borrow(
            LIQUIDATOR,
            BORROWER,
            C_WBTC,
            U256::from(500_000u64),
            C_WBTC,
        )
        .unwrap();
    assert_eq!(outcome.repaid, U256::from(500_000u64));
    assert_eq!(outcome.seizure.seized, U256::from(540_000u64));
    assert_eq!(
        f.protocol.market(C_USDT).unwrap().accrual_block(),
        f.protocol.block()
    );
}
