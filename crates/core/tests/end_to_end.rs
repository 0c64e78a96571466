mod common;

use alloy::primitives::U256;
use common::*;
use moneymarket_core::{DenyReason, ProtocolError};

#[test]
fn borrow_denied_when_weighted_collateral_is_short() {
    // 2 WBTC * $39,000 * 0.8 = $62,400 < $63,000
    let mut f = Fixture::supplied(39_000);
    let err = f.protocol.borrow(BORROWER, C_USDT, usdt(63_000)).unwrap_err();
    assert_eq!(
        err,
        ProtocolError::AuthorizationDenied(DenyReason::InsufficientCollateral)
    );
    assert_eq!(f.protocol.borrow_balance_stored(C_USDT, BORROWER).unwrap(), U256::ZERO);
    assert_eq!(f.protocol.balance_of(USDT, BORROWER), U256::ZERO);

    // $64,000 of borrowing power covers the same loan at $40,000
    f.oracle.set_price_usd(WBTC, 40_000);
    f.protocol.borrow(BORROWER, C_USDT, usdt(63_000)).unwrap();
    let liquidity = f.protocol.account_liquidity(BORROWER).unwrap();
    assert_eq!(liquidity.liquidity, U256::from(1_000u64) * WAD);
}

#[test]
fn flash_liquidation_after_price_drop_is_profitable() {
    let mut f = Fixture::underwater(50_000, 35_000);
    let executor = f.executor();

    let liquidity = f.protocol.account_liquidity(BORROWER).unwrap();
    assert_eq!(liquidity.shortfall, U256::from(7_000u64) * WAD);

    let lender_before = f.protocol.balance_of(USDT, LENDER);
    let report = executor
        .liquidate_entry(&mut f.protocol, KEEPER, BORROWER, usdt(30_000), C_WBTC)
        .unwrap();

    assert_eq!(report.repaid, usdt(30_000));
    assert_eq!(report.seized_claims, U256::from(92_571_428u64));
    assert_eq!(report.collateral_redeemed, U256::from(92_571_428u64));
    assert_eq!(report.swap_output, Some(U256::from(32_302_799_800u64)));
    assert_eq!(report.flash_fee, U256::from(27_000_000u64));
    assert_eq!(report.profit, U256::from(2_275_799_800u64));

    assert_eq!(f.protocol.balance_of(USDT, KEEPER), report.profit);
    assert_eq!(f.protocol.balance_of(USDT, LENDER), lender_before + report.flash_fee);
    assert_eq!(f.protocol.balance_of(USDT, EXECUTOR), U256::ZERO);
    assert_eq!(f.protocol.balance_of(WBTC, EXECUTOR), U256::ZERO);
    assert_eq!(f.protocol.claims_of(C_WBTC, EXECUTOR).unwrap(), U256::ZERO);
    assert_eq!(
        f.protocol.borrow_balance_stored(C_USDT, BORROWER).unwrap(),
        usdt(33_000)
    );
    assert_eq!(
        f.protocol.claims_of(C_WBTC, BORROWER).unwrap(),
        U256::from(107_428_572u64)
    );
}

#[test]
fn failed_flash_liquidation_changes_nothing() {
    let mut f = Fixture::underwater(50_000, 35_000);
    let executor = f.executor().with_min_profit(usdt(1_000_000));

    let before = state(&f);
    let err = executor
        .liquidate_entry(&mut f.protocol, KEEPER, BORROWER, usdt(30_000), C_WBTC)
        .unwrap_err();
    assert!(matches!(err, ProtocolError::InsufficientProceeds { .. }));
    assert_eq!(state(&f), before);
    assert!(!f.protocol.is_locked(EXECUTOR));
    assert!(!f.protocol.is_locked(LENDER));
}

#[test]
fn mint_redeem_borrow_repay_single_units() {
    let mut f = Fixture::supplied(40_000);
    let rate = f.protocol.exchange_rate_stored(C_USDT).unwrap();
    // 1e16: 1 raw USDT unit buys 100 raw claim units
    assert_eq!(rate, U256::from(10u64).pow(U256::from(16u64)));

    let claims = f.protocol.mint(LIQUIDATOR, C_USDT, U256::from(1u64)).unwrap();
    assert_eq!(claims, U256::from(100u64));
    let redemption = f.protocol.redeem(LIQUIDATOR, C_USDT, claims).unwrap();
    assert_eq!(redemption.amount, U256::from(1u64));
    assert_eq!(f.protocol.balance_of(USDT, LIQUIDATOR), usdt(100_000));

    f.protocol.borrow(BORROWER, C_USDT, U256::from(1u64)).unwrap();
    assert_eq!(
        f.protocol.borrow_balance_stored(C_USDT, BORROWER).unwrap(),
        U256::from(1u64)
    );
    let repaid = f.protocol.repay_borrow(BORROWER, C_USDT, U256::from(1u64)).unwrap();
    assert_eq!(repaid, U256::from(1u64));
    assert_eq!(
        f.protocol.borrow_balance_stored(C_USDT, BORROWER).unwrap(),
        U256::ZERO
    );
}

#[derive(Debug, PartialEq, Eq)]
struct State {
    balances: Vec<U256>,
    claims: Vec<U256>,
    owed: U256,
    totals: Vec<U256>,
}

fn state(f: &Fixture) -> State {
    let p = &f.protocol;
    let accounts = [OPERATOR, BORROWER, KEEPER, EXECUTOR, LENDER, VENUE, C_USDT, C_WBTC];
    let mut balances = Vec::new();
    for account in accounts {
        balances.push(p.balance_of(USDT, account));
        balances.push(p.balance_of(WBTC, account));
    }
    let claims = accounts
        .iter()
        .flat_map(|a| {
            [
                p.claims_of(C_USDT, *a).unwrap(),
                p.claims_of(C_WBTC, *a).unwrap(),
            ]
        })
        .collect();
    let mut totals = Vec::new();
    for market in [C_USDT, C_WBTC] {
        let m = p.market(market).unwrap();
        totals.extend([m.total_supply(), m.total_borrows(), m.total_reserves(), m.borrow_index()]);
    }
    State {
        balances,
        claims,
        owed: p.borrow_balance_stored(C_USDT, BORROWER).unwrap(),
        totals,
    }
}
