mod common;

use alloy::primitives::U256;
use common::*;
use moneymarket_core::{DenyReason, ProtocolError};

#[test]
fn healthy_accounts_are_never_liquidatable() {
    let mut f = Fixture::underwater(50_000, 40_000);
    for price in [40_000u64, 45_000, 50_000, 100_000] {
        f.oracle.set_price_usd(WBTC, price);
        let err = f
            .protocol
            .liquidate_borrow(LIQUIDATOR, BORROWER, C_USDT, usdt(1_000), C_WBTC)
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::AuthorizationDenied(DenyReason::InsufficientShortfall),
            "price {}",
            price
        );
    }
}

#[test]
fn liquidity_and_shortfall_are_exclusive() {
    let mut f = Fixture::underwater(50_000, 50_000);
    for price in [1u64, 10_000, 35_000, 39_375, 39_999, 40_000, 60_000] {
        f.oracle.set_price_usd(WBTC, price);
        let liquidity = f.protocol.account_liquidity(BORROWER).unwrap();
        assert!(
            liquidity.liquidity.is_zero() || liquidity.shortfall.is_zero(),
            "price {}: {:?}",
            price,
            liquidity
        );
    }
    // Break-even: 63,000 / (2 * 0.8)
    f.oracle.set_price_usd(WBTC, 39_375);
    let liquidity = f.protocol.account_liquidity(BORROWER).unwrap();
    assert!(liquidity.liquidity.is_zero() && liquidity.shortfall.is_zero());
}

#[test]
fn close_factor_bounds_each_liquidation() {
    let mut f = Fixture::underwater(50_000, 35_000);

    let max = f.protocol.max_repay(BORROWER, C_USDT).unwrap();
    assert_eq!(max, usdt(31_500));
    let err = f
        .protocol
        .liquidate_borrow(LIQUIDATOR, BORROWER, C_USDT, max + U256::from(1u64), C_WBTC)
        .unwrap_err();
    assert_eq!(
        err,
        ProtocolError::AuthorizationDenied(DenyReason::TooMuchRepay)
    );

    let mut slices = Vec::new();
    while f.protocol.account_liquidity(BORROWER).unwrap().is_liquidatable() {
        let owed = f.protocol.borrow_balance_current(C_USDT, BORROWER).unwrap();
        let max = f.protocol.max_repay(BORROWER, C_USDT).unwrap();
        assert_eq!(max, owed / U256::from(2u64));
        let outcome = f
            .protocol
            .liquidate_borrow(LIQUIDATOR, BORROWER, C_USDT, max, C_WBTC)
            .unwrap();
        slices.push((outcome.repaid, outcome.seizure.seized));
        assert!(slices.len() < 10);
    }

    assert_eq!(
        slices,
        vec![
            (usdt(31_500), U256::from(97_200_000u64)),
            (usdt(15_750), U256::from(48_600_000u64)),
            (U256::from(7_875_000_000u64), U256::from(24_300_000u64)),
        ]
    );
    assert_eq!(
        f.protocol.borrow_balance_stored(C_USDT, BORROWER).unwrap(),
        U256::from(7_875_000_000u64)
    );
    assert_eq!(
        f.protocol.claims_of(C_WBTC, LIQUIDATOR).unwrap(),
        U256::from(170_100_000u64)
    );
}

#[test]
fn seized_value_matches_incentive() {
    let f = Fixture::underwater(50_000, 35_000);
    let rate = f.protocol.exchange_rate_stored(C_WBTC).unwrap();
    for repay in [1u64, 777, 12_345, 31_500] {
        let repay = usdt(repay);
        let claims = f
            .protocol
            .liquidate_calculate_seize_claims(C_USDT, C_WBTC, repay)
            .unwrap();
        // Collateral value in micro-USD: sat * 35,000 / 100
        let seized_usd = claims * rate / WAD * U256::from(35_000u64) / U256::from(100u64);
        let owed_usd = repay * U256::from(108u64) / U256::from(100u64);
        assert!(seized_usd <= owed_usd, "liquidator over-compensated");
        // One satoshi is worth 350 micro-USD
        assert!(owed_usd - seized_usd < U256::from(350u64));
    }
}

#[test]
fn same_market_collateral_can_be_seized() {
    let mut f = Fixture::new(40_000);
    f.protocol.mint(OPERATOR, C_USDT, usdt(10_000)).unwrap();
    f.protocol.enter_markets(OPERATOR, &[C_USDT]).unwrap();
    // Limit is exactly 7,000 at cf 0.7
    f.protocol.borrow(OPERATOR, C_USDT, usdt(7_000)).unwrap();
    assert!(!f.protocol.account_liquidity(OPERATOR).unwrap().is_liquidatable());

    f.protocol
        .set_collateral_factor(&f.admin, C_USDT, pct(50))
        .unwrap();
    let liquidity = f.protocol.account_liquidity(OPERATOR).unwrap();
    assert_eq!(liquidity.shortfall, U256::from(2_000u64) * WAD);

    let outcome = f
        .protocol
        .liquidate_borrow(LIQUIDATOR, OPERATOR, C_USDT, usdt(3_500), C_USDT)
        .unwrap();
    // 3,780 USDT of claims at 1e16
    assert_eq!(outcome.seizure.seized, U256::from(378_000_000_000u64));
    assert_eq!(
        f.protocol.claims_of(C_USDT, LIQUIDATOR).unwrap(),
        U256::from(378_000_000_000u64)
    );
    assert_eq!(
        f.protocol.borrow_balance_stored(C_USDT, OPERATOR).unwrap(),
        usdt(3_500)
    );
}

#[test]
fn self_liquidation_is_denied() {
    let mut f = Fixture::underwater(50_000, 35_000);
    f.protocol.faucet(USDT, BORROWER, usdt(1_000)).unwrap();
    let err = f
        .protocol
        .liquidate_borrow(BORROWER, BORROWER, C_USDT, usdt(1_000), C_WBTC)
        .unwrap_err();
    assert_eq!(
        err,
        ProtocolError::AuthorizationDenied(DenyReason::SelfLiquidation)
    );
}

#[test]
fn estimate_matches_execution() {
    let mut f = Fixture::underwater(50_000, 35_000);
    let executor = f.executor();

    let estimate = executor.estimate(&f.protocol, BORROWER, C_WBTC).unwrap();
    assert_eq!(estimate.repay_amount, usdt(31_500));
    assert_eq!(estimate.seize_claims, U256::from(97_200_000u64));
    assert_eq!(estimate.flash_fee, U256::from(28_350_000u64));
    assert_eq!(estimate.net_profit(), Some(U256::from(2_389_590_000u64)));

    let report = executor
        .liquidate_entry(&mut f.protocol, KEEPER, BORROWER, estimate.repay_amount, C_WBTC)
        .unwrap();
    assert_eq!(Some(report.profit), estimate.net_profit());
    assert_eq!(f.protocol.balance_of(USDT, KEEPER), report.profit);
}
