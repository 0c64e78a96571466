//! Two-market fixture: USDT (6 decimals, $1) lent against WBTC (8 decimals).

#![allow(dead_code)]

use alloy::primitives::{Address, U256};
use moneymarket_api::{OracleRouter, SimplePriceOracle, SwapRouterRegistry, WhitePaperInterestRateModel};
use moneymarket_core::{
    AdminCap, Asset, LiquidationExecutor, MarketParams, PoolFlashLender, Protocol,
};
use std::sync::Arc;

pub const WBTC: Address = Address::repeat_byte(0xb7);
pub const USDT: Address = Address::repeat_byte(0xd7);
pub const C_WBTC: Address = Address::repeat_byte(0xc1);
pub const C_USDT: Address = Address::repeat_byte(0xc2);
pub const LENDER: Address = Address::repeat_byte(0xf1);
pub const VENUE: Address = Address::repeat_byte(0xf2);
pub const EXECUTOR: Address = Address::repeat_byte(0xe0);
pub const OPERATOR: Address = Address::repeat_byte(0x0a);
pub const BORROWER: Address = Address::repeat_byte(0x0b);
pub const KEEPER: Address = Address::repeat_byte(0x0c);
pub const LIQUIDATOR: Address = Address::repeat_byte(0x0d);

pub const WAD: U256 = moneymarket_core::u256_math::WAD;

pub fn usdt(v: u64) -> U256 {
    U256::from(v) * U256::from(1_000_000u64)
}

pub fn wbtc(v: u64) -> U256 {
    U256::from(v) * U256::from(100_000_000u64)
}

pub fn pct(p: u64) -> U256 {
    WAD * U256::from(p) / U256::from(100u64)
}

pub struct Fixture {
    pub protocol: Protocol,
    pub admin: AdminCap,
    pub oracle: Arc<SimplePriceOracle>,
}

impl Fixture {
    /// Listed markets with zero interest, cf 0.8 (WBTC) and 0.7 (USDT).
    /// The operator holds 1,100,000 USDT, the borrower 2 WBTC and the
    /// liquidator 100,000 USDT, all with unlimited approvals.
    pub fn new(wbtc_price: u64) -> Self {
        let oracle = Arc::new(SimplePriceOracle::new());
        oracle.set_price_usd(USDT, 1);
        oracle.set_price_usd(WBTC, wbtc_price);

        let (mut protocol, admin) = Protocol::new(oracle.clone());
        protocol.register_asset(&admin, Asset::new(USDT, "USDT", 6)).unwrap();
        protocol.register_asset(&admin, Asset::new(WBTC, "WBTC", 8)).unwrap();
        for (market, symbol, underlying) in [(C_WBTC, "cWBTC", WBTC), (C_USDT, "cUSDT", USDT)] {
            protocol
                .support_market(
                    &admin,
                    MarketParams::new(
                        market,
                        symbol,
                        underlying,
                        Arc::new(WhitePaperInterestRateModel::zero()),
                    ),
                )
                .unwrap();
        }
        protocol.set_collateral_factor(&admin, C_WBTC, pct(80)).unwrap();
        protocol.set_collateral_factor(&admin, C_USDT, pct(70)).unwrap();

        protocol.faucet(USDT, OPERATOR, usdt(1_100_000)).unwrap();
        protocol.faucet(WBTC, BORROWER, wbtc(2)).unwrap();
        protocol.faucet(USDT, LIQUIDATOR, usdt(100_000)).unwrap();
        for account in [OPERATOR, BORROWER, LIQUIDATOR] {
            protocol.approve(account, C_USDT, USDT, U256::MAX);
            protocol.approve(account, C_WBTC, WBTC, U256::MAX);
        }

        Self {
            protocol,
            admin,
            oracle,
        }
    }

    /// Operator supplies 1,000,000 USDT; borrower supplies 2 WBTC and uses
    /// them as collateral.
    pub fn supplied(wbtc_price: u64) -> Self {
        let mut fixture = Self::new(wbtc_price);
        fixture.protocol.mint(OPERATOR, C_USDT, usdt(1_000_000)).unwrap();
        fixture.protocol.mint(BORROWER, C_WBTC, wbtc(2)).unwrap();
        fixture.protocol.enter_markets(BORROWER, &[C_WBTC]).unwrap();
        fixture
    }

    /// Borrow 63,000 USDT at `borrow_price`, then move WBTC to `price`.
    pub fn underwater(borrow_price: u64, price: u64) -> Self {
        let mut fixture = Self::supplied(borrow_price);
        fixture.protocol.borrow(BORROWER, C_USDT, usdt(63_000)).unwrap();
        fixture.oracle.set_price_usd(WBTC, price);
        fixture
    }

    /// Flash lender (9 bps) and oracle-priced venue (0.3%) with 10M USDT
    /// each, plus an executor repaying cUSDT debt.
    pub fn executor(&mut self) -> LiquidationExecutor {
        self.protocol.faucet(USDT, LENDER, usdt(10_000_000)).unwrap();
        self.protocol.faucet(USDT, VENUE, usdt(10_000_000)).unwrap();
        let routers = SwapRouterRegistry::new()
            .with_router(Arc::new(OracleRouter::new(self.oracle.clone(), VENUE, 3000)));
        LiquidationExecutor::new(
            EXECUTOR,
            C_USDT,
            Arc::new(PoolFlashLender::new(LENDER, 9)),
            routers,
        )
    }
}
