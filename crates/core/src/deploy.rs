//! Builds a protocol from a resolved deployment and runs scripted scenarios
//! against it.

use alloy::primitives::{Address, U256};
use anyhow::{anyhow, bail, Context, Result};
use moneymarket_api::{
    InterestRateModel, JumpRateModel, OracleRouter, SimplePriceOracle, SwapRouterRegistry,
    WhitePaperInterestRateModel,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::assets::Asset;
use crate::config::{
    RateModelConfig, ResolvedDeployment, ScenarioAction, ScenarioConfig, MAX_AMOUNT,
};
use crate::flash::PoolFlashLender;
use crate::liquidator::{LiquidationExecutor, LiquidationReport};
use crate::market::MarketParams;
use crate::position::AccountLiquidity;
use crate::protocol::{LiquidationOutcome, Protocol};
use crate::risk_engine::AdminCap;
use crate::u256_math;

/// A live deployment: the protocol plus the named accounts, markets and
/// services configured around it.
#[derive(Debug)]
pub struct Deployment {
    name: String,
    protocol: Protocol,
    admin: AdminCap,
    oracle: Arc<SimplePriceOracle>,
    executor: Option<LiquidationExecutor>,
    /// Account name -> address
    accounts: BTreeMap<String, Address>,
    /// Claim symbol -> market address
    markets: BTreeMap<String, Address>,
    /// Asset symbol -> (address, decimals)
    assets: BTreeMap<String, (Address, u8)>,
}

/// How a scenario step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    /// Failed as the scenario required
    ExpectedFailure,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub index: usize,
    pub action: &'static str,
    pub status: StepStatus,
    /// Error message of an expected failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Account liquidity recorded by a `check_liquidity` step.
#[derive(Debug, Clone, Serialize)]
pub struct LiquidityCheck {
    pub step: usize,
    pub account: String,
    pub liquidity: AccountLiquidity,
    /// Liquidity positive, shortfall negative (USD)
    pub net_usd: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectLiquidation {
    pub step: usize,
    pub liquidator: String,
    pub borrower: String,
    pub outcome: LiquidationOutcome,
}

/// End-of-run state of a named account. Amounts are decimal strings.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub name: String,
    pub address: Address,
    /// Asset symbol -> wallet balance
    pub balances: BTreeMap<String, String>,
    /// Claim symbol -> claim balance
    pub claims: BTreeMap<String, String>,
    /// Claim symbol -> owed underlying
    pub borrows: BTreeMap<String, String>,
    pub liquidity: AccountLiquidity,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub deployment: String,
    pub scenario: String,
    pub steps: Vec<StepResult>,
    pub flash_liquidations: Vec<LiquidationReport>,
    pub liquidations: Vec<DirectLiquidation>,
    pub liquidity_checks: Vec<LiquidityCheck>,
    pub accounts: Vec<AccountSummary>,
    pub block: u64,
}

/// What a successful step produced for the report.
enum StepEffect {
    None,
    FlashLiquidation(LiquidationReport),
    Liquidation(DirectLiquidation),
    Liquidity(LiquidityCheck),
}

impl Deployment {
    /// Stand up the protocol described by `resolved`.
    pub fn from_resolved(resolved: &ResolvedDeployment) -> Result<Self> {
        info!(deployment = %resolved.name, profile = %resolved.engine.profile, "Building deployment");

        let oracle = Arc::new(SimplePriceOracle::new());
        for asset in &resolved.assets {
            if let Some(price) = asset.price {
                oracle.set_direct_price(asset.address, price);
            }
        }

        let (mut protocol, admin) =
            Protocol::with_parameters(oracle.clone(), resolved.engine.risk.to_parameters())
                .context("invalid risk parameters")?;

        let mut assets = BTreeMap::new();
        for asset in &resolved.assets {
            protocol
                .register_asset(&admin, Asset::new(asset.address, &asset.symbol, asset.decimals))
                .with_context(|| format!("registering asset {}", asset.symbol))?;
            assets.insert(asset.symbol.clone(), (asset.address, asset.decimals));
        }

        let mut markets = BTreeMap::new();
        for market in &resolved.markets {
            let mut params = MarketParams::new(
                market.address,
                &market.symbol,
                market.underlying,
                rate_model(&market.rate_model),
            )
            .with_claim_decimals(market.claim_decimals)
            .with_reserve_factor(market.reserve_factor)
            .with_protocol_seize_share(market.protocol_seize_share);
            if let Some(rate) = market.initial_exchange_rate {
                params = params.with_initial_exchange_rate(rate);
            }

            let address = protocol
                .support_market(&admin, params)
                .with_context(|| format!("listing market {}", market.symbol))?;
            if !market.collateral_factor.is_zero() {
                protocol
                    .set_collateral_factor(&admin, address, market.collateral_factor)
                    .with_context(|| format!("collateral factor of {}", market.symbol))?;
            }
            if !market.borrow_cap.is_zero() {
                protocol.set_borrow_cap(&admin, address, market.borrow_cap)?;
            }
            if !market.supply_cap.is_zero() {
                protocol.set_supply_cap(&admin, address, market.supply_cap)?;
            }
            markets.insert(market.symbol.clone(), address);
        }

        // Named accounts trust every market with its underlying
        let approvals: Vec<(Address, Address)> = protocol
            .markets()
            .map(|m| (m.address(), m.underlying()))
            .collect();
        let mut accounts = BTreeMap::new();
        for account in &resolved.accounts {
            for (asset, amount) in &account.balances {
                protocol.faucet(*asset, account.address, *amount)?;
            }
            for (market, underlying) in &approvals {
                protocol.approve(account.address, *market, *underlying, U256::MAX);
            }
            accounts.insert(account.name.clone(), account.address);
        }

        let flash = match &resolved.flash {
            Some(flash) => {
                for (asset, amount) in &flash.liquidity {
                    protocol.faucet(*asset, flash.address, *amount)?;
                }
                Some(Arc::new(PoolFlashLender::new(flash.address, flash.fee_bps)))
            }
            None => None,
        };

        let routers = match &resolved.swap {
            Some(venue) => {
                for (asset, amount) in &venue.liquidity {
                    protocol.faucet(*asset, venue.address, *amount)?;
                }
                SwapRouterRegistry::new().with_router(Arc::new(OracleRouter::new(
                    oracle.clone(),
                    venue.address,
                    venue.fee,
                )))
            }
            None => SwapRouterRegistry::new(),
        };

        let executor = match &resolved.liquidator {
            Some(liquidator) => {
                let flash = flash.ok_or_else(|| anyhow!("liquidator configured without a flash source"))?;
                if routers.is_empty() {
                    warn!("Liquidator configured without a swap venue; cross-asset liquidations will fail");
                }
                Some(
                    LiquidationExecutor::new(liquidator.address, liquidator.debt_market, flash, routers)
                        .with_max_slippage_bps(liquidator.max_slippage_bps)
                        .with_min_profit(liquidator.min_profit),
                )
            }
            None => None,
        };

        info!(
            assets = assets.len(),
            markets = markets.len(),
            accounts = accounts.len(),
            executor = executor.is_some(),
            "Deployment ready"
        );

        Ok(Self {
            name: resolved.name.clone(),
            protocol,
            admin,
            oracle,
            executor,
            accounts,
            markets,
            assets,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn protocol_mut(&mut self) -> &mut Protocol {
        &mut self.protocol
    }

    pub fn admin(&self) -> &AdminCap {
        &self.admin
    }

    pub fn oracle(&self) -> &Arc<SimplePriceOracle> {
        &self.oracle
    }

    pub fn executor(&self) -> Option<&LiquidationExecutor> {
        self.executor.as_ref()
    }

    /// Account address by name, or a literal hex address.
    pub fn account(&self, name: &str) -> Result<Address> {
        if let Some(address) = self.accounts.get(name) {
            return Ok(*address);
        }
        name.parse::<Address>()
            .map_err(|_| anyhow!("Unknown account '{}'", name))
    }

    pub fn market(&self, symbol: &str) -> Result<Address> {
        self.markets
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow!("Unknown market '{}'", symbol))
    }

    pub fn asset(&self, symbol: &str) -> Result<(Address, u8)> {
        self.assets
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow!("Unknown asset '{}'", symbol))
    }

    /// Run every step of `scenario` in order.
    ///
    /// A step marked `expect_failure` must fail; any other failure, or an
    /// expected failure that succeeds, aborts the run.
    pub fn run_scenario(&mut self, scenario: &ScenarioConfig) -> Result<ScenarioReport> {
        info!(
            deployment = %self.name,
            scenario = %scenario.scenario.name,
            steps = scenario.steps.len(),
            "Running scenario"
        );

        let mut report = ScenarioReport {
            deployment: self.name.clone(),
            scenario: scenario.scenario.name.clone(),
            steps: Vec::with_capacity(scenario.steps.len()),
            flash_liquidations: Vec::new(),
            liquidations: Vec::new(),
            liquidity_checks: Vec::new(),
            accounts: Vec::new(),
            block: 0,
        };

        for (index, step) in scenario.steps.iter().enumerate() {
            let action = step.action.name();
            match (self.apply(index, &step.action), step.expect_failure) {
                (Ok(effect), false) => {
                    debug!(step = index, action, "Step succeeded");
                    match effect {
                        StepEffect::None => {}
                        StepEffect::FlashLiquidation(r) => report.flash_liquidations.push(r),
                        StepEffect::Liquidation(r) => report.liquidations.push(r),
                        StepEffect::Liquidity(r) => report.liquidity_checks.push(r),
                    }
                    report.steps.push(StepResult {
                        index,
                        action,
                        status: StepStatus::Ok,
                        error: None,
                    });
                }
                (Err(e), true) => {
                    info!(step = index, action, error = %format!("{:#}", e), "Step failed as expected");
                    report.steps.push(StepResult {
                        index,
                        action,
                        status: StepStatus::ExpectedFailure,
                        error: Some(format!("{:#}", e)),
                    });
                }
                (Err(e), false) => {
                    return Err(e.context(format!("step {} ({}) failed", index, action)));
                }
                (Ok(_), true) => {
                    bail!("step {} ({}) succeeded but was expected to fail", index, action);
                }
            }
        }

        report.accounts = self.account_summaries()?;
        report.block = self.protocol.block();
        info!(scenario = %report.scenario, block = report.block, "Scenario complete");
        Ok(report)
    }

    fn apply(&mut self, index: usize, action: &ScenarioAction) -> Result<StepEffect> {
        match action {
            ScenarioAction::Mint { account, market, amount } => {
                let (account, market) = (self.account(account)?, self.market(market)?);
                let amount = self.underlying_amount(market, amount)?;
                self.protocol.mint(account, market, amount)?;
            }
            ScenarioAction::Redeem { account, market, claims } => {
                let (account, market) = (self.account(account)?, self.market(market)?);
                let claims = if claims == MAX_AMOUNT {
                    self.protocol.claims_of(market, account)?
                } else {
                    let decimals = self.protocol.market(market)?.claim_decimals();
                    units(claims, decimals)?
                };
                self.protocol.redeem(account, market, claims)?;
            }
            ScenarioAction::RedeemUnderlying { account, market, amount } => {
                let (account, market) = (self.account(account)?, self.market(market)?);
                let amount = self.underlying_amount(market, amount)?;
                self.protocol.redeem_underlying(account, market, amount)?;
            }
            ScenarioAction::Borrow { account, market, amount } => {
                let (account, market) = (self.account(account)?, self.market(market)?);
                let amount = self.underlying_amount(market, amount)?;
                self.protocol.borrow(account, market, amount)?;
            }
            ScenarioAction::Repay { account, market, amount } => {
                let (account, market) = (self.account(account)?, self.market(market)?);
                let amount = self.repay_amount(market, amount)?;
                self.protocol.repay_borrow(account, market, amount)?;
            }
            ScenarioAction::RepayBehalf { payer, borrower, market, amount } => {
                let (payer, borrower) = (self.account(payer)?, self.account(borrower)?);
                let market = self.market(market)?;
                let amount = self.repay_amount(market, amount)?;
                self.protocol.repay_borrow_behalf(payer, borrower, market, amount)?;
            }
            ScenarioAction::EnterMarkets { account, markets } => {
                let account = self.account(account)?;
                let markets = markets
                    .iter()
                    .map(|m| self.market(m))
                    .collect::<Result<Vec<_>>>()?;
                self.protocol.enter_markets(account, &markets)?;
            }
            ScenarioAction::ExitMarket { account, market } => {
                let (account, market) = (self.account(account)?, self.market(market)?);
                self.protocol.exit_market(account, market)?;
            }
            ScenarioAction::TransferClaims { from, to, market, claims } => {
                let (from, to) = (self.account(from)?, self.account(to)?);
                let market = self.market(market)?;
                let claims = if claims == MAX_AMOUNT {
                    self.protocol.claims_of(market, from)?
                } else {
                    units(claims, self.protocol.market(market)?.claim_decimals())?
                };
                self.protocol.transfer_claims(from, to, market, claims)?;
            }
            ScenarioAction::SetPrice { asset, price_usd } => {
                let (address, _) = self.asset(asset)?;
                let price = units(price_usd, 18)?;
                info!(asset = %asset, price_usd = %price_usd, "Price set");
                self.oracle.set_direct_price(address, price);
            }
            ScenarioAction::SetCollateralFactor { market, collateral_factor } => {
                let market = self.market(market)?;
                self.protocol.set_collateral_factor(
                    &self.admin,
                    market,
                    u256_math::f64_to_wad(*collateral_factor),
                )?;
            }
            ScenarioAction::PauseMarket { market, paused } => {
                let market = self.market(market)?;
                self.protocol.set_market_paused(&self.admin, market, *paused)?;
            }
            ScenarioAction::AdvanceBlocks { blocks } => {
                self.protocol.advance_blocks(*blocks)?;
            }
            ScenarioAction::Liquidate {
                liquidator,
                borrower,
                repay_market,
                collateral_market,
                amount,
            } => {
                let (liquidator_addr, borrower_addr) =
                    (self.account(liquidator)?, self.account(borrower)?);
                let (repay_market, collateral_market) =
                    (self.market(repay_market)?, self.market(collateral_market)?);
                let amount = if amount == MAX_AMOUNT {
                    self.protocol.max_repay(borrower_addr, repay_market)?
                } else {
                    self.underlying_amount(repay_market, amount)?
                };
                let outcome = self.protocol.liquidate_borrow(
                    liquidator_addr,
                    borrower_addr,
                    repay_market,
                    amount,
                    collateral_market,
                )?;
                return Ok(StepEffect::Liquidation(DirectLiquidation {
                    step: index,
                    liquidator: liquidator.clone(),
                    borrower: borrower.clone(),
                    outcome,
                }));
            }
            ScenarioAction::FlashLiquidate {
                initiator,
                borrower,
                collateral_market,
                amount,
            } => {
                let executor = self
                    .executor
                    .as_ref()
                    .ok_or_else(|| anyhow!("deployment has no liquidator"))?;
                let (initiator, borrower) = (self.account(initiator)?, self.account(borrower)?);
                let collateral_market = match collateral_market {
                    Some(symbol) => self.market(symbol)?,
                    None => executor
                        .best_collateral(&self.protocol, borrower)?
                        .ok_or_else(|| anyhow!("borrower {} has no collateral", borrower))?,
                };

                match executor.estimate(&self.protocol, borrower, collateral_market) {
                    Ok(estimate) => info!(%estimate, "Flash liquidation estimate"),
                    Err(e) => debug!(error = %e, "No estimate available"),
                }

                let amount = if amount == MAX_AMOUNT {
                    self.protocol.max_repay(borrower, executor.debt_market())?
                } else {
                    let decimals = self.protocol.market(executor.debt_market())?.underlying_decimals();
                    units(amount, decimals)?
                };
                let report = executor.liquidate_entry(
                    &mut self.protocol,
                    initiator,
                    borrower,
                    amount,
                    collateral_market,
                )?;
                return Ok(StepEffect::FlashLiquidation(report));
            }
            ScenarioAction::CheckLiquidity { account } => {
                let address = self.account(account)?;
                let liquidity = self.protocol.account_liquidity(address)?;
                info!(account = %account, net_usd = liquidity.net_usd(), "Account liquidity");
                return Ok(StepEffect::Liquidity(LiquidityCheck {
                    step: index,
                    account: account.clone(),
                    liquidity,
                    net_usd: liquidity.net_usd(),
                }));
            }
        }
        Ok(StepEffect::None)
    }

    fn underlying_amount(&self, market: Address, amount: &str) -> Result<U256> {
        units(amount, self.protocol.market(market)?.underlying_decimals())
    }

    /// "max" repays the whole owed balance.
    fn repay_amount(&self, market: Address, amount: &str) -> Result<U256> {
        if amount == MAX_AMOUNT {
            return Ok(U256::MAX);
        }
        self.underlying_amount(market, amount)
    }

    fn account_summaries(&self) -> Result<Vec<AccountSummary>> {
        self.accounts
            .iter()
            .map(|(name, address)| {
                let balances = self
                    .assets
                    .iter()
                    .map(|(symbol, (asset, decimals))| {
                        let balance = self.protocol.balance_of(*asset, *address);
                        (symbol.clone(), u256_math::format_units(balance, *decimals))
                    })
                    .filter(|(_, balance)| balance != "0")
                    .collect();

                let mut claims = BTreeMap::new();
                let mut borrows = BTreeMap::new();
                for (symbol, market_addr) in &self.markets {
                    let market = self.protocol.market(*market_addr)?;
                    let held = market.claims_of(*address);
                    if !held.is_zero() {
                        claims.insert(
                            symbol.clone(),
                            u256_math::format_units(held, market.claim_decimals()),
                        );
                    }
                    let owed = market.borrow_balance(*address)?;
                    if !owed.is_zero() {
                        borrows.insert(
                            symbol.clone(),
                            u256_math::format_units(owed, market.underlying_decimals()),
                        );
                    }
                }

                Ok(AccountSummary {
                    name: name.clone(),
                    address: *address,
                    balances,
                    claims,
                    borrows,
                    liquidity: self.protocol.account_liquidity_stored(*address)?,
                })
            })
            .collect()
    }
}

fn rate_model(config: &RateModelConfig) -> Arc<dyn InterestRateModel> {
    match *config {
        RateModelConfig::WhitePaper {
            base_rate_per_year,
            multiplier_per_year,
        } => Arc::new(WhitePaperInterestRateModel::new(
            u256_math::f64_to_wad(base_rate_per_year),
            u256_math::f64_to_wad(multiplier_per_year),
        )),
        RateModelConfig::Jump {
            base_rate_per_year,
            multiplier_per_year,
            jump_multiplier_per_year,
            kink,
        } => Arc::new(JumpRateModel::new(
            u256_math::f64_to_wad(base_rate_per_year),
            u256_math::f64_to_wad(multiplier_per_year),
            u256_math::f64_to_wad(jump_multiplier_per_year),
            u256_math::f64_to_wad(kink),
        )),
    }
}

fn units(value: &str, decimals: u8) -> Result<U256> {
    u256_math::parse_units(value, decimals).map_err(|e| anyhow!(e))
}
