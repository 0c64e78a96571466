//! Price oracle interface.
//!
//! The engine only ever asks one question: what is this asset worth in USD
//! right now? Prices are USD per *whole* token at 1e18 scale ($1.00 = 1e18),
//! independent of the token's decimals. Normalizing raw amounts by decimals is
//! the caller's job.

use alloy::primitives::{Address, U256};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;

use crate::WAD;

/// Core trait for price lookups.
///
/// Lookups are synchronous: an unavailable price is reported as `None` and the
/// calling operation fails instead of waiting.
pub trait PriceOracle: Send + Sync + Debug {
    /// USD price per whole token (1e18 scale), or `None` if unavailable.
    fn price(&self, asset: Address) -> Option<U256>;

    /// Validate price against sanity checks.
    fn validate_price(&self, price: U256) -> bool {
        !price.is_zero()
    }

    /// Price that passed validation.
    fn checked_price(&self, asset: Address) -> Option<U256> {
        self.price(asset).filter(|p| self.validate_price(*p))
    }
}

/// Oracle whose prices are set directly by an operator.
///
/// Prices live behind a lock so the oracle can be shared (`Arc`) between the
/// risk engine and a swap router while an administrator moves prices.
#[derive(Debug, Default)]
pub struct SimplePriceOracle {
    prices: RwLock<HashMap<Address, U256>>,
}

impl SimplePriceOracle {
    /// Create an oracle with no prices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the raw 1e18-scaled price of an asset.
    pub fn set_direct_price(&self, asset: Address, price: U256) {
        tracing::debug!(asset = %asset, price = %price, "Price updated");
        self.prices.write().insert(asset, price);
    }

    /// Set a whole-dollar price (e.g. 40_000 for $40,000).
    pub fn set_price_usd(&self, asset: Address, usd: u64) {
        self.set_direct_price(asset, U256::from(usd) * WAD);
    }

    /// Remove the price of an asset, making it unavailable.
    pub fn clear_price(&self, asset: Address) {
        self.prices.write().remove(&asset);
    }

    /// Number of priced assets.
    pub fn len(&self) -> usize {
        self.prices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.read().is_empty()
    }
}

impl PriceOracle for SimplePriceOracle {
    fn price(&self, asset: Address) -> Option<U256> {
        self.prices.read().get(&asset).copied()
    }
}
