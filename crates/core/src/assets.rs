//! Asset registry.
//!
//! Maps underlying asset addresses to their symbol and decimals. Entries are
//! immutable once registered: the decimals of an asset feed every USD
//! normalization, so changing them under live positions is never allowed.

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{ProtocolError, ProtocolResult};

/// Underlying asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Token address
    pub address: Address,
    /// Asset symbol (e.g., "WBTC", "USDT")
    pub symbol: String,
    /// Token decimals
    pub decimals: u8,
}

impl Asset {
    pub fn new(address: Address, symbol: impl Into<String>, decimals: u8) -> Self {
        Self {
            address,
            symbol: symbol.into(),
            decimals,
        }
    }
}

/// Asset registry for lookups by address or symbol.
#[derive(Debug, Clone, Default)]
pub struct AssetRegistry {
    by_address: HashMap<Address, Asset>,
    by_symbol: HashMap<String, Address>,
}

impl AssetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an asset.
    ///
    /// Registering the same asset twice is a no-op; re-registering an address
    /// with different decimals or symbol fails.
    pub fn register(&mut self, asset: Asset) -> ProtocolResult<()> {
        if let Some(existing) = self.by_address.get(&asset.address) {
            if *existing == asset {
                return Ok(());
            }
            return Err(ProtocolError::InvalidParameter(format!(
                "asset {} already registered as {} ({} decimals)",
                asset.address, existing.symbol, existing.decimals
            )));
        }
        if let Some(other) = self.by_symbol.get(&asset.symbol) {
            return Err(ProtocolError::InvalidParameter(format!(
                "symbol {} already used by {}",
                asset.symbol, other
            )));
        }

        self.by_symbol.insert(asset.symbol.clone(), asset.address);
        self.by_address.insert(asset.address, asset);
        Ok(())
    }

    /// Get asset by token address.
    pub fn get(&self, address: &Address) -> Option<&Asset> {
        self.by_address.get(address)
    }

    /// Get asset by symbol.
    pub fn get_by_symbol(&self, symbol: &str) -> Option<&Asset> {
        self.by_symbol
            .get(symbol)
            .and_then(|address| self.by_address.get(address))
    }

    /// Decimals of a registered asset.
    pub fn decimals(&self, address: &Address) -> ProtocolResult<u8> {
        self.get(address)
            .map(|a| a.decimals)
            .ok_or(ProtocolError::UnknownAsset(*address))
    }

    /// Symbol of an asset, falling back to its address for logs.
    pub fn symbol(&self, address: &Address) -> String {
        self.get(address)
            .map(|a| a.symbol.clone())
            .unwrap_or_else(|| address.to_string())
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.by_address.contains_key(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Asset> {
        self.by_address.values()
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wbtc() -> Asset {
        Asset::new(Address::repeat_byte(0xb7), "WBTC", 8)
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = AssetRegistry::new();
        registry.register(wbtc()).unwrap();
        registry
            .register(Asset::new(Address::repeat_byte(0xd7), "USDT", 6))
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get_by_symbol("USDT").unwrap().decimals, 6);
        assert_eq!(registry.decimals(&Address::repeat_byte(0xb7)).unwrap(), 8);
        assert_eq!(registry.symbol(&Address::repeat_byte(0xb7)), "WBTC");
    }

    #[test]
    fn test_reregister_is_idempotent() {
        let mut registry = AssetRegistry::new();
        registry.register(wbtc()).unwrap();
        registry.register(wbtc()).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_decimals_are_immutable() {
        let mut registry = AssetRegistry::new();
        registry.register(wbtc()).unwrap();

        let changed = Asset::new(Address::repeat_byte(0xb7), "WBTC", 18);
        assert!(matches!(
            registry.register(changed),
            Err(ProtocolError::InvalidParameter(_))
        ));
        assert_eq!(registry.decimals(&Address::repeat_byte(0xb7)).unwrap(), 8);
    }

    #[test]
    fn test_unknown_asset() {
        let registry = AssetRegistry::new();
        let missing = Address::repeat_byte(0x42);
        assert_eq!(
            registry.decimals(&missing),
            Err(ProtocolError::UnknownAsset(missing))
        );
    }
}
