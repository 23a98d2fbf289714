use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Last known prices, keyed by symbol
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketSnapshot {
    prices: HashMap<String, Decimal>,
}

impl MarketSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(mut self, symbol: impl Into<String>, price: Decimal) -> Self {
        self.set_price(symbol, price);
        self
    }

    pub fn set_price(&mut self, symbol: impl Into<String>, price: Decimal) {
        self.prices.insert(symbol.into(), price);
    }

    /// Usable price for `symbol`; non-positive quotes count as missing.
    pub fn price(&self, symbol: &str) -> Option<Decimal> {
        self.prices
            .get(symbol)
            .copied()
            .filter(|p| *p > Decimal::ZERO)
    }
}

/// Account figures relevant to order admission
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub equity: Option<Decimal>,
}

impl AccountSnapshot {
    pub fn with_equity(equity: Decimal) -> Self {
        Self {
            equity: Some(equity),
        }
    }

    /// Usable equity; zero or negative equity counts as unknown.
    pub fn usable_equity(&self) -> Option<Decimal> {
        self.equity.filter(|e| *e > Decimal::ZERO)
    }
}
