use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

/// An order about to be submitted, as seen by the admission guard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// Quantity in base units
    pub amount: Decimal,
    /// Limit price; `None` for market orders
    pub price: Option<Decimal>,
}

impl Order {
    pub fn limit(
        strategy_id: impl Into<String>,
        symbol: impl Into<String>,
        side: OrderSide,
        amount: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            order_id: Uuid::new_v4().to_string(),
            strategy_id: strategy_id.into(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            amount,
            price: Some(price),
        }
    }

    pub fn market(
        strategy_id: impl Into<String>,
        symbol: impl Into<String>,
        side: OrderSide,
        amount: Decimal,
    ) -> Self {
        Self {
            order_id: Uuid::new_v4().to_string(),
            strategy_id: strategy_id.into(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            amount,
            price: None,
        }
    }

    pub fn is_limit(&self) -> bool {
        self.order_type == OrderType::Limit
    }

    /// Sell orders are the only ones a reduce-only strategy may submit.
    pub fn is_reducing(&self) -> bool {
        self.side == OrderSide::Sell
    }
}
