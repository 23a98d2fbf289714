use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A completed round trip, as reported by the trade recorder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub trade_id: String,
    pub symbol: String,
    /// Realized PnL in account currency
    pub pnl: Decimal,
    /// Traded value (both legs) in account currency
    pub notional: Decimal,
    pub closed_at: DateTime<Utc>,
}

impl ClosedTrade {
    pub fn new(
        trade_id: impl Into<String>,
        symbol: impl Into<String>,
        pnl: Decimal,
        notional: Decimal,
        closed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            trade_id: trade_id.into(),
            symbol: symbol.into(),
            pnl,
            notional,
            closed_at,
        }
    }

    pub fn is_win(&self) -> bool {
        self.pnl > Decimal::ZERO
    }
}
