//! Market data and order primitives shared by the exchange layer and the engine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of an order or grid level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// Point-in-time ticker for one symbol on one exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// Unified symbol, e.g. `BTC/USDT`
    pub symbol: String,

    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,

    /// Base-asset volume over the exchange's rolling 24h window
    #[serde(default)]
    pub volume: Decimal,

    /// 24h percent change
    #[serde(default)]
    pub change_pct: Decimal,

    pub timestamp: DateTime<Utc>,
}

impl MarketSnapshot {
    /// Price a taker would pay on the given side.
    pub fn price_for(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.ask,
            Side::Sell => self.bid,
        }
    }
}

/// One OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Balance of a single currency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub free: Decimal,
    pub used: Decimal,
}

impl Balance {
    pub fn total(&self) -> Decimal {
        self.free + self.used
    }
}

/// Order as submitted to an exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
}

/// Exchange acknowledgement of a created order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub filled: Decimal,
    /// Average fill price when the exchange reports one
    #[serde(default)]
    pub average: Option<Decimal>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// Resting order as reported by `fetch_open_orders`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    #[serde(default)]
    pub price: Option<Decimal>,
    pub amount: Decimal,
    #[serde(default)]
    pub filled: Decimal,
}

/// Outcome of `place_order` / `cancel_order`.
///
/// Ordinary exchange rejections land here with `success == false`; only contract
/// violations surface as errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub average_price: Option<Decimal>,
    pub filled: Decimal,
    pub raw: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl OrderResult {
    pub fn accepted(ack: OrderAck) -> Self {
        Self {
            success: true,
            order_id: Some(ack.id),
            average_price: ack.average,
            filled: ack.filled,
            raw: Some(ack.raw),
            error: None,
        }
    }

    pub fn cancelled(order_id: &str, raw: serde_json::Value) -> Self {
        Self {
            success: true,
            order_id: Some(order_id.to_string()),
            average_price: None,
            filled: Decimal::ZERO,
            raw: Some(raw),
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            average_price: None,
            filled: Decimal::ZERO,
            raw: None,
            error: Some(error.into()),
        }
    }
}

/// Split a unified symbol into `(base, quote)`.
pub fn split_symbol(symbol: &str) -> Option<(&str, &str)> {
    let (base, quote) = symbol.split_once('/')?;
    if base.is_empty() || quote.is_empty() {
        return None;
    }
    Some((base, quote))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot() -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTC/USDT".to_string(),
            bid: dec!(49990),
            ask: dec!(50010),
            last: dec!(50000),
            volume: dec!(1200),
            change_pct: dec!(1.5),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_price_for_side() {
        let snap = snapshot();
        assert_eq!(snap.price_for(Side::Buy), dec!(50010));
        assert_eq!(snap.price_for(Side::Sell), dec!(49990));
    }

    #[test]
    fn test_split_symbol() {
        assert_eq!(split_symbol("ETH/USDC"), Some(("ETH", "USDC")));
        assert_eq!(split_symbol("ETHUSDC"), None);
        assert_eq!(split_symbol("/USDC"), None);
    }
}
