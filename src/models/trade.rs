//! Closed-position record appended to trade history.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{GridPosition, IndicatorSnapshot, SentimentSnapshot, Side};

/// Realized outcome of a grid position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub position_id: String,
    pub pair: String,
    pub exchange_id: String,
    pub side: Side,
    /// Quantity sold on close
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub total_invested: Decimal,
    pub realized_pnl: Decimal,
    pub realized_pnl_pct: Decimal,
    pub exit_reason: String,
    #[serde(default)]
    pub rsi: Option<f64>,
    #[serde(default)]
    pub macd: Option<f64>,
    #[serde(default)]
    pub fear_greed_index: Option<u32>,
    #[serde(default)]
    pub sentiment: Option<String>,
    #[serde(default)]
    pub agents: Vec<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl TradeRecord {
    /// Build the history record for a position closed at `exit_price`.
    pub fn from_close(
        position: &GridPosition,
        quantity: Decimal,
        exit_price: Decimal,
        exit_reason: &str,
    ) -> Self {
        let exit_value = quantity * exit_price;
        let realized_pnl = exit_value + position.realized_proceeds - position.total_invested;
        let realized_pnl_pct = if position.total_invested.is_zero() {
            Decimal::ZERO
        } else {
            realized_pnl / position.total_invested * Decimal::ONE_HUNDRED
        };

        Self {
            position_id: position.id.clone(),
            pair: position.pair.clone(),
            exchange_id: position.exchange_id.clone(),
            side: Side::Sell,
            quantity,
            entry_price: position.average_price,
            exit_price,
            total_invested: position.total_invested,
            realized_pnl,
            realized_pnl_pct,
            exit_reason: exit_reason.to_string(),
            rsi: None,
            macd: None,
            fear_greed_index: None,
            sentiment: None,
            agents: Vec::new(),
            opened_at: position.created_at,
            closed_at: Utc::now(),
        }
    }

    /// Attach the market context at close time.
    pub fn with_context(
        mut self,
        indicators: Option<&IndicatorSnapshot>,
        sentiment: Option<&SentimentSnapshot>,
    ) -> Self {
        if let Some(ind) = indicators {
            self.rsi = ind.rsi;
            self.macd = ind.macd;
        }
        if let Some(s) = sentiment {
            self.fear_greed_index = Some(s.fear_greed_index);
            self.sentiment = Some(s.classification.as_str().to_string());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_realized_pnl_on_close() {
        let mut pos = GridPosition::open("BTC/USDT", "binance", dec!(0.01), dec!(50000), Vec::new());
        pos.record_buy(dec!(0.01), dec!(48000));
        // invested 980 for 0.02
        let record = TradeRecord::from_close(&pos, dec!(0.02), dec!(49500), "take_profit");
        assert_eq!(record.realized_pnl, dec!(10));
        assert_eq!(record.entry_price, dec!(49000));
        assert!(record.realized_pnl > Decimal::ZERO);
    }
}
