//! Grid position model: the DCA position together with its ladder of levels.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Side;

/// One rung of the grid ladder.
///
/// Prices and sizes are fixed when the ladder is built; only the fill fields change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    /// 1-based distance from the entry price on this side
    pub index: u32,
    pub side: Side,
    pub price: Decimal,
    /// Target size of the level in base currency
    pub quantity: Decimal,
    #[serde(default)]
    pub filled_quantity: Decimal,
    #[serde(default)]
    pub filled: bool,
    #[serde(default)]
    pub filled_at: Option<DateTime<Utc>>,
}

impl GridLevel {
    pub fn new(index: u32, side: Side, price: Decimal, quantity: Decimal) -> Self {
        Self {
            index,
            side,
            price,
            quantity,
            filled_quantity: Decimal::ZERO,
            filled: false,
            filled_at: None,
        }
    }

    /// Whether the market has traded through this level.
    pub fn is_crossed(&self, price: Decimal) -> bool {
        match self.side {
            Side::Buy => price <= self.price,
            Side::Sell => price >= self.price,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }
}

/// DCA position on one pair and one exchange.
///
/// `total_invested` is the sum of every buy fill (entry included) and is never
/// reduced by sells; sell proceeds accumulate separately. `average_price` is
/// always `total_invested / total_quantity` while the position holds size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridPosition {
    pub id: String,
    pub pair: String,
    pub exchange_id: String,
    pub total_quantity: Decimal,
    pub average_price: Decimal,
    pub total_invested: Decimal,
    /// Quote currency received from grid sell fills
    pub realized_proceeds: Decimal,
    pub current_price: Decimal,
    pub current_value: Decimal,
    pub levels: Vec<GridLevel>,
    pub status: PositionStatus,
    /// Hypothesis whose consensus opened this position
    #[serde(default)]
    pub hypothesis_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GridPosition {
    /// Open a position from the entry fill.
    pub fn open(
        pair: impl Into<String>,
        exchange_id: impl Into<String>,
        quantity: Decimal,
        price: Decimal,
        levels: Vec<GridLevel>,
    ) -> Self {
        let now = Utc::now();
        let mut position = Self {
            id: uuid::Uuid::new_v4().to_string(),
            pair: pair.into(),
            exchange_id: exchange_id.into(),
            total_quantity: Decimal::ZERO,
            average_price: Decimal::ZERO,
            total_invested: Decimal::ZERO,
            realized_proceeds: Decimal::ZERO,
            current_price: price,
            current_value: Decimal::ZERO,
            levels,
            status: PositionStatus::Open,
            hypothesis_id: None,
            created_at: now,
            updated_at: now,
        };
        position.record_buy(quantity, price);
        position
    }

    /// Add a buy fill and re-average.
    pub fn record_buy(&mut self, quantity: Decimal, price: Decimal) {
        self.total_invested += quantity * price;
        self.total_quantity += quantity;
        self.reaverage();
        self.mark(self.current_price);
    }

    /// Apply a sell fill, capped at the held quantity. Returns the quantity sold.
    pub fn record_sell(&mut self, quantity: Decimal, price: Decimal) -> Decimal {
        let sold = quantity.min(self.total_quantity);
        self.total_quantity -= sold;
        self.realized_proceeds += sold * price;
        self.reaverage();
        self.mark(self.current_price);
        sold
    }

    fn reaverage(&mut self) {
        self.average_price = if self.total_quantity > Decimal::ZERO {
            self.total_invested / self.total_quantity
        } else {
            Decimal::ZERO
        };
    }

    /// Mark the position to market.
    pub fn mark(&mut self, price: Decimal) {
        self.current_price = price;
        self.current_value = self.total_quantity * price;
        self.updated_at = Utc::now();
    }

    /// Mark value plus sell proceeds minus everything spent.
    pub fn unrealized_pnl(&self) -> Decimal {
        self.current_value + self.realized_proceeds - self.total_invested
    }

    /// P&L as a percentage of invested capital (1.0 = 1%).
    pub fn pnl_pct(&self) -> Decimal {
        if self.total_invested.is_zero() {
            return Decimal::ZERO;
        }
        self.unrealized_pnl() / self.total_invested * Decimal::ONE_HUNDRED
    }

    pub fn age(&self) -> Duration {
        Utc::now() - self.created_at
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Indices of unfilled levels the given price has crossed, nearest first.
    pub fn crossed_levels(&self, price: Decimal) -> Vec<usize> {
        let mut crossed: Vec<usize> = self
            .levels
            .iter()
            .enumerate()
            .filter(|(_, level)| !level.filled && level.is_crossed(price))
            .map(|(i, _)| i)
            .collect();
        crossed.sort_by_key(|&i| self.levels[i].index);
        crossed
    }

    /// Record a fill against a ladder level and update the position.
    pub fn fill_level(&mut self, level_idx: usize, quantity: Decimal, price: Decimal) -> Decimal {
        let Some(level) = self.levels.get(level_idx) else {
            return Decimal::ZERO;
        };
        let side = level.side;
        let applied = match side {
            Side::Buy => {
                self.record_buy(quantity, price);
                quantity
            }
            Side::Sell => self.record_sell(quantity, price),
        };
        if let Some(level) = self.levels.get_mut(level_idx) {
            level.filled_quantity = applied;
            level.filled = true;
            level.filled_at = Some(Utc::now());
        }
        applied
    }

    pub fn close(&mut self) {
        self.status = PositionStatus::Closed;
        self.updated_at = Utc::now();
    }

    /// Serialize the ladder for storage.
    pub fn levels_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.levels)
    }

    pub fn levels_from_json(json: &str) -> serde_json::Result<Vec<GridLevel>> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ladder() -> Vec<GridLevel> {
        vec![
            GridLevel::new(1, Side::Buy, dec!(49000), dec!(0.002)),
            GridLevel::new(2, Side::Buy, dec!(48000), dec!(0.002)),
            GridLevel::new(1, Side::Sell, dec!(51000), dec!(0.002)),
            GridLevel::new(2, Side::Sell, dec!(52000), dec!(0.002)),
        ]
    }

    fn assert_average_invariant(pos: &GridPosition) {
        if pos.total_quantity > Decimal::ZERO {
            assert_eq!(pos.average_price, pos.total_invested / pos.total_quantity);
        }
    }

    #[test]
    fn test_open_sets_cost_basis() {
        let pos = GridPosition::open("BTC/USDT", "binance", dec!(0.01), dec!(50000), ladder());
        assert_eq!(pos.total_invested, dec!(500));
        assert_eq!(pos.average_price, dec!(50000));
        assert_eq!(pos.current_value, dec!(500));
        assert!(pos.levels.iter().all(|l| !l.filled));
        assert_average_invariant(&pos);
    }

    #[test]
    fn test_average_invariant_holds_after_every_fill() {
        let mut pos = GridPosition::open("BTC/USDT", "binance", dec!(0.01), dec!(50000), ladder());

        pos.fill_level(0, dec!(0.002), dec!(49000));
        assert_average_invariant(&pos);
        assert_eq!(pos.total_invested, dec!(598));
        assert_eq!(pos.total_quantity, dec!(0.012));

        pos.fill_level(1, dec!(0.002), dec!(48000));
        assert_average_invariant(&pos);

        pos.fill_level(2, dec!(0.002), dec!(51000));
        assert_average_invariant(&pos);
        assert_eq!(pos.total_quantity, dec!(0.012));
        // Sells never touch the buy-side cost sum
        assert_eq!(pos.total_invested, dec!(694));
        assert_eq!(pos.realized_proceeds, dec!(102));
    }

    #[test]
    fn test_sell_is_capped_at_holdings() {
        let mut pos = GridPosition::open("ETH/USDT", "kucoin", dec!(1), dec!(3000), Vec::new());
        let sold = pos.record_sell(dec!(2), dec!(3100));
        assert_eq!(sold, dec!(1));
        assert_eq!(pos.total_quantity, Decimal::ZERO);
        assert_eq!(pos.average_price, Decimal::ZERO);
    }

    #[test]
    fn test_crossed_levels() {
        let pos = GridPosition::open("BTC/USDT", "binance", dec!(0.01), dec!(50000), ladder());
        assert_eq!(pos.crossed_levels(dec!(50000)), Vec::<usize>::new());
        assert_eq!(pos.crossed_levels(dec!(48500)), vec![0]);
        assert_eq!(pos.crossed_levels(dec!(47000)), vec![0, 1]);
        assert_eq!(pos.crossed_levels(dec!(52500)), vec![2, 3]);
    }

    #[test]
    fn test_pnl_includes_proceeds() {
        let mut pos = GridPosition::open("BTC/USDT", "binance", dec!(0.01), dec!(50000), ladder());
        pos.mark(dec!(50500));
        assert_eq!(pos.unrealized_pnl(), dec!(5));
        assert_eq!(pos.pnl_pct(), dec!(1));

        pos.record_sell(dec!(0.005), dec!(50500));
        pos.mark(dec!(50500));
        assert_eq!(pos.unrealized_pnl(), dec!(5));
    }

    #[test]
    fn test_ladder_json_round_trip() {
        let mut pos = GridPosition::open("BTC/USDT", "binance", dec!(0.01), dec!(50000), ladder());
        pos.fill_level(0, dec!(0.002), dec!(49000));

        let json = pos.levels_json().unwrap();
        let restored = GridPosition::levels_from_json(&json).unwrap();

        assert_eq!(restored.len(), pos.levels.len());
        for (a, b) in restored.iter().zip(pos.levels.iter()) {
            assert_eq!(a.price, b.price);
            assert_eq!(a.side, b.side);
            assert_eq!(a.filled, b.filled);
        }
        assert_eq!(restored, pos.levels);
    }
}
