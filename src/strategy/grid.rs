//! Grid ladder construction.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::models::{GridLevel, Side};

use super::Regime;

/// Quantity precision for level sizes.
const QTY_DP: u32 = 8;
/// Price precision for level prices.
const PRICE_DP: u32 = 8;

/// Spacing and level count for one ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridSpec {
    pub spacing: Decimal,
    pub levels_per_side: u32,
}

impl GridSpec {
    /// Midpoint spacing for the regime, with the total level count pulled into
    /// the range that keeps `spacing x levels` inside the regime width.
    pub fn for_regime(regime: Regime, requested_levels: u32) -> Self {
        let spacing = regime.default_spacing();
        let (min_width, max_width) = regime.width_range();

        let min_levels = (min_width / spacing).ceil();
        let max_levels = (max_width / spacing).floor();
        let total = Decimal::from(requested_levels).clamp(min_levels, max_levels);

        let per_side = (total / Decimal::TWO).floor();
        let levels_per_side = per_side.to_u32().unwrap_or(1).max(1);

        Self {
            spacing,
            levels_per_side,
        }
    }

    pub fn width(&self) -> Decimal {
        self.spacing * Decimal::from(self.levels_per_side * 2)
    }
}

/// Symmetric ladder around `entry`: buys at `entry * (1 - s*i)`, sells at
/// `entry * (1 + s*i)`, each sized at `quantity / levels_per_side`.
pub fn build_ladder(entry: Decimal, quantity: Decimal, spec: GridSpec) -> Vec<GridLevel> {
    let per_side = Decimal::from(spec.levels_per_side);
    let level_qty = (quantity / per_side).round_dp(QTY_DP);

    let mut levels = Vec::with_capacity(spec.levels_per_side as usize * 2);
    for i in 1..=spec.levels_per_side {
        let offset = spec.spacing * Decimal::from(i);
        levels.push(GridLevel::new(
            i,
            Side::Buy,
            (entry * (Decimal::ONE - offset)).round_dp(PRICE_DP),
            level_qty,
        ));
    }
    for i in 1..=spec.levels_per_side {
        let offset = spec.spacing * Decimal::from(i);
        levels.push(GridLevel::new(
            i,
            Side::Sell,
            (entry * (Decimal::ONE + offset)).round_dp(PRICE_DP),
            level_qty,
        ));
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_btc_sideways_first_levels() {
        let spec = GridSpec::for_regime(Regime::Sideways, 10);
        assert_eq!(spec.spacing, dec!(0.02));
        assert_eq!(spec.levels_per_side, 5);

        let ladder = build_ladder(dec!(50000), dec!(0.01), spec);
        assert_eq!(ladder.len(), 10);

        let first_buy = ladder.iter().find(|l| l.side == Side::Buy && l.index == 1).unwrap();
        let first_sell = ladder.iter().find(|l| l.side == Side::Sell && l.index == 1).unwrap();
        assert_eq!(first_buy.price, dec!(49000));
        assert_eq!(first_sell.price, dec!(51000));
        assert!(!first_buy.filled);
        assert!(!first_sell.filled);
        assert_eq!(first_buy.quantity, dec!(0.002));
    }

    #[test]
    fn test_level_count_kept_inside_width() {
        // 2% x 30 levels would be 60% wide; capped at 12 levels (24%)
        let wide = GridSpec::for_regime(Regime::Sideways, 30);
        assert_eq!(wide.levels_per_side, 6);
        assert!(wide.width() <= dec!(0.25));

        // 3.5% x 2 levels is too narrow; raised to 8 levels (28%)
        let narrow = GridSpec::for_regime(Regime::Trending, 2);
        assert_eq!(narrow.levels_per_side, 4);
        assert!(narrow.width() >= dec!(0.25));
    }

    #[test]
    fn test_trending_ladder_is_symmetric() {
        let spec = GridSpec::for_regime(Regime::Trending, 10);
        let ladder = build_ladder(dec!(100), dec!(5), spec);
        for i in 1..=spec.levels_per_side {
            let buy = ladder.iter().find(|l| l.side == Side::Buy && l.index == i).unwrap();
            let sell = ladder.iter().find(|l| l.side == Side::Sell && l.index == i).unwrap();
            assert_eq!(dec!(100) - buy.price, sell.price - dec!(100));
        }
    }
}
