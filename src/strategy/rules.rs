//! Entry filters, exit checks and order sizing.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::indicators::{IndicatorSet, Signal};
use crate::models::{GridPosition, SentimentSnapshot};

use super::StrategyConfig;

const QTY_DP: u32 = 8;

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    ProfitTarget,
    StopLoss,
    MaxDuration,
    Shutdown,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::ProfitTarget => "profit_target",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::MaxDuration => "max_duration",
            ExitReason::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All entry filters must hold. `Err` names the first one that fails.
pub fn check_entry(
    set: &IndicatorSet,
    sentiment: &SentimentSnapshot,
    config: &StrategyConfig,
) -> Result<(), String> {
    let rsi = set.rsi.value;
    if rsi < config.rsi_min || rsi > config.rsi_max {
        return Err(format!("RSI {:.1} outside [{}, {}]", rsi, config.rsi_min, config.rsi_max));
    }

    if set.macd.signal == Signal::Sell {
        return Err(format!(
            "MACD bearish ({:.4} < signal {:.4})",
            set.macd.value, set.macd_signal
        ));
    }

    if set.price < set.bollinger_lower || set.price > set.bollinger_upper {
        return Err(format!(
            "price {:.4} outside Bollinger [{:.4}, {:.4}]",
            set.price, set.bollinger_lower, set.bollinger_upper
        ));
    }

    let fg = sentiment.fear_greed_index;
    if fg < config.fear_greed_min || fg > config.fear_greed_max {
        return Err(format!(
            "fear/greed {} outside [{}, {}]",
            fg, config.fear_greed_min, config.fear_greed_max
        ));
    }

    if set.volume < set.volume_avg * config.min_volume_ratio {
        return Err(format!(
            "volume {:.2} below {:.0}% of average {:.2}",
            set.volume,
            config.min_volume_ratio * 100.0,
            set.volume_avg
        ));
    }

    Ok(())
}

/// First exit condition met, checked in order: profit target, stop loss, age.
pub fn exit_reason(
    position: &GridPosition,
    config: &StrategyConfig,
    now: DateTime<Utc>,
) -> Option<ExitReason> {
    let pnl_pct = position.pnl_pct();
    if pnl_pct >= config.profit_target_pct {
        return Some(ExitReason::ProfitTarget);
    }
    if pnl_pct <= config.stop_loss_pct {
        return Some(ExitReason::StopLoss);
    }
    if now - position.created_at >= Duration::hours(config.max_duration_hours) {
        return Some(ExitReason::MaxDuration);
    }
    None
}

/// Entry quantity from the free quote balance, scaled by `factor`.
///
/// `None` when the order value falls below `min_notional`.
pub fn entry_quantity(
    free_quote: Decimal,
    price: Decimal,
    config: &StrategyConfig,
    min_notional: Decimal,
    factor: f64,
) -> Option<Decimal> {
    if price <= Decimal::ZERO {
        return None;
    }
    let factor = Decimal::from_f64(factor).unwrap_or(Decimal::ONE);
    let value = free_quote * config.position_size_pct / Decimal::ONE_HUNDRED * factor;
    if value < min_notional.max(config.min_notional) {
        return None;
    }
    let quantity = (value / price).round_dp(QTY_DP);
    (quantity > Decimal::ZERO).then_some(quantity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::IndicatorReading;
    use rust_decimal_macros::dec;

    fn reading(value: f64, signal: Signal) -> IndicatorReading {
        IndicatorReading {
            value,
            signal,
            strength: 0.5,
        }
    }

    fn passing_set() -> IndicatorSet {
        IndicatorSet {
            price: 100.0,
            volume: 120.0,
            volume_avg: 100.0,
            rsi: reading(50.0, Signal::Neutral),
            macd: reading(0.5, Signal::Buy),
            macd_signal: 0.3,
            macd_histogram: 0.2,
            bollinger: reading(99.0, Signal::Neutral),
            bollinger_upper: 105.0,
            bollinger_lower: 93.0,
            bollinger_width_pct: 12.1,
            sma_20: 99.0,
            sma_50: 98.0,
            sma_200: None,
            stochastic: reading(55.0, Signal::Neutral),
            stochastic_d: 52.0,
            adx: reading(18.0, Signal::Neutral),
            plus_di: 20.0,
            minus_di: 18.0,
            atr: reading(1.5, Signal::Neutral),
            atr_pct: 1.5,
            computed_at: Utc::now(),
        }
    }

    fn sentiment(fg: u32) -> SentimentSnapshot {
        SentimentSnapshot {
            fear_greed_index: fg,
            ..SentimentSnapshot::neutral()
        }
    }

    #[test]
    fn test_entry_filters() {
        let config = StrategyConfig::default();
        assert!(check_entry(&passing_set(), &sentiment(50), &config).is_ok());

        let mut overbought = passing_set();
        overbought.rsi = reading(75.0, Signal::Sell);
        assert!(check_entry(&overbought, &sentiment(50), &config).unwrap_err().contains("RSI"));

        let mut bearish = passing_set();
        bearish.macd = reading(-0.5, Signal::Sell);
        assert!(check_entry(&bearish, &sentiment(50), &config).unwrap_err().contains("MACD"));

        let mut above_band = passing_set();
        above_band.price = 106.0;
        assert!(check_entry(&above_band, &sentiment(50), &config).is_err());

        assert!(check_entry(&passing_set(), &sentiment(85), &config)
            .unwrap_err()
            .contains("fear/greed"));
        assert!(check_entry(&passing_set(), &sentiment(20), &config).is_ok());

        let mut thin = passing_set();
        thin.volume = 40.0;
        assert!(check_entry(&thin, &sentiment(50), &config).unwrap_err().contains("volume"));
    }

    #[test]
    fn test_exit_priority() {
        let config = StrategyConfig::default();
        let now = Utc::now();

        let mut pos = GridPosition::open("BTC/USDT", "binance", dec!(0.01), dec!(50000), Vec::new());
        assert_eq!(exit_reason(&pos, &config, now), None);

        pos.mark(dec!(50500));
        assert_eq!(exit_reason(&pos, &config, now), Some(ExitReason::ProfitTarget));

        pos.mark(dec!(48500));
        assert_eq!(exit_reason(&pos, &config, now), Some(ExitReason::StopLoss));

        // Profit target wins over an expired position
        pos.mark(dec!(51000));
        let later = now + Duration::hours(73);
        assert_eq!(exit_reason(&pos, &config, later), Some(ExitReason::ProfitTarget));

        pos.mark(dec!(50000));
        assert_eq!(exit_reason(&pos, &config, later), Some(ExitReason::MaxDuration));
    }

    #[test]
    fn test_entry_quantity() {
        let config = StrategyConfig::default();

        // 1% of 5000 = 50 USDT at 50000
        assert_eq!(
            entry_quantity(dec!(5000), dec!(50000), &config, dec!(10), 1.0),
            Some(dec!(0.001))
        );
        // 1% of 500 = 5 USDT, below the 10 USDT minimum
        assert_eq!(entry_quantity(dec!(500), dec!(50000), &config, dec!(10), 1.0), None);
        // Exchange minimum above the configured one
        assert_eq!(entry_quantity(dec!(5000), dec!(50000), &config, dec!(100), 1.0), None);
    }
}
