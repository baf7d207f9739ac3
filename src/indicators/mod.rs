//! Technical indicators: formulas, signal classification and the per-pair engine.

mod engine;
pub mod math;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::IndicatorSnapshot;

pub use engine::IndicatorEngine;

pub const RSI_PERIOD: usize = 14;
pub const RSI_OVERSOLD: f64 = 30.0;
pub const RSI_OVERBOUGHT: f64 = 70.0;
pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;
pub const BOLLINGER_PERIOD: usize = 20;
pub const BOLLINGER_STD: f64 = 2.0;
pub const STOCH_K: usize = 14;
pub const STOCH_D: usize = 3;
pub const STOCH_OVERBOUGHT: f64 = 80.0;
pub const STOCH_OVERSOLD: f64 = 20.0;
pub const ADX_PERIOD: usize = 14;
pub const ADX_STRONG: f64 = 25.0;
pub const ADX_WEAK: f64 = 20.0;
pub const ATR_PERIOD: usize = 14;
/// Volume average window used by the entry filter
pub const VOLUME_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Buy,
    Sell,
    Neutral,
}

/// One indicator value with its signal and a heuristic strength in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorReading {
    pub value: f64,
    pub signal: Signal,
    pub strength: f64,
}

impl IndicatorReading {
    fn new(value: f64, signal: Signal, strength: f64) -> Self {
        Self {
            value,
            signal,
            strength: strength.clamp(0.0, 1.0),
        }
    }
}

/// Full indicator set for one pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub price: f64,
    pub volume: f64,
    pub volume_avg: f64,
    pub rsi: IndicatorReading,
    /// `value` is the MACD line
    pub macd: IndicatorReading,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    /// `value` is the middle band
    pub bollinger: IndicatorReading,
    pub bollinger_upper: f64,
    pub bollinger_lower: f64,
    pub bollinger_width_pct: f64,
    pub sma_20: f64,
    pub sma_50: f64,
    /// Needs 200 points
    pub sma_200: Option<f64>,
    /// `value` is %K
    pub stochastic: IndicatorReading,
    pub stochastic_d: f64,
    pub adx: IndicatorReading,
    pub plus_di: f64,
    pub minus_di: f64,
    pub atr: IndicatorReading,
    pub atr_pct: f64,
    pub computed_at: DateTime<Utc>,
}

impl IndicatorSet {
    /// Signal-bearing readings, used for vote counting.
    pub fn readings(&self) -> [(&'static str, &IndicatorReading); 6] {
        [
            ("rsi", &self.rsi),
            ("macd", &self.macd),
            ("bollinger", &self.bollinger),
            ("stochastic", &self.stochastic),
            ("adx", &self.adx),
            ("atr", &self.atr),
        ]
    }

    /// `(buy, sell, total)` signal counts.
    pub fn signal_counts(&self) -> (usize, usize, usize) {
        let readings = self.readings();
        let buy = readings.iter().filter(|(_, r)| r.signal == Signal::Buy).count();
        let sell = readings.iter().filter(|(_, r)| r.signal == Signal::Sell).count();
        (buy, sell, readings.len())
    }

    pub fn snapshot(&self) -> IndicatorSnapshot {
        IndicatorSnapshot {
            rsi: Some(self.rsi.value),
            macd: Some(self.macd.value),
            macd_signal: Some(self.macd_signal),
            atr: Some(self.atr.value),
            adx: Some(self.adx.value),
            bollinger_upper: Some(self.bollinger_upper),
            bollinger_lower: Some(self.bollinger_lower),
            volume: Some(self.volume),
            volume_avg: Some(self.volume_avg),
        }
    }
}

pub fn classify_rsi(rsi: f64) -> IndicatorReading {
    if rsi < RSI_OVERSOLD {
        IndicatorReading::new(rsi, Signal::Buy, (RSI_OVERSOLD - rsi) / RSI_OVERSOLD)
    } else if rsi > RSI_OVERBOUGHT {
        IndicatorReading::new(rsi, Signal::Sell, (rsi - RSI_OVERBOUGHT) / (100.0 - RSI_OVERBOUGHT))
    } else {
        IndicatorReading::new(rsi, Signal::Neutral, 0.5)
    }
}

pub fn classify_macd(out: &math::MacdOutput) -> IndicatorReading {
    let strength = if out.macd != 0.0 {
        (out.histogram.abs() / out.macd.abs()).min(1.0)
    } else {
        0.5
    };
    if out.macd > out.signal {
        IndicatorReading::new(out.macd, Signal::Buy, strength)
    } else if out.macd < out.signal {
        IndicatorReading::new(out.macd, Signal::Sell, strength)
    } else {
        IndicatorReading::new(out.macd, Signal::Neutral, 0.5)
    }
}

pub fn classify_bollinger(price: f64, bands: &math::BandsOutput) -> IndicatorReading {
    let width = bands.upper - bands.lower;
    let position = if width > 0.0 {
        (price - bands.lower) / width
    } else {
        0.5
    };
    if price <= bands.lower && width > 0.0 {
        IndicatorReading::new(bands.middle, Signal::Buy, 1.0 - position)
    } else if price >= bands.upper && width > 0.0 {
        IndicatorReading::new(bands.middle, Signal::Sell, position)
    } else {
        IndicatorReading::new(bands.middle, Signal::Neutral, 0.5)
    }
}

pub fn classify_stochastic(out: &math::StochasticOutput) -> IndicatorReading {
    if out.k < STOCH_OVERSOLD && out.d < STOCH_OVERSOLD {
        IndicatorReading::new(out.k, Signal::Buy, (STOCH_OVERSOLD - out.k) / STOCH_OVERSOLD)
    } else if out.k > STOCH_OVERBOUGHT && out.d > STOCH_OVERBOUGHT {
        IndicatorReading::new(out.k, Signal::Sell, (out.k - STOCH_OVERBOUGHT) / (100.0 - STOCH_OVERBOUGHT))
    } else {
        IndicatorReading::new(out.k, Signal::Neutral, 0.5)
    }
}

pub fn classify_adx(out: &math::AdxOutput) -> IndicatorReading {
    if out.adx > ADX_STRONG {
        let signal = if out.plus_di > out.minus_di {
            Signal::Buy
        } else {
            Signal::Sell
        };
        IndicatorReading::new(out.adx, signal, 0.8)
    } else if out.adx > ADX_WEAK {
        IndicatorReading::new(out.adx, Signal::Neutral, 0.5)
    } else {
        IndicatorReading::new(out.adx, Signal::Neutral, 0.2)
    }
}

/// ATR carries no direction; strength grows with volatility.
pub fn classify_atr(atr: f64, atr_pct: f64) -> IndicatorReading {
    let strength = if atr_pct < 1.0 {
        0.3
    } else if atr_pct < 3.0 {
        0.6
    } else {
        0.9
    };
    IndicatorReading::new(atr, Signal::Neutral, strength)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rsi_classification() {
        let oversold = classify_rsi(15.0);
        assert_eq!(oversold.signal, Signal::Buy);
        assert_eq!(oversold.strength, 0.5);

        let overbought = classify_rsi(85.0);
        assert_eq!(overbought.signal, Signal::Sell);
        assert!((overbought.strength - 0.5).abs() < 1e-9);

        assert_eq!(classify_rsi(50.0).signal, Signal::Neutral);
        assert_eq!(classify_rsi(30.0).signal, Signal::Neutral);
    }

    #[test]
    fn test_bollinger_outside_bands() {
        let bands = math::BandsOutput {
            upper: 110.0,
            middle: 100.0,
            lower: 90.0,
            width_pct: 20.0,
        };
        assert_eq!(classify_bollinger(89.0, &bands).signal, Signal::Buy);
        assert_eq!(classify_bollinger(111.0, &bands).signal, Signal::Sell);
        assert_eq!(classify_bollinger(100.0, &bands).signal, Signal::Neutral);
    }

    #[test]
    fn test_adx_direction_only_when_strong() {
        let strong = math::AdxOutput {
            adx: 30.0,
            plus_di: 10.0,
            minus_di: 25.0,
        };
        assert_eq!(classify_adx(&strong).signal, Signal::Sell);

        let weak = math::AdxOutput { adx: 22.0, ..strong };
        let reading = classify_adx(&weak);
        assert_eq!(reading.signal, Signal::Neutral);
        assert_eq!(reading.strength, 0.5);
    }

    #[test]
    fn test_atr_strength_bands() {
        assert_eq!(classify_atr(1.0, 0.5).strength, 0.3);
        assert_eq!(classify_atr(1.0, 2.0).strength, 0.6);
        assert_eq!(classify_atr(1.0, 4.0).strength, 0.9);
    }
}
