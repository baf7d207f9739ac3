use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::models::Candle;

use super::{
    classify_adx, classify_atr, classify_bollinger, classify_macd, classify_rsi,
    classify_stochastic, math, IndicatorSet, ADX_PERIOD, ATR_PERIOD, BOLLINGER_PERIOD,
    BOLLINGER_STD, MACD_FAST, MACD_SIGNAL, MACD_SLOW, RSI_PERIOD, STOCH_D, STOCH_K,
    VOLUME_WINDOW,
};

/// Points kept per pair; older points are dropped first.
pub const MAX_POINTS: usize = 1000;
/// Fewer buffered points than this yields no indicators.
pub const MIN_POINTS: usize = 50;
/// Closes used for the volatility estimate.
pub const VOLATILITY_WINDOW: usize = 20;

const CACHE_TTL_MINUTES: i64 = 5;

/// One buffered observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl From<&Candle> for PricePoint {
    fn from(c: &Candle) -> Self {
        Self {
            timestamp: c.timestamp,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
        }
    }
}

struct CachedSet {
    set: IndicatorSet,
    computed_at: DateTime<Utc>,
}

/// Rolling per-pair buffers with a short-lived cache of computed indicators.
///
/// The cache entry for a pair is dropped whenever new data lands for it.
#[derive(Default)]
pub struct IndicatorEngine {
    buffers: HashMap<String, VecDeque<PricePoint>>,
    cache: HashMap<String, CachedSet>,
}

impl IndicatorEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, pair: &str) -> usize {
        self.buffers.get(pair).map_or(0, |b| b.len())
    }

    /// Append one point.
    pub fn push(&mut self, pair: &str, point: PricePoint) {
        let buffer = self.buffers.entry(pair.to_string()).or_default();
        buffer.push_back(point);
        while buffer.len() > MAX_POINTS {
            buffer.pop_front();
        }
        self.cache.remove(pair);
    }

    /// Append candles newer than the last buffered point and refresh the last
    /// point when its candle is still forming. Returns how many points changed.
    pub fn ingest_candles(&mut self, pair: &str, candles: &[Candle]) -> usize {
        let mut changed = 0;
        for candle in candles {
            let point = PricePoint::from(candle);
            let last = self.buffers.get(pair).and_then(|b| b.back()).copied();
            match last {
                Some(last) if point.timestamp < last.timestamp => {}
                Some(last) if point.timestamp == last.timestamp => {
                    if point != last {
                        self.replace_last(pair, point);
                        changed += 1;
                    }
                }
                _ => {
                    self.push(pair, point);
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            debug!(pair = %pair, changed = changed, buffered = self.len(pair), "Buffered candles");
        }
        changed
    }

    fn replace_last(&mut self, pair: &str, point: PricePoint) {
        if let Some(last) = self.buffers.get_mut(pair).and_then(|b| b.back_mut()) {
            *last = point;
        }
        self.cache.remove(pair);
    }

    /// Indicators for `pair`, served from cache when fresh.
    ///
    /// `None` means insufficient data, not an error.
    pub fn compute(&mut self, pair: &str) -> Option<IndicatorSet> {
        self.compute_at(pair, Utc::now())
    }

    pub fn compute_at(&mut self, pair: &str, now: DateTime<Utc>) -> Option<IndicatorSet> {
        if let Some(cached) = self.cache.get(pair) {
            if now - cached.computed_at < Duration::minutes(CACHE_TTL_MINUTES) {
                return Some(cached.set.clone());
            }
        }

        let buffer = self.buffers.get(pair)?;
        if buffer.len() < MIN_POINTS {
            return None;
        }

        let set = calculate(buffer, now)?;
        self.cache.insert(
            pair.to_string(),
            CachedSet {
                set: set.clone(),
                computed_at: now,
            },
        );
        Some(set)
    }

    /// Standard deviation over mean of the recent closes.
    pub fn volatility(&self, pair: &str) -> Option<f64> {
        let closes: Vec<f64> = self.buffers.get(pair)?.iter().map(|p| p.close).collect();
        math::relative_volatility(&closes, VOLATILITY_WINDOW)
    }
}

fn calculate(buffer: &VecDeque<PricePoint>, now: DateTime<Utc>) -> Option<IndicatorSet> {
    let closes: Vec<f64> = buffer.iter().map(|p| p.close).collect();
    let highs: Vec<f64> = buffer.iter().map(|p| p.high).collect();
    let lows: Vec<f64> = buffer.iter().map(|p| p.low).collect();
    let volumes: Vec<f64> = buffer.iter().map(|p| p.volume).collect();

    let price = *closes.last()?;
    let rsi = math::rsi(&closes, RSI_PERIOD)?;
    let macd = math::macd(&closes, MACD_FAST, MACD_SLOW, MACD_SIGNAL)?;
    let bands = math::bollinger(&closes, BOLLINGER_PERIOD, BOLLINGER_STD)?;
    let stoch = math::stochastic(&highs, &lows, &closes, STOCH_K, STOCH_D)?;
    let adx = math::adx(&highs, &lows, &closes, ADX_PERIOD)?;
    let atr = math::atr(&highs, &lows, &closes, ATR_PERIOD)?;
    let atr_pct = if price != 0.0 { atr / price * 100.0 } else { 0.0 };

    Some(IndicatorSet {
        price,
        volume: *volumes.last()?,
        volume_avg: math::sma(&volumes, VOLUME_WINDOW)?,
        rsi: classify_rsi(rsi),
        macd: classify_macd(&macd),
        macd_signal: macd.signal,
        macd_histogram: macd.histogram,
        bollinger: classify_bollinger(price, &bands),
        bollinger_upper: bands.upper,
        bollinger_lower: bands.lower,
        bollinger_width_pct: bands.width_pct,
        sma_20: math::sma(&closes, 20)?,
        sma_50: math::sma(&closes, 50)?,
        sma_200: math::sma(&closes, 200),
        stochastic: classify_stochastic(&stoch),
        stochastic_d: stoch.d,
        adx: classify_adx(&adx),
        plus_di: adx.plus_di,
        minus_di: adx.minus_di,
        atr: classify_atr(atr, atr_pct),
        atr_pct,
        computed_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(i: i64, close: f64) -> PricePoint {
        PricePoint {
            timestamp: Utc::now() - Duration::hours(1000 - i),
            high: close * 1.01,
            low: close * 0.99,
            close,
            volume: 100.0,
        }
    }

    fn wave(n: i64) -> Vec<PricePoint> {
        (0..n)
            .map(|i| point(i, 100.0 + 5.0 * ((i as f64) / 4.0).sin()))
            .collect()
    }

    #[test]
    fn test_insufficient_data_is_empty() {
        let mut engine = IndicatorEngine::new();
        for p in wave(49) {
            engine.push("BTC/USDT", p);
        }
        assert!(engine.compute("BTC/USDT").is_none());
        assert!(engine.compute("ETH/USDT").is_none());

        engine.push("BTC/USDT", point(49, 100.0));
        assert!(engine.compute("BTC/USDT").is_some());
    }

    #[test]
    fn test_buffer_is_capped_fifo() {
        let mut engine = IndicatorEngine::new();
        for i in 0..1100 {
            engine.push("BTC/USDT", point(i % 1000, i as f64 + 1.0));
        }
        assert_eq!(engine.len("BTC/USDT"), MAX_POINTS);
        let first = engine.buffers["BTC/USDT"].front().unwrap().close;
        assert_eq!(first, 101.0);
    }

    #[test]
    fn test_cache_ttl_and_invalidation() {
        let mut engine = IndicatorEngine::new();
        for p in wave(80) {
            engine.push("BTC/USDT", p);
        }
        let now = Utc::now();
        let first = engine.compute_at("BTC/USDT", now).unwrap();

        // Within TTL the cached set is returned as-is
        let cached = engine.compute_at("BTC/USDT", now + Duration::minutes(4)).unwrap();
        assert_eq!(cached.computed_at, first.computed_at);

        // Past TTL it is recomputed
        let stale = engine.compute_at("BTC/USDT", now + Duration::minutes(6)).unwrap();
        assert!(stale.computed_at > first.computed_at);

        // New data drops the cache immediately
        engine.push("BTC/USDT", point(81, 150.0));
        let fresh = engine.compute_at("BTC/USDT", now + Duration::minutes(7)).unwrap();
        assert_eq!(fresh.price, 150.0);
    }

    #[test]
    fn test_ingest_skips_known_candles() {
        let mut engine = IndicatorEngine::new();
        let start = Utc::now() - Duration::hours(10);
        let candles: Vec<Candle> = (0..10)
            .map(|i| Candle {
                timestamp: start + Duration::hours(i),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 10.0,
            })
            .collect();

        assert_eq!(engine.ingest_candles("ETH/USDT", &candles[..6]), 6);
        assert_eq!(engine.ingest_candles("ETH/USDT", &candles), 4);
        assert_eq!(engine.ingest_candles("ETH/USDT", &candles), 0);
        assert_eq!(engine.len("ETH/USDT"), 10);
    }

    #[test]
    fn test_forming_candle_is_refreshed() {
        let mut engine = IndicatorEngine::new();
        let start = Utc::now() - Duration::hours(60);
        let mut candles: Vec<Candle> = wave(60)
            .iter()
            .enumerate()
            .map(|(i, p)| Candle {
                timestamp: start + Duration::hours(i as i64),
                open: p.close,
                high: p.high,
                low: p.low,
                close: p.close,
                volume: p.volume,
            })
            .collect();

        assert_eq!(engine.ingest_candles("BTC/USDT", &candles), 60);
        let before = engine.compute("BTC/USDT").unwrap();
        assert_ne!(before.price, 120.0);

        // Same open time, later trades
        let last = candles.last_mut().unwrap();
        last.close = 120.0;
        last.high = 121.0;
        last.volume = 90.0;
        assert_eq!(engine.ingest_candles("BTC/USDT", &candles), 1);
        assert_eq!(engine.len("BTC/USDT"), 60);

        let after = engine.compute("BTC/USDT").unwrap();
        assert_eq!(after.price, 120.0);
        assert_eq!(after.volume, 90.0);
    }

    #[test]
    fn test_volatility_estimate() {
        let mut engine = IndicatorEngine::new();
        for i in 0..30 {
            engine.push("SOL/USDT", point(i, 100.0));
        }
        assert_eq!(engine.volatility("SOL/USDT"), Some(0.0));
        assert_eq!(engine.volatility("XRP/USDT"), None);
    }
}
