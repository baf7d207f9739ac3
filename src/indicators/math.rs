//! Indicator formulas over closing-price and OHLC series (oldest first).
//!
//! Every function returns `None` when the series is too short for its window.

/// Exponential moving average series, seeded with the first observation.
///
/// `alpha = 2 / (window + 1)`; bar 0 is the price itself.
pub fn ema_series(values: &[f64], window: usize) -> Vec<f64> {
    let alpha = 2.0 / (window as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut prev = None;
    for &v in values {
        let next = match prev {
            None => v,
            Some(p) => alpha * v + (1.0 - alpha) * p,
        };
        out.push(next);
        prev = Some(next);
    }
    out
}

/// Simple moving average of the last `window` values.
pub fn sma(values: &[f64], window: usize) -> Option<f64> {
    if window == 0 || values.len() < window {
        return None;
    }
    let tail = &values[values.len() - window..];
    Some(tail.iter().sum::<f64>() / window as f64)
}

/// Population standard deviation of the last `window` values.
pub fn std_dev(values: &[f64], window: usize) -> Option<f64> {
    let mean = sma(values, window)?;
    let tail = &values[values.len() - window..];
    let var = tail.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / window as f64;
    Some(var.sqrt())
}

/// RSI with Wilder smoothing of average gain and loss.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let (seed, rest) = changes.split_at(period);

    let mut avg_gain = seed.iter().filter(|c| **c > 0.0).sum::<f64>() / period as f64;
    let mut avg_loss = seed.iter().filter(|c| **c < 0.0).map(|c| -c).sum::<f64>() / period as f64;

    let w = period as f64;
    for &change in rest {
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        avg_gain = (avg_gain * (w - 1.0) + gain) / w;
        avg_loss = (avg_loss * (w - 1.0) + loss) / w;
    }

    if avg_loss == 0.0 {
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdOutput {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// MACD line (fast EMA minus slow EMA), its EMA signal line and the histogram.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<MacdOutput> {
    if closes.len() < slow + signal {
        return None;
    }
    let fast_ema = ema_series(closes, fast);
    let slow_ema = ema_series(closes, slow);
    let line: Vec<f64> = fast_ema.iter().zip(&slow_ema).map(|(f, s)| f - s).collect();
    let signal_line = ema_series(&line, signal);

    let macd = *line.last()?;
    let signal = *signal_line.last()?;
    Some(MacdOutput {
        macd,
        signal,
        histogram: macd - signal,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandsOutput {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// Band width as a percentage of the middle band
    pub width_pct: f64,
}

/// Bollinger bands: SMA plus/minus `num_std` standard deviations.
pub fn bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<BandsOutput> {
    let middle = sma(closes, period)?;
    let std = std_dev(closes, period)?;
    let upper = middle + num_std * std;
    let lower = middle - num_std * std;
    let width_pct = if middle != 0.0 {
        (upper - lower) / middle * 100.0
    } else {
        0.0
    };
    Some(BandsOutput {
        upper,
        middle,
        lower,
        width_pct,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StochasticOutput {
    pub k: f64,
    pub d: f64,
}

/// Stochastic oscillator: %K over `k_period`, %D as SMA of %K over `d_period`.
pub fn stochastic(
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    k_period: usize,
    d_period: usize,
) -> Option<StochasticOutput> {
    let n = closes.len();
    if k_period == 0 || d_period == 0 || n < k_period + d_period - 1 {
        return None;
    }
    if highs.len() != n || lows.len() != n {
        return None;
    }

    let k_values: Vec<f64> = (k_period - 1..n)
        .map(|i| {
            let window = i + 1 - k_period..=i;
            let high = highs[window.clone()].iter().cloned().fold(f64::MIN, f64::max);
            let low = lows[window].iter().cloned().fold(f64::MAX, f64::min);
            if high == low {
                50.0
            } else {
                (closes[i] - low) / (high - low) * 100.0
            }
        })
        .collect();

    let k = *k_values.last()?;
    let d = sma(&k_values, d_period)?;
    Some(StochasticOutput { k, d })
}

fn true_ranges(highs: &[f64], lows: &[f64], closes: &[f64]) -> Vec<f64> {
    (1..closes.len())
        .map(|i| {
            let hl = highs[i] - lows[i];
            let hc = (highs[i] - closes[i - 1]).abs();
            let lc = (lows[i] - closes[i - 1]).abs();
            hl.max(hc).max(lc)
        })
        .collect()
}

/// ATR: true range seeded with an SMA, then Wilder-smoothed.
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 || highs.len() != closes.len() || lows.len() != closes.len() {
        return None;
    }
    let tr = true_ranges(highs, lows, closes);
    let w = period as f64;
    let mut value = tr[..period].iter().sum::<f64>() / w;
    for &t in &tr[period..] {
        value = (value * (w - 1.0) + t) / w;
    }
    Some(value)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdxOutput {
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
}

/// ADX with Wilder smoothing of true range and directional movement.
///
/// Needs `2 * period + 1` bars: `period` to seed the smoothed sums and another
/// `period` DX values to seed the ADX average.
pub fn adx(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<AdxOutput> {
    let n = closes.len();
    if period == 0 || n < 2 * period + 1 || highs.len() != n || lows.len() != n {
        return None;
    }

    let tr = true_ranges(highs, lows, closes);
    let mut plus_dm = Vec::with_capacity(n - 1);
    let mut minus_dm = Vec::with_capacity(n - 1);
    for i in 1..n {
        let up = highs[i] - highs[i - 1];
        let down = lows[i - 1] - lows[i];
        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });
    }

    let w = period as f64;
    let mut s_tr: f64 = tr[..period].iter().sum();
    let mut s_plus: f64 = plus_dm[..period].iter().sum();
    let mut s_minus: f64 = minus_dm[..period].iter().sum();

    let directional = |s_tr: f64, s_plus: f64, s_minus: f64| -> (f64, f64, f64) {
        if s_tr == 0.0 {
            return (0.0, 0.0, 0.0);
        }
        let plus_di = s_plus / s_tr * 100.0;
        let minus_di = s_minus / s_tr * 100.0;
        let sum = plus_di + minus_di;
        let dx = if sum == 0.0 {
            0.0
        } else {
            (plus_di - minus_di).abs() / sum * 100.0
        };
        (plus_di, minus_di, dx)
    };

    let (mut plus_di, mut minus_di, first_dx) = directional(s_tr, s_plus, s_minus);
    let mut dx_values = vec![first_dx];
    let mut adx_value = None;

    for i in period..tr.len() {
        s_tr = s_tr - s_tr / w + tr[i];
        s_plus = s_plus - s_plus / w + plus_dm[i];
        s_minus = s_minus - s_minus / w + minus_dm[i];
        let (p, m, dx) = directional(s_tr, s_plus, s_minus);
        plus_di = p;
        minus_di = m;

        match adx_value {
            None => {
                dx_values.push(dx);
                if dx_values.len() == period {
                    adx_value = Some(dx_values.iter().sum::<f64>() / w);
                }
            }
            Some(prev) => adx_value = Some((prev * (w - 1.0) + dx) / w),
        }
    }

    Some(AdxOutput {
        adx: adx_value?,
        plus_di,
        minus_di,
    })
}

/// Coefficient of variation of the last `window` closes.
pub fn relative_volatility(closes: &[f64], window: usize) -> Option<f64> {
    let mean = sma(closes, window)?;
    if mean == 0.0 {
        return None;
    }
    Some(std_dev(closes, window)? / mean)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn test_ema_seeded_with_first_value() {
        // alpha = 0.5
        let ema = ema_series(&[10.0, 11.0, 12.0, 13.0], 3);
        assert_eq!(ema, vec![10.0, 10.5, 11.25, 12.125]);
    }

    #[test]
    fn test_sma_and_std() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(sma(&values, 8), Some(5.0));
        assert_eq!(std_dev(&values, 8), Some(2.0));
        assert_eq!(sma(&values, 9), None);
    }

    #[test]
    fn test_rsi_extremes() {
        let rising: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        assert_eq!(rsi(&rising, 14), Some(100.0));

        let falling: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        assert!(approx(rsi(&falling, 14).unwrap(), 0.0, 1e-9));

        let flat = vec![100.0; 30];
        assert_eq!(rsi(&flat, 14), Some(50.0));
        assert_eq!(rsi(&flat[..14], 14), None);
    }

    #[test]
    fn test_rsi_alternating_is_balanced() {
        let closes: Vec<f64> = (0..60).map(|i| if i % 2 == 0 { 100.0 } else { 101.0 }).collect();
        let value = rsi(&closes, 14).unwrap();
        assert!(value > 40.0 && value < 60.0, "rsi {}", value);
    }

    #[test]
    fn test_macd_sign_follows_trend() {
        let rising: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let out = macd(&rising, 12, 26, 9).unwrap();
        assert!(out.macd > 0.0);

        let falling: Vec<f64> = (0..60).map(|i| 200.0 - i as f64).collect();
        let out = macd(&falling, 12, 26, 9).unwrap();
        assert!(out.macd < 0.0);

        assert!(macd(&rising[..30], 12, 26, 9).is_none());
    }

    #[test]
    fn test_bollinger_flat_series_has_zero_width() {
        let flat = vec![50.0; 25];
        let bands = bollinger(&flat, 20, 2.0).unwrap();
        assert_eq!(bands.upper, 50.0);
        assert_eq!(bands.lower, 50.0);
        assert_eq!(bands.width_pct, 0.0);
    }

    #[test]
    fn test_stochastic_at_top_of_range() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let highs: Vec<f64> = closes.clone();
        let lows: Vec<f64> = closes.iter().map(|c| c - 1.0).collect();
        let out = stochastic(&highs, &lows, &closes, 14, 3).unwrap();
        assert_eq!(out.k, 100.0);
        assert_eq!(out.d, 100.0);
    }

    #[test]
    fn test_atr_constant_range() {
        let closes = vec![100.0; 30];
        let highs = vec![101.0; 30];
        let lows = vec![99.0; 30];
        assert!(approx(atr(&highs, &lows, &closes, 14).unwrap(), 2.0, 1e-9));
    }

    #[test]
    fn test_adx_strong_uptrend() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + 2.0 * i as f64).collect();
        let highs: Vec<f64> = closes.iter().map(|c| c + 1.0).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 1.0).collect();
        let out = adx(&highs, &lows, &closes, 14).unwrap();
        assert!(out.adx > 25.0);
        assert!(out.plus_di > out.minus_di);
        assert!(adx(&highs[..20], &lows[..20], &closes[..20], 14).is_none());
    }
}
