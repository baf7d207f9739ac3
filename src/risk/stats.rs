//! Portfolio statistics from the daily P&L history: Sharpe, VaR and drawdown.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::{Data, OrderStatistics, Statistics};

/// Daily-return statistics for the portfolio.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PortfolioStats {
    pub sharpe_ratio: f64,
    /// Loss fraction not exceeded on 95% of days
    pub var_95: f64,
    /// Largest peak-to-trough fall of the equity curve, as a fraction of the peak
    pub max_drawdown: f64,
    /// Standard deviation of daily returns
    pub volatility: f64,
}

impl PortfolioStats {
    /// Compute from daily P&L (oldest first) against a starting equity.
    pub fn from_daily_pnl(daily_pnl: &[Decimal], starting_equity: Decimal) -> Self {
        let mut stats = Self::default();
        let start = starting_equity.to_f64().unwrap_or(0.0);
        if daily_pnl.is_empty() || start <= 0.0 {
            return stats;
        }

        // Daily returns against the equity at the start of each day
        let mut equity = start;
        let mut returns = Vec::with_capacity(daily_pnl.len());
        let mut curve = Vec::with_capacity(daily_pnl.len() + 1);
        curve.push(equity);
        for pnl in daily_pnl {
            let pnl = pnl.to_f64().unwrap_or(0.0);
            if equity > 0.0 {
                returns.push(pnl / equity);
            }
            equity += pnl;
            curve.push(equity);
        }

        stats.max_drawdown = max_drawdown(&curve);
        if returns.len() >= 2 {
            stats.sharpe_ratio = sharpe_ratio(&returns);
            stats.volatility = returns.as_slice().std_dev();
        }
        stats.var_95 = value_at_risk(&returns, 0.95);
        stats
    }
}

/// Annualized Sharpe ratio of daily returns, zero risk-free rate.
pub fn sharpe_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.mean();
    let std_dev = returns.std_dev();
    if std_dev > 0.0 {
        (mean / std_dev) * (365.0_f64).sqrt()
    } else {
        0.0
    }
}

/// Historical VaR at `confidence`, reported as a positive loss fraction.
pub fn value_at_risk(returns: &[f64], confidence: f64) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let mut data = Data::new(returns.to_vec());
    let quantile = data.quantile(1.0 - confidence);
    if quantile.is_finite() {
        (-quantile).max(0.0)
    } else {
        0.0
    }
}

/// Max drawdown of an equity curve as a fraction of the running peak.
pub fn max_drawdown(curve: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut max_dd = 0.0f64;
    for &equity in curve {
        if equity > peak {
            peak = equity;
        }
        if peak > 0.0 {
            max_dd = max_dd.max((peak - equity) / peak);
        }
    }
    max_dd
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_drawdown_from_curve() {
        let dd = max_drawdown(&[100.0, 120.0, 90.0, 130.0, 117.0]);
        assert!((dd - 0.25).abs() < 1e-12);
        assert_eq!(max_drawdown(&[]), 0.0);
    }

    #[test]
    fn test_sharpe_sign() {
        assert!(sharpe_ratio(&[0.01, 0.02, 0.015, 0.005]) > 0.0);
        assert!(sharpe_ratio(&[-0.01, -0.02, -0.015, -0.005]) < 0.0);
        assert_eq!(sharpe_ratio(&[0.01]), 0.0);
        assert_eq!(sharpe_ratio(&[0.01, 0.01, 0.01]), 0.0);
    }

    #[test]
    fn test_var_reports_losses() {
        let returns: Vec<f64> = (0..100).map(|i| (i as f64 - 50.0) / 1000.0).collect();
        let var = value_at_risk(&returns, 0.95);
        assert!(var > 0.04 && var < 0.05, "var {}", var);

        assert_eq!(value_at_risk(&[0.01, 0.02, 0.03], 0.95), 0.0);
    }

    #[test]
    fn test_stats_from_daily_pnl() {
        let stats = PortfolioStats::from_daily_pnl(&[dec!(100), dec!(-300), dec!(50)], dec!(10000));
        // 10000 -> 10100 -> 9800 -> 9850
        assert!((stats.max_drawdown - 300.0 / 10100.0).abs() < 1e-12);
        assert!(stats.var_95 > 0.0);
        assert!(stats.volatility > 0.0);

        assert_eq!(PortfolioStats::from_daily_pnl(&[], dec!(10000)), PortfolioStats::default());
    }
}
