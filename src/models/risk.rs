//! Risk snapshots produced by the risk manager.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Portfolio risk level, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Map a weighted risk score in [0, 1] to a level.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            RiskLevel::Critical
        } else if score >= 0.6 {
            RiskLevel::High
        } else if score >= 0.4 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            "critical" => Some(RiskLevel::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Portfolio-wide risk picture, recomputed wholesale every cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub total_exposure: Decimal,
    /// Today's loss as a fraction of portfolio value (0.03 = 3%)
    pub daily_drawdown: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub volatility: f64,
    /// Historical 95% value-at-risk as a fraction of equity
    pub var_95: f64,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub timestamp: DateTime<Utc>,
}

impl Default for RiskMetrics {
    fn default() -> Self {
        Self {
            total_exposure: Decimal::ZERO,
            daily_drawdown: 0.0,
            max_drawdown: 0.0,
            sharpe_ratio: 0.0,
            volatility: 0.0,
            var_95: 0.0,
            risk_score: 0.0,
            risk_level: RiskLevel::Low,
            timestamp: Utc::now(),
        }
    }
}

/// Per-position risk view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRisk {
    pub pair: String,
    pub exposure: Decimal,
    pub unrealized_pnl: Decimal,
    pub risk_score: f64,
    /// Distance from mark to the stop-loss price as a fraction of mark
    pub stop_loss_distance: f64,
    /// Share of total exposure held in this position (0.0 to 1.0)
    pub portfolio_share: f64,
    /// 0-100 quality score; higher is safer
    pub position_score: f64,
    pub suggested_stop_loss: Decimal,
    pub suggested_take_profit: Decimal,
}

/// Process-wide trading suspension state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub suspended: bool,
    pub reason: Option<String>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub risk_level: RiskLevel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_thresholds() {
        assert_eq!(RiskLevel::from_score(0.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(0.30), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(0.4), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(0.6), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(0.8), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(1.0), RiskLevel::Critical);
    }

    #[test]
    fn test_level_ordering() {
        assert!(RiskLevel::Critical > RiskLevel::High);
        assert!(RiskLevel::Medium > RiskLevel::Low);
        assert_eq!(RiskLevel::parse("high"), Some(RiskLevel::High));
        assert_eq!(RiskLevel::parse("extreme"), None);
    }
}
