//! Risk manager: exposure limits, the risk-level score and the circuit breaker.

mod stats;

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::models::{
    CircuitBreakerState, GridPosition, PositionRisk, RiskLevel, RiskMetrics, Side,
};
use crate::notify::{BreakerEvent, Notifier};

use stats::PortfolioStats;

const EXPOSURE_WEIGHT: f64 = 0.3;
const DRAWDOWN_WEIGHT: f64 = 0.4;
const VOLATILITY_WEIGHT: f64 = 0.3;

/// Configured risk limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Largest single order value (quote currency)
    pub max_position_size_usd: Decimal,
    /// Per-pair exposure cap as a fraction of portfolio value
    pub max_pair_exposure: Decimal,
    /// Portfolio exposure cap as a fraction of portfolio value
    pub max_portfolio_exposure: Decimal,
    /// Daily loss limit as a fraction of portfolio value
    pub max_daily_drawdown: Decimal,
    /// Open-position ceiling used as a correlation proxy
    pub max_open_positions: usize,
    /// Largest accepted relative volatility for a pair
    pub volatility_limit: f64,
    pub max_consecutive_losing_days: u32,
    pub resume_cooldown_minutes: i64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_size_usd: dec!(1000),
            max_pair_exposure: dec!(0.10),
            max_portfolio_exposure: dec!(0.50),
            max_daily_drawdown: dec!(0.03),
            max_open_positions: 5,
            volatility_limit: 0.30,
            max_consecutive_losing_days: 3,
            resume_cooldown_minutes: 60,
        }
    }
}

/// Pre-trade verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeValidation {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl TradeValidation {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Weighted risk score from the three ratios, each capped at 1.
pub fn risk_score(exposure_ratio: f64, drawdown_ratio: f64, volatility_ratio: f64) -> f64 {
    let cap = |r: f64| if r.is_finite() { r.clamp(0.0, 1.0) } else { 1.0 };
    EXPOSURE_WEIGHT * cap(exposure_ratio)
        + DRAWDOWN_WEIGHT * cap(drawdown_ratio)
        + VOLATILITY_WEIGHT * cap(volatility_ratio)
}

fn ratio(value: Decimal, limit: Decimal) -> f64 {
    if limit <= Decimal::ZERO {
        return 0.0;
    }
    (value / limit).to_f64().unwrap_or(0.0)
}

/// Portfolio risk state owned by the control loop.
pub struct RiskManager {
    limits: RiskLimits,
    portfolio_value: Decimal,
    exposures: HashMap<String, Decimal>,
    volatilities: HashMap<String, f64>,
    daily_pnl: Decimal,
    day: NaiveDate,
    consecutive_losing_days: u32,
    daily_history: Vec<Decimal>,
    breaker: CircuitBreakerState,
    /// Highest breaker tier tripped today
    tripped_today: Option<RiskLevel>,
    metrics: RiskMetrics,
    position_risks: Vec<PositionRisk>,
    notifier: Option<Notifier>,
}

impl RiskManager {
    pub fn new(limits: RiskLimits, portfolio_value: Decimal) -> Self {
        Self {
            limits,
            portfolio_value,
            exposures: HashMap::new(),
            volatilities: HashMap::new(),
            daily_pnl: Decimal::ZERO,
            day: Utc::now().date_naive(),
            consecutive_losing_days: 0,
            daily_history: Vec::new(),
            breaker: CircuitBreakerState::default(),
            tripped_today: None,
            metrics: RiskMetrics::default(),
            position_risks: Vec::new(),
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn metrics(&self) -> &RiskMetrics {
        &self.metrics
    }

    pub fn breaker(&self) -> &CircuitBreakerState {
        &self.breaker
    }

    pub fn portfolio_value(&self) -> Decimal {
        self.portfolio_value
    }

    pub fn daily_pnl(&self) -> Decimal {
        self.daily_pnl
    }

    pub fn consecutive_losing_days(&self) -> u32 {
        self.consecutive_losing_days
    }

    /// Reinstate persisted state after a restart.
    pub fn restore(
        &mut self,
        breaker: CircuitBreakerState,
        consecutive_losing_days: u32,
        daily_history: Vec<Decimal>,
    ) {
        if breaker.suspended {
            warn!(
                reason = breaker.reason.as_deref().unwrap_or("unknown"),
                level = %breaker.risk_level,
                "Restored suspended circuit breaker"
            );
            self.tripped_today = Some(breaker.risk_level);
        }
        self.breaker = breaker;
        self.consecutive_losing_days = consecutive_losing_days;
        self.daily_history = daily_history;
    }

    pub fn total_exposure(&self) -> Decimal {
        self.exposures.values().copied().sum()
    }

    pub fn open_positions(&self) -> usize {
        self.exposures.len()
    }

    /// Today's loss as a fraction of portfolio value (zero when in profit).
    pub fn daily_drawdown(&self) -> Decimal {
        if self.portfolio_value <= Decimal::ZERO || self.daily_pnl >= Decimal::ZERO {
            return Decimal::ZERO;
        }
        -self.daily_pnl / self.portfolio_value
    }

    /// Exposure-weighted average of the pair volatilities.
    fn portfolio_volatility(&self) -> f64 {
        let total = self.total_exposure().to_f64().unwrap_or(0.0);
        if total <= 0.0 {
            return 0.0;
        }
        self.exposures
            .iter()
            .map(|(pair, exposure)| {
                let weight = exposure.to_f64().unwrap_or(0.0) / total;
                weight * self.volatilities.get(pair).copied().unwrap_or(0.0)
            })
            .sum()
    }

    pub fn set_volatility(&mut self, pair: &str, volatility: f64) {
        self.volatilities.insert(pair.to_string(), volatility);
    }

    /// Replace exposures with the marked value of the open positions.
    pub fn update_positions(&mut self, portfolio_value: Decimal, positions: &[&GridPosition]) {
        self.portfolio_value = portfolio_value;
        self.exposures.clear();
        for position in positions.iter().filter(|p| p.is_open()) {
            *self.exposures.entry(position.pair.clone()).or_default() += position.current_value;
        }
    }

    /// Set today's P&L and evaluate the breaker.
    pub fn update_daily_pnl(&mut self, pnl: Decimal) {
        self.update_daily_pnl_at(pnl, Utc::now());
    }

    pub fn update_daily_pnl_at(&mut self, pnl: Decimal, now: DateTime<Utc>) {
        self.daily_pnl = pnl;
        self.check_circuit_breaker(now);
        self.recompute_metrics(now);
    }

    /// Close out `self.day` with its final P&L and start `next`.
    pub fn roll_day(&mut self, next: NaiveDate, final_pnl: Decimal) {
        if next <= self.day {
            return;
        }
        self.daily_history.push(final_pnl);
        if final_pnl < Decimal::ZERO {
            self.consecutive_losing_days += 1;
        } else {
            self.consecutive_losing_days = 0;
        }
        info!(
            day = %self.day,
            pnl = %final_pnl,
            losing_streak = self.consecutive_losing_days,
            "Trading day closed"
        );

        self.day = next;
        self.daily_pnl = Decimal::ZERO;
        self.tripped_today = None;
        // A new day re-arms the resume path for yesterday's loss tiers
        if self.breaker.suspended && self.breaker.risk_level == RiskLevel::Critical {
            self.breaker.risk_level = RiskLevel::High;
        }
    }

    pub fn current_day(&self) -> NaiveDate {
        self.day
    }

    pub fn daily_history(&self) -> &[Decimal] {
        &self.daily_history
    }

    fn check_circuit_breaker(&mut self, now: DateTime<Utc>) {
        if self.breaker.suspended {
            return;
        }

        let drawdown = self.daily_drawdown();
        let limit = self.limits.max_daily_drawdown;
        let pct = (drawdown * Decimal::ONE_HUNDRED).round_dp(2);

        let trigger = if limit > Decimal::ZERO && drawdown >= limit * Decimal::TWO {
            Some((RiskLevel::Critical, format!("daily loss {}% >= 2x limit", pct)))
        } else if limit > Decimal::ZERO && drawdown >= limit {
            Some((RiskLevel::High, format!("daily loss {}% >= limit", pct)))
        } else if self.consecutive_losing_days >= self.limits.max_consecutive_losing_days {
            Some((
                RiskLevel::Medium,
                format!("{} consecutive losing days", self.consecutive_losing_days),
            ))
        } else {
            None
        };

        if let Some((level, reason)) = trigger {
            if self.tripped_today.map_or(true, |prev| level > prev) {
                self.trip(level, reason, now);
            }
        }
    }

    fn trip(&mut self, level: RiskLevel, reason: String, now: DateTime<Utc>) {
        error!(level = %level, reason = %reason, "Circuit breaker tripped, new entries suspended");
        self.breaker = CircuitBreakerState {
            suspended: true,
            reason: Some(reason.clone()),
            suspended_at: Some(now),
            risk_level: level,
        };
        self.tripped_today = Some(level);
        if let Some(notifier) = &self.notifier {
            notifier.notify(BreakerEvent {
                reason,
                risk_level: level,
                triggered_at: now,
            });
        }
    }

    /// Suspend trading by hand.
    #[cfg(test)]
    pub fn suspend(&mut self, level: RiskLevel, reason: impl Into<String>) {
        self.trip(level, reason.into(), Utc::now());
    }

    /// Current level: the score level, raised to the breaker's while suspended.
    pub fn risk_level(&self) -> RiskLevel {
        if self.breaker.suspended {
            self.metrics.risk_level.max(self.breaker.risk_level)
        } else {
            self.metrics.risk_level
        }
    }

    /// Recompute the risk metrics wholesale.
    pub fn recompute_metrics(&mut self, now: DateTime<Utc>) -> &RiskMetrics {
        let total_exposure = self.total_exposure();
        let exposure_cap = self.portfolio_value * self.limits.max_portfolio_exposure;
        let drawdown = self.daily_drawdown();
        let volatility = self.portfolio_volatility();

        let score = risk_score(
            ratio(total_exposure, exposure_cap),
            ratio(drawdown, self.limits.max_daily_drawdown),
            if self.limits.volatility_limit > 0.0 {
                volatility / self.limits.volatility_limit
            } else {
                0.0
            },
        );

        let stats = PortfolioStats::from_daily_pnl(&self.daily_history, self.portfolio_value);
        self.metrics = RiskMetrics {
            total_exposure,
            daily_drawdown: drawdown.to_f64().unwrap_or(0.0),
            max_drawdown: stats.max_drawdown,
            sharpe_ratio: stats.sharpe_ratio,
            volatility,
            var_95: stats.var_95,
            risk_score: score,
            risk_level: RiskLevel::from_score(score),
            timestamp: now,
        };
        &self.metrics
    }

    /// Hard gate on new entries. `Err` carries the blocking reason.
    pub fn trading_gate(&self) -> Result<(), String> {
        if self.breaker.suspended {
            return Err(format!(
                "trading suspended: {}",
                self.breaker.reason.as_deref().unwrap_or("circuit breaker")
            ));
        }
        if self.risk_level() == RiskLevel::Critical {
            return Err("risk level critical".to_string());
        }
        if self.daily_drawdown() >= self.limits.max_daily_drawdown {
            return Err(format!("daily drawdown {} at limit", self.daily_drawdown().round_dp(4)));
        }
        let exposure_cap = self.portfolio_value * self.limits.max_portfolio_exposure;
        if self.total_exposure() >= exposure_cap {
            return Err(format!(
                "total exposure {} at cap {}",
                self.total_exposure().round_dp(2),
                exposure_cap.round_dp(2)
            ));
        }
        Ok(())
    }

    /// Pre-trade limits for a new buy. Sells reduce exposure and always pass.
    pub fn validate_trade(&self, pair: &str, side: Side, quantity: Decimal, price: Decimal) -> TradeValidation {
        if side == Side::Sell {
            return TradeValidation::allow();
        }

        let value = quantity * price;
        if value > self.limits.max_position_size_usd {
            return TradeValidation::deny(format!(
                "position value {} exceeds max {}",
                value.round_dp(2),
                self.limits.max_position_size_usd
            ));
        }

        let pair_exposure = self.exposures.get(pair).copied().unwrap_or_default();
        let pair_cap = self.portfolio_value * self.limits.max_pair_exposure;
        if pair_exposure + value > pair_cap {
            return TradeValidation::deny(format!(
                "{} exposure {} would exceed pair cap {}",
                pair,
                (pair_exposure + value).round_dp(2),
                pair_cap.round_dp(2)
            ));
        }

        let portfolio_cap = self.portfolio_value * self.limits.max_portfolio_exposure;
        if self.total_exposure() + value > portfolio_cap {
            return TradeValidation::deny(format!(
                "portfolio exposure would exceed cap {}",
                portfolio_cap.round_dp(2)
            ));
        }

        if !self.exposures.contains_key(pair) && self.open_positions() >= self.limits.max_open_positions {
            return TradeValidation::deny(format!(
                "{} open positions at correlation ceiling",
                self.open_positions()
            ));
        }

        if let Some(vol) = self.volatilities.get(pair) {
            if *vol > self.limits.volatility_limit {
                return TradeValidation::deny(format!(
                    "{} volatility {:.3} above limit {:.3}",
                    pair, vol, self.limits.volatility_limit
                ));
            }
        }

        TradeValidation::allow()
    }

    /// Re-enable trading after the cooldown, unless risk is still critical.
    pub fn resume_trading(&mut self) -> bool {
        self.resume_trading_at(Utc::now())
    }

    pub fn resume_trading_at(&mut self, now: DateTime<Utc>) -> bool {
        if !self.breaker.suspended {
            return true;
        }
        let Some(suspended_at) = self.breaker.suspended_at else {
            return false;
        };

        let elapsed = now - suspended_at;
        if elapsed < Duration::minutes(self.limits.resume_cooldown_minutes) {
            debug!(elapsed_min = elapsed.num_minutes(), "Resume refused, cooldown not elapsed");
            return false;
        }
        if self.risk_level() == RiskLevel::Critical {
            debug!("Resume refused, risk level critical");
            return false;
        }

        info!(
            previous_reason = self.breaker.reason.as_deref().unwrap_or(""),
            "Trading resumed"
        );
        self.breaker = CircuitBreakerState {
            risk_level: self.metrics.risk_level,
            ..CircuitBreakerState::default()
        };
        true
    }

    /// Adopt a breaker cleared outside this process, e.g. by `gridpilot resume`.
    ///
    /// Only a clear is adopted. The tier already tripped today stays recorded,
    /// so the same loss does not trip the breaker again.
    pub fn sync_breaker(&mut self, persisted: CircuitBreakerState) -> bool {
        if !self.breaker.suspended || persisted.suspended {
            return false;
        }
        info!(
            previous_reason = self.breaker.reason.as_deref().unwrap_or(""),
            "Circuit breaker cleared externally"
        );
        self.breaker = CircuitBreakerState {
            risk_level: self.metrics.risk_level,
            ..persisted
        };
        true
    }

    /// Score every open position. Call after `update_positions`.
    pub fn assess_positions(
        &mut self,
        positions: &[&GridPosition],
        stop_loss_pct: Decimal,
        take_profit_pct: Decimal,
    ) -> &[PositionRisk] {
        let mut risks: Vec<PositionRisk> = positions
            .iter()
            .map(|p| self.position_risk(p, stop_loss_pct, take_profit_pct))
            .collect();
        risks.sort_by(|a, b| a.position_score.total_cmp(&b.position_score));
        for risk in risks.iter().filter(|r| r.position_score < 50.0) {
            warn!(
                pair = %risk.pair,
                score = risk.position_score,
                share = risk.portfolio_share,
                "Position risk elevated"
            );
        }
        self.position_risks = risks;
        &self.position_risks
    }

    /// Latest per-position assessment, weakest first.
    pub fn position_risks(&self) -> &[PositionRisk] {
        &self.position_risks
    }

    /// Risk view of one open position.
    pub fn position_risk(&self, position: &GridPosition, stop_loss_pct: Decimal, take_profit_pct: Decimal) -> PositionRisk {
        let exposure = position.current_value;
        let total = self.total_exposure().max(exposure);
        let share = ratio(exposure, total);

        let stop_fraction = stop_loss_pct.abs() / Decimal::ONE_HUNDRED;
        let max_loss = exposure * stop_fraction;
        let daily_budget = self.portfolio_value * self.limits.max_daily_drawdown;

        let mut score: f64 = 100.0;
        if share > 0.20 {
            score -= 30.0;
        } else if share > 0.10 {
            score -= 15.0;
        }
        if max_loss > daily_budget {
            score -= 25.0;
        } else if max_loss > daily_budget / Decimal::TWO {
            score -= 10.0;
        }
        if share < 0.05 {
            score += 10.0;
        }
        let score = score.clamp(0.0, 100.0);

        let volatility = self.volatilities.get(&position.pair).copied().unwrap_or(0.0);
        let (stop_mult, target_mult) = if volatility > 0.05 {
            (dec!(1.5), dec!(2.0))
        } else if volatility < 0.02 {
            (dec!(0.7), dec!(0.8))
        } else {
            (Decimal::ONE, Decimal::ONE)
        };
        let entry = position.average_price;
        let suggested_stop_loss = entry * (Decimal::ONE - stop_fraction * stop_mult);
        let suggested_take_profit =
            entry * (Decimal::ONE + take_profit_pct.abs() / Decimal::ONE_HUNDRED * target_mult);

        let stop_loss_distance = if position.current_price > Decimal::ZERO {
            ratio(position.current_price - suggested_stop_loss, position.current_price)
        } else {
            0.0
        };

        PositionRisk {
            pair: position.pair.clone(),
            exposure,
            unrealized_pnl: position.unrealized_pnl(),
            risk_score: (100.0 - score) / 100.0,
            stop_loss_distance,
            portfolio_share: share,
            position_score: score,
            suggested_stop_loss,
            suggested_take_profit,
        }
    }

    /// Sizing multiplier from today's P&L and current exposure, in [0.1, 1.5].
    pub fn size_adjustment_factor(&self) -> f64 {
        let mut factor: f64 = 1.0;
        let budget = self.portfolio_value * self.limits.max_daily_drawdown;

        if self.daily_pnl < -(budget / Decimal::TWO) {
            factor *= 0.7;
        } else if self.daily_pnl < -(budget / dec!(5)) {
            factor *= 0.8;
        } else if self.daily_pnl > budget / Decimal::TWO {
            factor *= 1.2;
        }

        let reference = self.limits.max_position_size_usd * Decimal::from(self.limits.max_open_positions as u64);
        let exposure_ratio = ratio(self.total_exposure(), reference);
        if exposure_ratio > 0.8 {
            factor *= 0.6;
        } else if exposure_ratio > 0.5 {
            factor *= 0.8;
        }

        factor.clamp(0.1, 1.5)
    }
}
