//! Strategy engine: the periodic control loop.
//!
//! Each cycle:
//! - Refreshes quotes, candles and indicators for the tracked pairs
//! - Refreshes the sentiment snapshot
//! - Asks the risk manager whether new entries are allowed
//! - Turns passing entry filters into hypotheses for the advisory consensus
//! - Opens approved, risk-validated grid positions
//! - Manages open positions: exits first, then crossed grid levels

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::consensus::ConsensusValidator;
use crate::db::{Database, SETTING_PAUSED};
use crate::exchange::{BestPrice, ExchangeRouter};
use crate::indicators::{IndicatorEngine, IndicatorSet};
use crate::models::{
    split_symbol, GridPosition, IndicatorSnapshot, OrderType, SentimentSnapshot, Side,
    TradeHypothesis, TradeRecord,
};
use crate::risk::RiskManager;
use crate::sentiment::{technical_reading, SentimentAggregator};

use super::grid::{build_ladder, GridSpec};
use super::rules::{check_entry, entry_quantity, exit_reason, ExitReason};
use super::StrategyConfig;

/// Lifecycle of one engine run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Running => "running",
            EngineState::Paused => "paused",
            EngineState::Stopped => "stopped",
        }
    }
}

/// Collaborators the engine drives.
pub struct EngineComponents {
    pub router: ExchangeRouter,
    pub sentiment: SentimentAggregator,
    pub consensus: ConsensusValidator,
    pub risk: RiskManager,
    pub db: Database,
}

/// Latest market view of one pair.
struct PairMarket {
    quote: BestPrice,
    indicators: Option<IndicatorSet>,
}

/// Entry signal that passed the filters and sizing.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub pair: String,
    pub exchange_id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub change_24h_pct: Decimal,
    pub indicators: IndicatorSnapshot,
}

/// What one cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub cycle: u64,
    pub trading_allowed: bool,
    pub candidates: usize,
    pub opened: usize,
    pub closed: usize,
    pub level_fills: usize,
    pub open_positions: usize,
    pub daily_pnl: Decimal,
}

pub struct StrategyEngine {
    config: StrategyConfig,
    router: ExchangeRouter,
    indicators: IndicatorEngine,
    sentiment: SentimentAggregator,
    consensus: ConsensusValidator,
    risk: RiskManager,
    db: Database,

    pairs: Vec<String>,
    capital: Decimal,

    // Runtime state, owned by the loop
    positions: HashMap<String, GridPosition>,
    position_agents: HashMap<String, Vec<String>>,
    market: HashMap<String, PairMarket>,
    last_sentiment: SentimentSnapshot,
    realized_today: Decimal,
    realized_total: Decimal,
    cycles: u64,
    state: EngineState,

    shutdown: Arc<AtomicBool>,
}

impl StrategyEngine {
    pub fn new(
        config: StrategyConfig,
        components: EngineComponents,
        pairs: Vec<String>,
        capital: Decimal,
    ) -> Self {
        Self {
            config,
            router: components.router,
            indicators: IndicatorEngine::new(),
            sentiment: components.sentiment,
            consensus: components.consensus,
            risk: components.risk,
            db: components.db,
            pairs,
            capital,
            positions: HashMap::new(),
            position_agents: HashMap::new(),
            market: HashMap::new(),
            last_sentiment: SentimentSnapshot::neutral(),
            realized_today: Decimal::ZERO,
            realized_total: Decimal::ZERO,
            cycles: 0,
            state: EngineState::Idle,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Apply the stored pause flag (`gridpilot pause`) at a cycle boundary.
    async fn sync_pause(&mut self) {
        let paused = match self.db.get_setting(SETTING_PAUSED).await {
            Ok(value) => value.as_deref() == Some("true"),
            Err(e) => {
                warn!(error = %e, "Failed to read pause flag");
                self.state == EngineState::Paused
            }
        };
        match (self.state, paused) {
            (EngineState::Running, true) => {
                info!("Strategy engine paused");
                self.state = EngineState::Paused;
            }
            (EngineState::Paused, false) => {
                info!("Strategy engine resumed");
                self.state = EngineState::Running;
            }
            _ => {}
        }
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    pub fn positions(&self) -> impl Iterator<Item = &GridPosition> {
        self.positions.values()
    }

    /// Connect exchanges and restore persisted positions and risk state.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing strategy engine...");

        let connected = self.router.connect_all().await;
        if connected == 0 {
            warn!("No exchange connected; cycles will only retry connections");
        }

        for position in self.db.load_open_positions().await? {
            if !self.pairs.contains(&position.pair) {
                self.pairs.push(position.pair.clone());
            }
            if let Some(hypothesis_id) = &position.hypothesis_id {
                let agents: Vec<String> = self
                    .db
                    .advisory_results(hypothesis_id)
                    .await?
                    .into_iter()
                    .map(|r| r.agent)
                    .collect();
                self.position_agents.insert(position.id.clone(), agents);
            }
            self.positions.insert(position.pair.clone(), position);
        }

        let breaker = self.db.load_breaker().await?.unwrap_or_default();
        let streak = self.db.consecutive_losing_days().await?;
        let history: Vec<Decimal> = self
            .db
            .daily_pnl_history(365)
            .await?
            .into_iter()
            .map(|(_, pnl)| pnl)
            .collect();
        self.risk.restore(breaker, streak, history);

        info!(
            capital = %self.capital,
            pairs = self.pairs.len(),
            positions = self.positions.len(),
            losing_streak = streak,
            "Strategy engine initialized"
        );
        Ok(())
    }

    /// Main run loop. Returns after Ctrl+C.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            interval = self.config.interval_secs,
            regime = %self.config.regime,
            "Starting strategy loop"
        );

        let mut ticker = interval(Duration::from_secs(self.config.interval_secs.max(1)));

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        self.state = EngineState::Running;
        while !self.shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.sync_pause().await;
            if self.state == EngineState::Paused {
                debug!("Engine paused, skipping cycle");
                continue;
            }

            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "Error in strategy cycle");
            }
        }

        self.stop().await
    }

    /// One full control cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleSummary> {
        self.cycles += 1;
        let mut summary = CycleSummary {
            cycle: self.cycles,
            ..Default::default()
        };
        debug!(cycle = self.cycles, "Strategy cycle");

        // 1. Market data and indicators
        self.router.maintain_connections().await;
        self.refresh_market_data().await;

        // 2. Sentiment
        let sets: Vec<IndicatorSet> = self
            .market
            .values()
            .filter_map(|m| m.indicators.clone())
            .collect();
        self.last_sentiment = self.sentiment.refresh(technical_reading(&sets)).await;

        // 3. Risk gate
        self.refresh_breaker().await;
        self.roll_day_if_needed().await;
        self.update_risk();
        let gate = self.risk.trading_gate();
        summary.trading_allowed = gate.is_ok();

        // 4-5. Entries
        match gate {
            Ok(()) => {
                let candidates = self.generate_candidates().await;
                summary.candidates = candidates.len();
                for candidate in candidates {
                    let pair = candidate.pair.clone();
                    match self.execute_candidate(candidate).await {
                        Ok(true) => summary.opened += 1,
                        Ok(false) => {}
                        Err(e) => error!(pair = %pair, error = %e, "Failed to process signal"),
                    }
                }
            }
            Err(reason) => {
                info!(reason = %reason, "New entries blocked by risk manager");
            }
        }

        // 6. Position management always runs
        let (closed, fills) = self.manage_positions().await;
        summary.closed = closed;
        summary.level_fills = fills;

        // 7. Summary
        self.update_risk();
        if let Err(e) = self.db.save_breaker(self.risk.breaker()).await {
            warn!(error = %e, "Failed to persist circuit breaker state");
        }
        summary.open_positions = self.positions.len();
        summary.daily_pnl = self.risk.daily_pnl();

        let metrics = self.risk.metrics();
        let weakest = self.risk.position_risks().first();
        info!(
            cycle = summary.cycle,
            daily_pnl = %summary.daily_pnl.round_dp(2),
            positions = summary.open_positions,
            opened = summary.opened,
            closed = summary.closed,
            risk_level = %self.risk.risk_level(),
            risk_score = metrics.risk_score,
            weakest_pair = weakest.map(|r| r.pair.as_str()).unwrap_or("-"),
            weakest_score = weakest.map(|r| r.position_score).unwrap_or(100.0),
            "Cycle complete"
        );

        Ok(summary)
    }

    // ==================== Market Data ====================

    async fn refresh_market_data(&mut self) {
        let pairs = self.pairs.clone();
        for pair in pairs {
            if let Err(e) = self.refresh_pair(&pair).await {
                warn!(pair = %pair, error = %e, "Failed to refresh market data");
            }
        }
    }

    async fn refresh_pair(&mut self, pair: &str) -> Result<()> {
        let quote = self
            .router
            .best_price(pair, Side::Buy)
            .await
            .with_context(|| format!("No exchange quotes {}", pair))?;

        let gateway = self
            .router
            .get(&quote.exchange_id)
            .with_context(|| format!("Unknown exchange {}", quote.exchange_id))?;
        let candles = gateway
            .fetch_ohlcv(pair, &self.config.timeframe, self.config.candle_limit)
            .await?;
        self.indicators.ingest_candles(pair, &candles);

        let indicators = self.indicators.compute(pair);
        if indicators.is_none() {
            debug!(pair = %pair, buffered = self.indicators.len(pair), "Insufficient data for indicators");
        }
        if let Some(vol) = self.indicators.volatility(pair) {
            self.risk.set_volatility(pair, vol);
        }

        self.market.insert(pair.to_string(), PairMarket { quote, indicators });
        Ok(())
    }

    // ==================== Risk ====================

    fn unrealized_pnl(&self) -> Decimal {
        self.positions.values().map(|p| p.unrealized_pnl()).sum()
    }

    fn update_risk(&mut self) {
        let portfolio_value = self.capital + self.realized_total + self.unrealized_pnl();
        let open: Vec<&GridPosition> = self.positions.values().collect();
        self.risk.update_positions(portfolio_value, &open);
        self.risk
            .assess_positions(&open, self.config.stop_loss_pct, self.config.profit_target_pct);
        let daily = self.realized_today + self.unrealized_pnl();
        self.risk.update_daily_pnl(daily);
    }

    /// Adopt an external resume, otherwise retry the cooldown resume.
    ///
    /// Runs before this cycle touches the breaker, so the stored state is
    /// either what the last cycle saved or an external edit.
    async fn refresh_breaker(&mut self) {
        if !self.risk.breaker().suspended {
            return;
        }
        match self.db.load_breaker().await {
            Ok(Some(persisted)) => {
                self.risk.sync_breaker(persisted);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to load circuit breaker state"),
        }
        if self.risk.breaker().suspended && self.risk.resume_trading() {
            info!("Trading re-enabled after cooldown");
        }
    }

    async fn roll_day_if_needed(&mut self) {
        let today = Utc::now().date_naive();
        if today <= self.risk.current_day() {
            return;
        }
        let closed_day = self.risk.current_day();
        if let Err(e) = self.db.record_daily_pnl(closed_day, self.realized_today).await {
            warn!(error = %e, "Failed to persist daily P&L");
        }
        self.risk.roll_day(today, self.realized_today);
        self.realized_today = Decimal::ZERO;
    }

    // ==================== Entries ====================

    /// Entry signals for untracked pairs, up to the configured pair count.
    async fn generate_candidates(&mut self) -> Vec<Candidate> {
        let mut slots = self.config.min_pairs.saturating_sub(self.positions.len());
        let mut candidates = Vec::new();

        for pair in self.pairs.clone() {
            if slots == 0 {
                break;
            }
            if self.positions.contains_key(&pair) {
                continue;
            }
            match self.evaluate_pair(&pair).await {
                Ok(Some(candidate)) => {
                    candidates.push(candidate);
                    slots -= 1;
                }
                Ok(None) => {}
                Err(e) => warn!(pair = %pair, error = %e, "Failed to evaluate pair"),
            }
        }
        candidates
    }

    async fn evaluate_pair(&self, pair: &str) -> Result<Option<Candidate>> {
        let Some((_, quote_ccy)) = split_symbol(pair) else {
            debug!(pair = %pair, "Unparseable pair");
            return Ok(None);
        };
        if !self.config.accepts_quote(quote_ccy) {
            return Ok(None);
        }
        let Some(market) = self.market.get(pair) else {
            return Ok(None);
        };
        let Some(set) = &market.indicators else {
            return Ok(None);
        };

        if let Err(reason) = check_entry(set, &self.last_sentiment, &self.config) {
            info!(pair = %pair, reason = %reason, "Entry filters not met");
            return Ok(None);
        }

        let exchange_id = &market.quote.exchange_id;
        let price = market.quote.price;
        let free = self.router.free_balance(exchange_id, quote_ccy).await?;
        let min_notional = self
            .router
            .get(exchange_id)
            .map(|g| g.min_notional())
            .unwrap_or(self.config.min_notional);

        let factor = self.risk.size_adjustment_factor();
        let Some(quantity) = entry_quantity(free, price, &self.config, min_notional, factor) else {
            info!(
                pair = %pair,
                free = %free,
                min_notional = %min_notional,
                "Signal rejected: size below minimum notional"
            );
            return Ok(None);
        };

        Ok(Some(Candidate {
            pair: pair.to_string(),
            exchange_id: exchange_id.clone(),
            price,
            quantity,
            change_24h_pct: market.quote.snapshot.change_pct,
            indicators: set.snapshot(),
        }))
    }

    /// Consensus, pre-trade validation and execution for one signal.
    ///
    /// Returns whether a position was opened.
    pub async fn execute_candidate(&mut self, candidate: Candidate) -> Result<bool> {
        let mut hypothesis = TradeHypothesis::new(
            candidate.pair.clone(),
            Side::Buy,
            candidate.quantity,
            candidate.price,
            candidate.indicators.clone(),
            self.last_sentiment.clone(),
        );
        hypothesis.change_24h_pct = candidate.change_24h_pct;

        let consensus = self.consensus.validate(&hypothesis).await;
        for result in &consensus.results {
            if let Err(e) = self.db.record_advisory(&consensus.hypothesis_id, &hypothesis.pair, result).await {
                warn!(error = %e, "Failed to persist advisory result");
            }
        }
        if !consensus.approved() {
            info!(
                pair = %candidate.pair,
                decision = %consensus.decision,
                approvals = consensus.approvals,
                denials = consensus.denials,
                "Signal rejected by advisory consensus"
            );
            return Ok(false);
        }

        let validation =
            self.risk
                .validate_trade(&candidate.pair, Side::Buy, candidate.quantity, candidate.price);
        if !validation.allowed {
            info!(
                pair = %candidate.pair,
                reason = validation.reason.as_deref().unwrap_or(""),
                "Signal rejected by risk manager"
            );
            return Ok(false);
        }

        let result = self
            .router
            .place_order(
                &candidate.exchange_id,
                &candidate.pair,
                Side::Buy,
                candidate.quantity,
                None,
                OrderType::Market,
            )
            .await?;
        if !result.success {
            warn!(
                pair = %candidate.pair,
                exchange = %candidate.exchange_id,
                error = result.error.as_deref().unwrap_or("unknown"),
                "Entry order rejected"
            );
            return Ok(false);
        }

        let fill_price = result.average_price.unwrap_or(candidate.price);
        let filled = if result.filled > Decimal::ZERO {
            result.filled
        } else {
            candidate.quantity
        };

        let spec = GridSpec::for_regime(self.config.regime, self.config.grid_levels);
        let ladder = build_ladder(fill_price, filled, spec);
        let mut position = GridPosition::open(
            candidate.pair.clone(),
            candidate.exchange_id.clone(),
            filled,
            fill_price,
            ladder,
        );
        position.hypothesis_id = Some(consensus.hypothesis_id.clone());

        info!(
            pair = %position.pair,
            exchange = %position.exchange_id,
            quantity = %filled,
            price = %fill_price,
            spacing = %spec.spacing,
            levels = spec.levels_per_side * 2,
            order_id = result.order_id.as_deref().unwrap_or(""),
            "Grid position opened"
        );

        self.db.save_position(&position).await?;
        self.position_agents.insert(position.id.clone(), consensus.agents());
        self.positions.insert(position.pair.clone(), position);
        self.update_risk();
        Ok(true)
    }

    // ==================== Position Management ====================

    /// Exits first, then grid fills. Returns `(closed, level fills)`.
    async fn manage_positions(&mut self) -> (usize, usize) {
        let mut closed = 0;
        let mut fills = 0;

        let pairs: Vec<String> = self.positions.keys().cloned().collect();
        for pair in pairs {
            match self.manage_position(&pair).await {
                Ok((was_closed, filled)) => {
                    closed += usize::from(was_closed);
                    fills += filled;
                }
                Err(e) => error!(pair = %pair, error = %e, "Failed to manage position"),
            }
        }
        (closed, fills)
    }

    async fn manage_position(&mut self, pair: &str) -> Result<(bool, usize)> {
        let Some(exchange_id) = self.positions.get(pair).map(|p| p.exchange_id.clone()) else {
            return Ok((false, 0));
        };
        let gateway = self
            .router
            .get(&exchange_id)
            .with_context(|| format!("Unknown exchange {}", exchange_id))?
            .clone();
        let snapshot = gateway.fetch_market_data(pair).await?;
        let mark = snapshot.price_for(Side::Sell);

        let reason = {
            let Some(position) = self.positions.get_mut(pair) else {
                return Ok((false, 0));
            };
            position.mark(mark);
            exit_reason(position, &self.config, Utc::now())
        };

        if let Some(reason) = reason {
            let closed = self.close_position(pair, reason).await?;
            return Ok((closed, 0));
        }

        let filled = self.fill_crossed_levels(pair, mark).await?;
        if let Some(position) = self.positions.get(pair) {
            self.db.save_position(position).await?;
        }
        Ok((false, filled))
    }

    async fn fill_crossed_levels(&mut self, pair: &str, mark: Decimal) -> Result<usize> {
        let Some(position) = self.positions.get(pair) else {
            return Ok(0);
        };
        let exchange_id = position.exchange_id.clone();
        let crossed = position.crossed_levels(mark);

        let mut filled = 0;
        for idx in crossed {
            let Some((side, level_price, quantity)) = self.positions.get(pair).and_then(|p| {
                let level = p.levels.get(idx)?;
                let quantity = match level.side {
                    Side::Buy => level.quantity,
                    Side::Sell => level.quantity.min(p.total_quantity),
                };
                Some((level.side, level.price, quantity))
            }) else {
                continue;
            };
            if quantity <= Decimal::ZERO {
                continue;
            }

            let result = match self
                .router
                .place_order(&exchange_id, pair, side, quantity, None, OrderType::Market)
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    warn!(pair = %pair, side = %side, level = idx, error = %e, "Grid level order failed");
                    continue;
                }
            };
            if !result.success {
                warn!(
                    pair = %pair,
                    side = %side,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "Grid level order rejected"
                );
                continue;
            }

            let fill_price = result.average_price.unwrap_or(level_price);
            let fill_qty = if result.filled > Decimal::ZERO {
                result.filled
            } else {
                quantity
            };
            if let Some(position) = self.positions.get_mut(pair) {
                position.fill_level(idx, fill_qty, fill_price);
                position.mark(mark);
                info!(
                    pair = %pair,
                    side = %side,
                    price = %fill_price,
                    quantity = %fill_qty,
                    average = %position.average_price.round_dp(8),
                    "Grid level filled"
                );
            }
            filled += 1;
        }
        Ok(filled)
    }

    /// Market-sell the whole position and record the trade. Returns whether it closed.
    ///
    /// A partial fill is booked against the position, which stays open for the
    /// next cycle to sell the remainder.
    async fn close_position(&mut self, pair: &str, reason: ExitReason) -> Result<bool> {
        let Some(position) = self.positions.get(pair) else {
            return Ok(false);
        };
        let exchange_id = position.exchange_id.clone();
        let quantity = position.total_quantity;
        let mark = position.current_price;

        if quantity > Decimal::ZERO {
            let result = self
                .router
                .place_order(&exchange_id, pair, Side::Sell, quantity, None, OrderType::Market)
                .await?;
            if !result.success {
                warn!(
                    pair = %pair,
                    reason = %reason,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "Exit order rejected, position kept open"
                );
                return Ok(false);
            }
            let exit_price = result.average_price.unwrap_or(mark);
            let sold = if result.filled > Decimal::ZERO {
                result.filled.min(quantity)
            } else {
                quantity
            };
            if sold < quantity {
                if let Some(position) = self.positions.get_mut(pair) {
                    position.record_sell(sold, exit_price);
                    warn!(
                        pair = %pair,
                        reason = %reason,
                        sold = %sold,
                        remaining = %position.total_quantity,
                        "Exit partially filled, remainder kept open"
                    );
                    self.db.save_position(position).await?;
                }
                return Ok(false);
            }
            self.finalize_close(pair, quantity, exit_price, reason).await?;
        } else {
            self.finalize_close(pair, Decimal::ZERO, mark, reason).await?;
        }
        Ok(true)
    }

    async fn finalize_close(
        &mut self,
        pair: &str,
        quantity: Decimal,
        exit_price: Decimal,
        reason: ExitReason,
    ) -> Result<()> {
        let Some(mut position) = self.positions.remove(pair) else {
            return Ok(());
        };

        let indicators = self
            .market
            .get(pair)
            .and_then(|m| m.indicators.as_ref())
            .map(|s| s.snapshot());
        let mut record = TradeRecord::from_close(&position, quantity, exit_price, reason.as_str())
            .with_context(indicators.as_ref(), Some(&self.last_sentiment));
        record.agents = self.position_agents.remove(&position.id).unwrap_or_default();

        position.record_sell(quantity, exit_price);
        position.mark(exit_price);
        position.close();

        self.realized_today += record.realized_pnl;
        self.realized_total += record.realized_pnl;

        info!(
            pair = %pair,
            reason = %reason,
            exit_price = %exit_price,
            pnl = %record.realized_pnl.round_dp(2),
            pnl_pct = %record.realized_pnl_pct.round_dp(2),
            "Position closed"
        );

        self.db.save_position(&position).await?;
        self.db.record_trade(&record).await?;
        Ok(())
    }

    // ==================== Shutdown ====================

    /// Best-effort close of every open position, then persist state.
    pub async fn stop(&mut self) -> Result<()> {
        info!(from = self.state.as_str(), "Shutting down strategy engine...");
        self.state = EngineState::Stopped;

        let pairs: Vec<String> = self.positions.keys().cloned().collect();
        for pair in pairs {
            let mark = match self.positions.get(&pair) {
                Some(p) => p.current_price,
                None => continue,
            };
            if let Some(position) = self.positions.get_mut(&pair) {
                position.mark(mark);
            }
            if let Err(e) = self.close_position(&pair, ExitReason::Shutdown).await {
                error!(pair = %pair, error = %e, "Failed to close position at shutdown");
            }
        }

        let cancelled = self.router.cancel_all().await;
        let total: usize = cancelled.values().sum();
        if total > 0 {
            info!(cancelled = total, "Cancelled open orders");
        }

        self.update_risk();
        self.db.save_breaker(self.risk.breaker()).await?;
        self.db
            .record_daily_pnl(self.risk.current_day(), self.realized_today)
            .await?;

        info!(
            remaining_positions = self.positions.len(),
            realized = %self.realized_total.round_dp(2),
            "Strategy engine stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExchangeConfig;
    use crate::consensus::AdvisoryAgent;
    use crate::exchange::mock::MockExchange;
    use crate::exchange::ExchangeGateway;
    use crate::models::{CircuitBreakerState, RiskLevel};
    use crate::risk::RiskLimits;
    use rust_decimal_macros::dec;

    fn scripted(name: &str, reply: &str) -> AdvisoryAgent {
        AdvisoryAgent::Scripted {
            name: name.to_string(),
            reply: Ok(reply.to_string()),
            delay: Duration::from_millis(0),
        }
    }

    async fn engine_with(mock: Arc<MockExchange>, agents: Vec<AdvisoryAgent>) -> StrategyEngine {
        let mut config = ExchangeConfig::new("binance", "http://localhost");
        config.rate_limit_ms = 0;
        config.retry_base_delay_ms = 1;
        let router = ExchangeRouter::new(vec![ExchangeGateway::new(config, mock)]);
        router.connect_all().await;

        let components = EngineComponents {
            router,
            sentiment: SentimentAggregator::new(Vec::new(), 15),
            consensus: ConsensusValidator::new(agents).unwrap(),
            risk: RiskManager::new(RiskLimits::default(), dec!(100000)),
            db: Database::new("sqlite::memory:").await.unwrap(),
        };
        StrategyEngine::new(
            StrategyConfig::default(),
            components,
            vec!["BTC/USDT".to_string()],
            dec!(100000),
        )
    }

    fn candidate(quantity: Decimal) -> Candidate {
        Candidate {
            pair: "BTC/USDT".into(),
            exchange_id: "binance".into(),
            price: dec!(50000),
            quantity,
            change_24h_pct: dec!(1.5),
            indicators: IndicatorSnapshot::default(),
        }
    }

    #[tokio::test]
    async fn test_gated_cycle_opens_nothing_but_still_exits() {
        let mock = Arc::new(MockExchange::new());
        mock.set_price("BTC/USDT", dec!(50600));
        mock.set_balance("USDT", dec!(100000));
        let mut engine = engine_with(mock.clone(), vec![scripted("a", "YES")]).await;

        let position = GridPosition::open("BTC/USDT", "binance", dec!(0.01), dec!(50000), Vec::new());
        engine.positions.insert("BTC/USDT".into(), position);
        engine.risk.suspend(RiskLevel::High, "manual test suspension");

        let summary = engine.run_cycle().await.unwrap();
        assert!(!summary.trading_allowed);
        assert_eq!(summary.opened, 0);
        assert_eq!(summary.closed, 1);
        assert!(engine.positions.is_empty());

        let orders = mock.placed_orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, Side::Sell);

        let trades = engine.db.recent_trades(5).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, "profit_target");
    }

    #[tokio::test]
    async fn test_approved_candidate_opens_grid_position() {
        let mock = Arc::new(MockExchange::new());
        mock.set_price("BTC/USDT", dec!(50000));
        let mut engine = engine_with(
            mock.clone(),
            vec![scripted("a", "YES"), scripted("b", "YES"), scripted("c", "NO")],
        )
        .await;

        assert!(engine.execute_candidate(candidate(dec!(0.01))).await.unwrap());

        let position = engine.positions.get("BTC/USDT").unwrap();
        assert_eq!(position.average_price, dec!(50000));
        let first_buy = position.levels.iter().find(|l| l.side == Side::Buy && l.index == 1).unwrap();
        let first_sell = position.levels.iter().find(|l| l.side == Side::Sell && l.index == 1).unwrap();
        assert_eq!(first_buy.price, dec!(49000));
        assert_eq!(first_sell.price, dec!(51000));
        assert!(!first_buy.filled && !first_sell.filled);

        assert_eq!(engine.db.load_open_positions().await.unwrap().len(), 1);
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM advisory_results")
            .fetch_one(engine.db.pool())
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_pending_consensus_drops_signal() {
        let mock = Arc::new(MockExchange::new());
        mock.set_price("BTC/USDT", dec!(50000));
        let mut engine = engine_with(
            mock.clone(),
            vec![scripted("a", "YES"), scripted("b", "NO"), scripted("c", "maybe")],
        )
        .await;

        assert!(!engine.execute_candidate(candidate(dec!(0.01))).await.unwrap());
        assert!(engine.positions.is_empty());
        assert!(mock.placed_orders().is_empty());
    }

    #[tokio::test]
    async fn test_risk_rejection_drops_approved_signal() {
        let mock = Arc::new(MockExchange::new());
        mock.set_price("BTC/USDT", dec!(50000));
        let mut engine = engine_with(mock.clone(), vec![scripted("a", "YES")]).await;

        // 0.03 BTC at 50000 is 1500, above the 1000 position cap
        assert!(!engine.execute_candidate(candidate(dec!(0.03))).await.unwrap());
        assert!(mock.placed_orders().is_empty());
    }

    #[tokio::test]
    async fn test_crossed_levels_fill_and_keep_average() {
        let mock = Arc::new(MockExchange::new());
        mock.set_price("BTC/USDT", dec!(50000));
        let mut engine = engine_with(mock.clone(), vec![scripted("a", "YES")]).await;
        assert!(engine.execute_candidate(candidate(dec!(0.01))).await.unwrap());

        // Drop through the first buy level without reaching the stop
        mock.set_price("BTC/USDT", dec!(48900));
        let (closed, fills) = engine.manage_positions().await;
        assert_eq!(closed, 0);
        assert_eq!(fills, 1);

        let position = engine.positions.get("BTC/USDT").unwrap();
        assert_eq!(position.total_quantity, dec!(0.012));
        assert_eq!(
            position.average_price,
            position.total_invested / position.total_quantity
        );
        assert!(position.levels.iter().any(|l| l.filled && l.side == Side::Buy));
    }

    #[tokio::test]
    async fn test_failing_pair_does_not_abort_cycle() {
        let mock = Arc::new(MockExchange::new());
        mock.set_price("BTC/USDT", dec!(50000));
        let mut engine = engine_with(mock.clone(), vec![scripted("a", "YES")]).await;
        engine.pairs.push("NOPE/USDT".into());

        let summary = engine.run_cycle().await.unwrap();
        assert_eq!(summary.cycle, 1);
        assert!(summary.trading_allowed);
        assert_eq!(summary.opened, 0);
    }

    #[tokio::test]
    async fn test_pause_only_applies_while_running() {
        let mock = Arc::new(MockExchange::new());
        let mut engine = engine_with(mock, vec![scripted("a", "YES")]).await;

        engine.db.set_setting(SETTING_PAUSED, "true").await.unwrap();
        engine.sync_pause().await;
        assert_eq!(engine.state(), EngineState::Idle);

        engine.state = EngineState::Running;
        engine.sync_pause().await;
        assert_eq!(engine.state(), EngineState::Paused);

        engine.db.set_setting(SETTING_PAUSED, "false").await.unwrap();
        engine.sync_pause().await;
        assert_eq!(engine.state(), EngineState::Running);
    }

    fn suspended_since(minutes: i64) -> CircuitBreakerState {
        CircuitBreakerState {
            suspended: true,
            reason: Some("daily loss 3.00% >= limit".into()),
            suspended_at: Some(Utc::now() - chrono::Duration::minutes(minutes)),
            risk_level: RiskLevel::High,
        }
    }

    #[tokio::test]
    async fn test_cycle_resumes_after_cooldown() {
        let mock = Arc::new(MockExchange::new());
        mock.set_price("BTC/USDT", dec!(50000));
        let mut engine = engine_with(mock, vec![scripted("a", "YES")]).await;
        engine.db.save_breaker(&suspended_since(120)).await.unwrap();
        engine.initialize().await.unwrap();
        assert!(engine.risk.breaker().suspended);

        let summary = engine.run_cycle().await.unwrap();
        assert!(summary.trading_allowed);
        assert!(!engine.db.load_breaker().await.unwrap().unwrap().suspended);
    }

    #[tokio::test]
    async fn test_cycle_adopts_external_resume() {
        let mock = Arc::new(MockExchange::new());
        mock.set_price("BTC/USDT", dec!(50000));
        let mut engine = engine_with(mock, vec![scripted("a", "YES")]).await;
        engine.db.save_breaker(&suspended_since(10)).await.unwrap();
        engine.initialize().await.unwrap();

        let summary = engine.run_cycle().await.unwrap();
        assert!(!summary.trading_allowed);
        assert!(engine.db.load_breaker().await.unwrap().unwrap().suspended);

        // Cleared by another process between cycles
        engine.db.save_breaker(&CircuitBreakerState::default()).await.unwrap();
        let summary = engine.run_cycle().await.unwrap();
        assert!(summary.trading_allowed);
        assert!(!engine.db.load_breaker().await.unwrap().unwrap().suspended);
    }

    #[tokio::test]
    async fn test_cycle_assesses_open_positions() {
        let mock = Arc::new(MockExchange::new());
        mock.set_price("BTC/USDT", dec!(50000));
        mock.set_price("ETH/USDT", dec!(3000));
        let mut engine = engine_with(mock, vec![scripted("a", "YES")]).await;
        engine.positions.insert(
            "BTC/USDT".into(),
            GridPosition::open("BTC/USDT", "binance", dec!(0.01), dec!(50000), Vec::new()),
        );
        engine.positions.insert(
            "ETH/USDT".into(),
            GridPosition::open("ETH/USDT", "binance", dec!(0.01), dec!(3000), Vec::new()),
        );

        engine.run_cycle().await.unwrap();
        let risks = engine.risk.position_risks();
        assert_eq!(risks.len(), 2);
        assert_eq!(risks[0].pair, "BTC/USDT");
        assert!(risks[0].position_score <= risks[1].position_score);
        assert!(risks.iter().all(|r| r.suggested_stop_loss > Decimal::ZERO));
    }

    #[tokio::test]
    async fn test_partial_exit_keeps_remainder_open() {
        let mock = Arc::new(MockExchange::new());
        mock.set_price("BTC/USDT", dec!(50000));
        let mut engine = engine_with(mock.clone(), vec![scripted("a", "YES")]).await;
        assert!(engine.execute_candidate(candidate(dec!(0.01))).await.unwrap());

        mock.cap_fills(dec!(0.004));
        assert!(!engine.close_position("BTC/USDT", ExitReason::StopLoss).await.unwrap());
        let position = engine.positions.get("BTC/USDT").unwrap();
        assert_eq!(position.total_quantity, dec!(0.006));
        assert_eq!(position.realized_proceeds, dec!(200));
        assert!(engine.db.recent_trades(5).await.unwrap().is_empty());
        let stored = engine.db.load_open_positions().await.unwrap();
        assert_eq!(stored[0].total_quantity, dec!(0.006));

        mock.cap_fills(dec!(1));
        assert!(engine.close_position("BTC/USDT", ExitReason::StopLoss).await.unwrap());
        assert!(engine.positions.is_empty());
        let trades = engine.db.recent_trades(5).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert!(trades[0].realized_pnl.abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_restored_position_keeps_agents() {
        let mock = Arc::new(MockExchange::new());
        mock.set_price("BTC/USDT", dec!(50000));
        let mut engine = engine_with(
            mock.clone(),
            vec![scripted("alpha", "YES"), scripted("beta", "YES")],
        )
        .await;
        assert!(engine.execute_candidate(candidate(dec!(0.01))).await.unwrap());

        // Simulate a restart on the same database
        engine.positions.clear();
        engine.position_agents.clear();
        engine.initialize().await.unwrap();
        assert_eq!(engine.positions.len(), 1);

        engine.stop().await.unwrap();
        let trades = engine.db.recent_trades(5).await.unwrap();
        assert_eq!(trades[0].agents, "alpha,beta");
    }

    #[tokio::test]
    async fn test_stop_closes_positions() {
        let mock = Arc::new(MockExchange::new());
        mock.set_price("BTC/USDT", dec!(50000));
        let mut engine = engine_with(mock.clone(), vec![scripted("a", "YES")]).await;
        assert!(engine.execute_candidate(candidate(dec!(0.01))).await.unwrap());

        engine.stop().await.unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.positions.is_empty());
        let trades = engine.db.recent_trades(5).await.unwrap();
        assert_eq!(trades[0].exit_reason, "shutdown");
    }
}
