//! Per-exchange connector: connection lifecycle, rate limiting, retries and reconnects.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ExchangeConfig;
use crate::error::{TradingError, TradingResult};
use crate::models::{
    Balance, Candle, MarketSnapshot, OpenOrder, OrderRequest, OrderResult, OrderType, Side,
};

use super::ExchangeApi;

/// Connector lifecycle.
///
/// `Failed` is terminal: reached on rejected credentials or after the reconnect
/// budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Failed => "failed",
        }
    }

    /// Whether requests are routed to this connector.
    pub fn is_usable(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a connector for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub exchange_id: String,
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub reconnects_exhausted: bool,
    pub last_error: Option<String>,
}

/// Enforces a minimum delay between consecutive requests.
struct RateLimiter {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Wait for the next request slot. Holding the lock serializes callers.
    async fn acquire(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Connector for a single exchange.
pub struct ExchangeGateway {
    config: ExchangeConfig,
    api: Arc<dyn ExchangeApi>,
    state: RwLock<ConnectionState>,
    limiter: RateLimiter,
    reconnect_attempts: AtomicU32,
    reconnects_exhausted: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl ExchangeGateway {
    pub fn new(config: ExchangeConfig, api: Arc<dyn ExchangeApi>) -> Self {
        let limiter = RateLimiter::new(config.rate_limit());
        Self {
            config,
            api,
            state: RwLock::new(ConnectionState::Disconnected),
            limiter,
            reconnect_attempts: AtomicU32::new(0),
            reconnects_exhausted: AtomicBool::new(false),
            last_error: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn min_notional(&self) -> Decimal {
        self.config.min_notional
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    async fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write().await;
        if *state == next {
            return;
        }
        let prev = *state;
        *state = next;
        match next {
            ConnectionState::Failed => {
                error!(exchange = %self.config.id, from = %prev, "Exchange connector failed")
            }
            ConnectionState::Degraded | ConnectionState::Disconnected => {
                warn!(exchange = %self.config.id, from = %prev, to = %next, "Exchange connection state changed")
            }
            _ => info!(exchange = %self.config.id, from = %prev, to = %next, "Exchange connection state changed"),
        }
    }

    pub async fn status(&self) -> GatewayStatus {
        GatewayStatus {
            exchange_id: self.config.id.clone(),
            state: self.state().await,
            reconnect_attempts: self.reconnect_attempts.load(Ordering::SeqCst),
            reconnects_exhausted: self.reconnects_exhausted.load(Ordering::SeqCst),
            last_error: self.last_error.read().await.clone(),
        }
    }

    // ==================== Lifecycle ====================

    /// Open the connection and verify credentials.
    pub async fn connect(&self) -> TradingResult<()> {
        if self.state().await == ConnectionState::Failed {
            return Err(self.unavailable());
        }

        self.set_state(ConnectionState::Connecting).await;
        let api = self.api.clone();
        let result = self
            .call("load_markets", || {
                let api = api.clone();
                async move { api.load_markets().await }
            })
            .await;

        match result {
            Ok(()) => {
                self.set_state(ConnectionState::Connected).await;
                Ok(())
            }
            Err(e) => {
                if !e.is_auth() {
                    self.set_state(ConnectionState::Disconnected).await;
                }
                Err(e)
            }
        }
    }

    /// Close and re-open the connection with exponential backoff.
    ///
    /// Sleeps `base * 2^attempt` before each attempt; once the attempt budget is
    /// spent the connector is left `Failed`.
    pub async fn reconnect(&self) -> TradingResult<()> {
        if self.state().await == ConnectionState::Failed {
            return Err(self.unavailable());
        }

        let max_attempts = self.config.max_reconnect_attempts;
        for attempt in 1..=max_attempts {
            self.api.close().await;
            self.reconnect_attempts.store(attempt, Ordering::SeqCst);

            let delay = self.reconnect_delay(attempt);
            warn!(
                exchange = %self.config.id,
                attempt = attempt,
                max_attempts = max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to exchange"
            );
            tokio::time::sleep(delay).await;

            match self.connect().await {
                Ok(()) => {
                    self.reconnect_attempts.store(0, Ordering::SeqCst);
                    info!(exchange = %self.config.id, attempt = attempt, "Reconnected");
                    return Ok(());
                }
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    warn!(exchange = %self.config.id, attempt = attempt, error = %e, "Reconnect attempt failed");
                }
            }
        }

        self.reconnects_exhausted.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Failed).await;
        Err(TradingError::Network(format!(
            "{}: reconnect attempts exhausted ({})",
            self.config.id, max_attempts
        )))
    }

    fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.config.reconnect_base_delay_ms.saturating_mul(factor))
    }

    fn unavailable(&self) -> TradingError {
        TradingError::Network(format!("exchange {} is unavailable", self.config.id))
    }

    // ==================== Request Pipeline ====================

    /// Run one exchange call through the rate limiter with bounded retries.
    async fn call<T, F, Fut>(&self, op: &'static str, mut f: F) -> TradingResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TradingResult<T>>,
    {
        if self.state().await == ConnectionState::Failed {
            return Err(self.unavailable());
        }

        let max_attempts = self.config.max_retries.max(1);
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.config.retry_base_delay_ms))
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build();

        let mut attempt = 0u32;
        let result = backoff::future::retry(policy, || {
            attempt += 1;
            let current = attempt;
            let fut = f();
            async move {
                self.limiter.acquire().await;
                match fut.await {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_retryable() && current < max_attempts => {
                        debug!(exchange = %self.config.id, op = op, attempt = current, error = %e, "Retrying exchange call");
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        })
        .await;

        match &result {
            Ok(_) => {
                if self.state().await == ConnectionState::Degraded {
                    self.set_state(ConnectionState::Connected).await;
                }
            }
            Err(e) => {
                *self.last_error.write().await = Some(e.to_string());
                if e.is_auth() {
                    self.set_state(ConnectionState::Failed).await;
                } else if matches!(e, TradingError::Network(_) | TradingError::RateLimit(_))
                    && self.state().await == ConnectionState::Connected
                {
                    self.set_state(ConnectionState::Degraded).await;
                }
            }
        }
        result
    }

    // ==================== Market Data ====================

    pub async fn fetch_market_data(&self, symbol: &str) -> TradingResult<MarketSnapshot> {
        let api = self.api.clone();
        self.call("fetch_ticker", || {
            let api = api.clone();
            let symbol = symbol.to_string();
            async move { api.fetch_ticker(&symbol).await }
        })
        .await
    }

    pub async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> TradingResult<Vec<Candle>> {
        let api = self.api.clone();
        self.call("fetch_ohlcv", || {
            let api = api.clone();
            let symbol = symbol.to_string();
            let timeframe = timeframe.to_string();
            async move { api.fetch_ohlcv(&symbol, &timeframe, limit).await }
        })
        .await
    }

    pub async fn fetch_balances(&self) -> TradingResult<HashMap<String, Balance>> {
        let api = self.api.clone();
        self.call("fetch_balance", || {
            let api = api.clone();
            async move { api.fetch_balance().await }
        })
        .await
    }

    /// Free balance of one currency, zero when absent.
    pub async fn free_balance(&self, currency: &str) -> TradingResult<Decimal> {
        let balances = self.fetch_balances().await?;
        Ok(balances.get(currency).map(|b| b.free).unwrap_or_default())
    }

    pub async fn fetch_open_orders(&self, symbol: Option<&str>) -> TradingResult<Vec<OpenOrder>> {
        let api = self.api.clone();
        self.call("fetch_open_orders", || {
            let api = api.clone();
            let symbol = symbol.map(str::to_string);
            async move { api.fetch_open_orders(symbol.as_deref()).await }
        })
        .await
    }

    // ==================== Orders ====================

    /// Place an order.
    ///
    /// Exchange rejections come back as an unsuccessful `OrderResult`; only a
    /// malformed request (limit without price, non-positive size) is an error.
    pub async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
        order_type: OrderType,
    ) -> TradingResult<OrderResult> {
        if order_type == OrderType::Limit && price.is_none() {
            return Err(TradingError::Contract("limit order requires a price".into()));
        }
        if quantity <= Decimal::ZERO {
            return Err(TradingError::Contract(format!(
                "order quantity must be positive, got {}",
                quantity
            )));
        }

        let request = OrderRequest {
            symbol: symbol.to_string(),
            side,
            order_type,
            amount: quantity,
            price: if order_type == OrderType::Limit { price } else { None },
        };

        let api = self.api.clone();
        let result = self
            .call("create_order", || {
                let api = api.clone();
                let request = request.clone();
                async move { api.create_order(&request).await }
            })
            .await;

        match result {
            Ok(ack) => {
                info!(
                    exchange = %self.config.id,
                    symbol = %symbol,
                    side = %side,
                    quantity = %quantity,
                    order_id = %ack.id,
                    "Order placed"
                );
                Ok(OrderResult::accepted(ack))
            }
            Err(TradingError::Contract(msg)) => Err(TradingError::Contract(msg)),
            Err(e) => {
                warn!(exchange = %self.config.id, symbol = %symbol, error = %e, "Order rejected");
                Ok(OrderResult::rejected(e.to_string()))
            }
        }
    }

    pub async fn cancel_order(&self, order_id: &str, symbol: &str) -> TradingResult<OrderResult> {
        let api = self.api.clone();
        let result = self
            .call("cancel_order", || {
                let api = api.clone();
                let order_id = order_id.to_string();
                let symbol = symbol.to_string();
                async move { api.cancel_order(&order_id, &symbol).await }
            })
            .await;

        match result {
            Ok(raw) => Ok(OrderResult::cancelled(order_id, raw)),
            Err(TradingError::Contract(msg)) => Err(TradingError::Contract(msg)),
            Err(e) => {
                warn!(exchange = %self.config.id, order_id = %order_id, error = %e, "Cancel rejected");
                Ok(OrderResult::rejected(e.to_string()))
            }
        }
    }
}
