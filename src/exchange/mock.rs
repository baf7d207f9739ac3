//! In-memory exchange used by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::{TradingError, TradingResult};
use crate::models::{Balance, Candle, MarketSnapshot, OpenOrder, OrderAck, OrderRequest};

use super::ExchangeApi;

#[derive(Default)]
pub struct MockExchange {
    pub tickers: Mutex<HashMap<String, MarketSnapshot>>,
    pub candles: Mutex<HashMap<String, Vec<Candle>>>,
    pub balances: Mutex<HashMap<String, Balance>>,
    pub open_orders: Mutex<Vec<OpenOrder>>,
    pub orders: Mutex<Vec<OrderRequest>>,
    /// Errors returned, in order, by the next calls
    pub failures: Mutex<VecDeque<TradingError>>,
    /// Largest quantity any single order fills
    pub fill_cap: Mutex<Option<Decimal>>,
    pub calls: AtomicU32,
    pub connects: AtomicU32,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.set_quote(symbol, price, price);
    }

    pub fn set_quote(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        let snapshot = MarketSnapshot {
            symbol: symbol.to_string(),
            bid,
            ask,
            last: (bid + ask) / Decimal::TWO,
            volume: Decimal::ONE_THOUSAND,
            change_pct: Decimal::ZERO,
            timestamp: Utc::now(),
        };
        self.tickers.lock().unwrap().insert(symbol.to_string(), snapshot);
    }

    pub fn set_candles(&self, symbol: &str, closes: &[f64]) {
        let start = Utc::now() - Duration::hours(closes.len() as i64);
        let candles = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                timestamp: start + Duration::hours(i as i64),
                open: close,
                high: close * 1.005,
                low: close * 0.995,
                close,
                volume: 100.0,
            })
            .collect();
        self.candles.lock().unwrap().insert(symbol.to_string(), candles);
    }

    pub fn set_balance(&self, currency: &str, free: Decimal) {
        self.balances.lock().unwrap().insert(
            currency.to_string(),
            Balance {
                free,
                used: Decimal::ZERO,
            },
        );
    }

    pub fn fail_next(&self, error: TradingError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn cap_fills(&self, max: Decimal) {
        *self.fill_cap.lock().unwrap() = Some(max);
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn placed_orders(&self) -> Vec<OrderRequest> {
        self.orders.lock().unwrap().clone()
    }

    fn tick(&self) -> TradingResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn load_markets(&self) -> TradingResult<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.tick()
    }

    async fn fetch_ticker(&self, symbol: &str) -> TradingResult<MarketSnapshot> {
        self.tick()?;
        self.tickers
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .ok_or_else(|| TradingError::Validation(format!("unknown symbol {}", symbol)))
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        _timeframe: &str,
        limit: u32,
    ) -> TradingResult<Vec<Candle>> {
        self.tick()?;
        let candles = self.candles.lock().unwrap().get(symbol).cloned().unwrap_or_default();
        let skip = candles.len().saturating_sub(limit as usize);
        Ok(candles.into_iter().skip(skip).collect())
    }

    async fn fetch_balance(&self) -> TradingResult<HashMap<String, Balance>> {
        self.tick()?;
        Ok(self.balances.lock().unwrap().clone())
    }

    async fn create_order(&self, order: &OrderRequest) -> TradingResult<OrderAck> {
        self.tick()?;
        let price = order.price.or_else(|| {
            self.tickers
                .lock()
                .unwrap()
                .get(&order.symbol)
                .map(|t| t.price_for(order.side))
        });
        let filled = match *self.fill_cap.lock().unwrap() {
            Some(cap) => order.amount.min(cap),
            None => order.amount,
        };
        let mut orders = self.orders.lock().unwrap();
        orders.push(order.clone());
        Ok(OrderAck {
            id: format!("mock-{}", orders.len()),
            status: "closed".to_string(),
            filled,
            average: price,
            raw: serde_json::json!({ "price": price.and_then(|p| p.to_f64()) }),
        })
    }

    async fn cancel_order(&self, id: &str, _symbol: &str) -> TradingResult<serde_json::Value> {
        self.tick()?;
        let mut open = self.open_orders.lock().unwrap();
        open.retain(|o| o.id != id);
        Ok(serde_json::json!({ "id": id }))
    }

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> TradingResult<Vec<OpenOrder>> {
        self.tick()?;
        Ok(self
            .open_orders
            .lock()
            .unwrap()
            .iter()
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect())
    }
}
