//! Exchange connectivity: the unified exchange surface, per-exchange gateways
//! with rate limiting and reconnection, and the multi-exchange router.

mod gateway;
mod paper;
mod rest;
mod router;

#[cfg(test)]
pub mod mock;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::TradingResult;
use crate::models::{Balance, Candle, MarketSnapshot, OpenOrder, OrderAck, OrderRequest};

pub use gateway::{ConnectionState, ExchangeGateway, GatewayStatus};
pub use paper::PaperExchange;
pub use rest::RestExchange;
pub use router::{BestPrice, ExchangeRouter};

/// Unified exchange surface. One implementation per transport.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Verify connectivity and credentials.
    async fn load_markets(&self) -> TradingResult<()>;

    async fn fetch_ticker(&self, symbol: &str) -> TradingResult<MarketSnapshot>;

    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: u32)
        -> TradingResult<Vec<Candle>>;

    async fn fetch_balance(&self) -> TradingResult<HashMap<String, Balance>>;

    async fn create_order(&self, order: &OrderRequest) -> TradingResult<OrderAck>;

    async fn cancel_order(&self, id: &str, symbol: &str) -> TradingResult<serde_json::Value>;

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> TradingResult<Vec<OpenOrder>>;

    /// Release any session state before a reconnect.
    async fn close(&self) {}
}
