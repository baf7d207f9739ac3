//! Multi-exchange router: best-price discovery, order routing and health.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{TradingError, TradingResult};
use crate::models::{MarketSnapshot, OrderResult, OrderType, Side};

use super::{ConnectionState, ExchangeGateway, GatewayStatus};

/// Best quote found across the connected exchanges.
#[derive(Debug, Clone)]
pub struct BestPrice {
    pub exchange_id: String,
    pub price: Decimal,
    pub snapshot: MarketSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub exchanges: Vec<GatewayStatus>,
}

impl HealthReport {
    fn from_statuses(exchanges: Vec<GatewayStatus>) -> Self {
        let status = if exchanges.is_empty()
            || exchanges
                .iter()
                .any(|s| s.state == ConnectionState::Failed || s.reconnects_exhausted)
        {
            HealthStatus::Unhealthy
        } else if exchanges.iter().any(|s| s.state != ConnectionState::Connected) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        Self { status, exchanges }
    }
}

/// Routes requests across every configured exchange.
pub struct ExchangeRouter {
    gateways: BTreeMap<String, Arc<ExchangeGateway>>,
}

impl ExchangeRouter {
    pub fn new(gateways: Vec<ExchangeGateway>) -> Self {
        let gateways = gateways
            .into_iter()
            .map(|g| (g.id().to_string(), Arc::new(g)))
            .collect();
        Self { gateways }
    }

    pub fn get(&self, exchange_id: &str) -> Option<&Arc<ExchangeGateway>> {
        self.gateways.get(exchange_id)
    }

    /// Configured exchange ids, sorted.
    pub fn exchange_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.gateways.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }

    /// Connect every gateway. Returns how many came up.
    pub async fn connect_all(&self) -> usize {
        let results = join_all(self.gateways.values().map(|g| async move {
            let result = g.connect().await;
            if let Err(e) = &result {
                warn!(exchange = %g.id(), error = %e, "Failed to connect exchange");
            }
            result.is_ok()
        }))
        .await;

        let connected = results.into_iter().filter(|ok| *ok).count();
        info!(connected = connected, total = self.gateways.len(), "Exchanges connected");
        connected
    }

    /// Reconnect gateways that dropped or degraded.
    pub async fn maintain_connections(&self) {
        for gateway in self.gateways.values() {
            let state = gateway.state().await;
            if matches!(state, ConnectionState::Disconnected | ConnectionState::Degraded) {
                if let Err(e) = gateway.reconnect().await {
                    warn!(exchange = %gateway.id(), error = %e, "Reconnect failed");
                }
            }
        }
    }

    async fn usable(&self) -> Vec<Arc<ExchangeGateway>> {
        let mut usable = Vec::new();
        for gateway in self.gateways.values() {
            if gateway.state().await.is_usable() {
                usable.push(gateway.clone());
            }
        }
        usable
    }

    /// Best executable price for `side`: lowest ask to buy, highest bid to sell.
    ///
    /// Exchanges that fail to quote are skipped. `None` when nobody quotes.
    pub async fn best_price(&self, symbol: &str, side: Side) -> Option<BestPrice> {
        let gateways = self.usable().await;
        let quotes = join_all(gateways.iter().map(|g| async move {
            match g.fetch_market_data(symbol).await {
                Ok(snapshot) => Some((g.id().to_string(), snapshot)),
                Err(e) => {
                    debug!(exchange = %g.id(), symbol = %symbol, error = %e, "Quote unavailable");
                    None
                }
            }
        }))
        .await;

        quotes
            .into_iter()
            .flatten()
            .map(|(exchange_id, snapshot)| BestPrice {
                exchange_id,
                price: snapshot.price_for(side),
                snapshot,
            })
            .filter(|q| q.price > Decimal::ZERO)
            .reduce(|best, q| {
                let better = match side {
                    Side::Buy => q.price < best.price,
                    Side::Sell => q.price > best.price,
                };
                if better {
                    q
                } else {
                    best
                }
            })
    }

    /// Place an order on a specific exchange.
    pub async fn place_order(
        &self,
        exchange_id: &str,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
        order_type: OrderType,
    ) -> TradingResult<OrderResult> {
        let gateway = self
            .gateways
            .get(exchange_id)
            .ok_or_else(|| TradingError::Validation(format!("unknown exchange {}", exchange_id)))?;
        gateway.place_order(symbol, side, quantity, price, order_type).await
    }

    pub async fn free_balance(&self, exchange_id: &str, currency: &str) -> TradingResult<Decimal> {
        let gateway = self
            .gateways
            .get(exchange_id)
            .ok_or_else(|| TradingError::Validation(format!("unknown exchange {}", exchange_id)))?;
        gateway.free_balance(currency).await
    }

    /// Cancel every open order on every usable exchange.
    ///
    /// Returns the number of orders cancelled per exchange.
    pub async fn cancel_all(&self) -> HashMap<String, usize> {
        let mut cancelled = HashMap::new();
        for gateway in self.usable().await {
            let orders = match gateway.fetch_open_orders(None).await {
                Ok(orders) => orders,
                Err(e) => {
                    warn!(exchange = %gateway.id(), error = %e, "Failed to list open orders");
                    continue;
                }
            };

            let mut count = 0;
            for order in orders {
                match gateway.cancel_order(&order.id, &order.symbol).await {
                    Ok(result) if result.success => count += 1,
                    Ok(result) => {
                        warn!(exchange = %gateway.id(), order_id = %order.id, error = ?result.error, "Cancel failed")
                    }
                    Err(e) => warn!(exchange = %gateway.id(), order_id = %order.id, error = %e, "Cancel failed"),
                }
            }
            cancelled.insert(gateway.id().to_string(), count);
        }
        cancelled
    }

    pub async fn health_report(&self) -> HealthReport {
        let mut statuses = Vec::with_capacity(self.gateways.len());
        for gateway in self.gateways.values() {
            statuses.push(gateway.status().await);
        }
        HealthReport::from_statuses(statuses)
    }
}
