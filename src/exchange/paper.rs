//! Paper-trading exchange: real market data, simulated balances and fills.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{TradingError, TradingResult};
use crate::models::{
    split_symbol, Balance, Candle, MarketSnapshot, OpenOrder, OrderAck, OrderRequest, OrderType,
    Side,
};

use super::ExchangeApi;

/// Simulated account on top of a market-data feed.
///
/// Market orders fill immediately at the touch (ask for buys, bid for sells).
/// Limit orders rest until cancelled and reserve the funds they would spend.
pub struct PaperExchange {
    feed: Arc<dyn ExchangeApi>,
    balances: Mutex<HashMap<String, Balance>>,
    open_orders: Mutex<Vec<OpenOrder>>,
    fee_rate: Decimal,
}

impl PaperExchange {
    pub fn new(feed: Arc<dyn ExchangeApi>, starting_balances: HashMap<String, Decimal>) -> Self {
        let balances = starting_balances
            .into_iter()
            .map(|(currency, free)| {
                (
                    currency,
                    Balance {
                        free,
                        used: Decimal::ZERO,
                    },
                )
            })
            .collect();

        Self {
            feed,
            balances: Mutex::new(balances),
            open_orders: Mutex::new(Vec::new()),
            fee_rate: Decimal::ZERO,
        }
    }

    /// Fee charged on every simulated fill, as a fraction of notional.
    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    async fn settle_market(&self, order: &OrderRequest) -> TradingResult<OrderAck> {
        let (base, quote) = split_symbol(&order.symbol)
            .ok_or_else(|| TradingError::Validation(format!("bad symbol {}", order.symbol)))?;
        let ticker = self.feed.fetch_ticker(&order.symbol).await?;
        let price = ticker.price_for(order.side);
        if price <= Decimal::ZERO {
            return Err(TradingError::Validation(format!("no price for {}", order.symbol)));
        }

        let notional = order.amount * price;
        let fee = notional * self.fee_rate;

        let mut balances = self.balances.lock().await;
        match order.side {
            Side::Buy => {
                let available = balances.get(quote).map(|b| b.free).unwrap_or_default();
                if available < notional + fee {
                    return Err(TradingError::InsufficientFunds(format!(
                        "need {} {}, have {}",
                        notional + fee,
                        quote,
                        available
                    )));
                }
                balances.entry(quote.to_string()).or_default().free -= notional + fee;
                balances.entry(base.to_string()).or_default().free += order.amount;
            }
            Side::Sell => {
                let available = balances.get(base).map(|b| b.free).unwrap_or_default();
                if available < order.amount {
                    return Err(TradingError::InsufficientFunds(format!(
                        "need {} {}, have {}",
                        order.amount, base, available
                    )));
                }
                balances.entry(base.to_string()).or_default().free -= order.amount;
                balances.entry(quote.to_string()).or_default().free += notional - fee;
            }
        }

        info!(
            symbol = %order.symbol,
            side = %order.side,
            amount = %order.amount,
            price = %price,
            "Paper fill"
        );

        Ok(OrderAck {
            id: uuid::Uuid::new_v4().to_string(),
            status: "closed".to_string(),
            filled: order.amount,
            average: Some(price),
            raw: serde_json::json!({ "paper": true, "price": price.to_string() }),
        })
    }

    async fn rest_limit(&self, order: &OrderRequest, price: Decimal) -> TradingResult<OrderAck> {
        let (base, quote) = split_symbol(&order.symbol)
            .ok_or_else(|| TradingError::Validation(format!("bad symbol {}", order.symbol)))?;
        let (currency, reserve) = match order.side {
            Side::Buy => (quote, order.amount * price),
            Side::Sell => (base, order.amount),
        };

        let mut balances = self.balances.lock().await;
        let balance = balances.entry(currency.to_string()).or_default();
        if balance.free < reserve {
            return Err(TradingError::InsufficientFunds(format!(
                "need {} {}, have {}",
                reserve, currency, balance.free
            )));
        }
        balance.free -= reserve;
        balance.used += reserve;

        let id = uuid::Uuid::new_v4().to_string();
        self.open_orders.lock().await.push(OpenOrder {
            id: id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            price: Some(price),
            amount: order.amount,
            filled: Decimal::ZERO,
        });

        Ok(OrderAck {
            id,
            status: "open".to_string(),
            filled: Decimal::ZERO,
            average: None,
            raw: serde_json::json!({ "paper": true }),
        })
    }
}

#[async_trait]
impl ExchangeApi for PaperExchange {
    async fn load_markets(&self) -> TradingResult<()> {
        self.feed.load_markets().await
    }

    async fn fetch_ticker(&self, symbol: &str) -> TradingResult<MarketSnapshot> {
        self.feed.fetch_ticker(symbol).await
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> TradingResult<Vec<Candle>> {
        self.feed.fetch_ohlcv(symbol, timeframe, limit).await
    }

    async fn fetch_balance(&self) -> TradingResult<HashMap<String, Balance>> {
        Ok(self.balances.lock().await.clone())
    }

    async fn create_order(&self, order: &OrderRequest) -> TradingResult<OrderAck> {
        if order.amount <= Decimal::ZERO {
            return Err(TradingError::Validation("order amount must be positive".into()));
        }
        match (order.order_type, order.price) {
            (OrderType::Market, _) => self.settle_market(order).await,
            (OrderType::Limit, Some(price)) => self.rest_limit(order, price).await,
            (OrderType::Limit, None) => {
                Err(TradingError::Contract("limit order requires a price".into()))
            }
        }
    }

    async fn cancel_order(&self, id: &str, symbol: &str) -> TradingResult<serde_json::Value> {
        let order = {
            let mut orders = self.open_orders.lock().await;
            let idx = orders
                .iter()
                .position(|o| o.id == id && o.symbol == symbol)
                .ok_or_else(|| TradingError::Validation(format!("unknown order {}", id)))?;
            orders.remove(idx)
        };

        if let Some((base, quote)) = split_symbol(&order.symbol) {
            let (currency, reserved) = match order.side {
                Side::Buy => (quote, order.amount * order.price.unwrap_or_default()),
                Side::Sell => (base, order.amount),
            };
            let mut balances = self.balances.lock().await;
            let balance = balances.entry(currency.to_string()).or_default();
            balance.used -= reserved;
            balance.free += reserved;
        }

        Ok(serde_json::json!({ "id": id, "status": "canceled" }))
    }

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> TradingResult<Vec<OpenOrder>> {
        let orders = self.open_orders.lock().await;
        Ok(orders
            .iter()
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockExchange;
    use rust_decimal_macros::dec;

    fn paper(usdt: Decimal) -> PaperExchange {
        let feed = MockExchange::new();
        feed.set_price("BTC/USDT", dec!(50000));
        let mut start = HashMap::new();
        start.insert("USDT".to_string(), usdt);
        PaperExchange::new(Arc::new(feed), start)
    }

    fn market(side: Side, amount: Decimal) -> OrderRequest {
        OrderRequest {
            symbol: "BTC/USDT".into(),
            side,
            order_type: OrderType::Market,
            amount,
            price: None,
        }
    }

    #[tokio::test]
    async fn test_market_buy_then_sell() {
        let exchange = paper(dec!(1000));

        let ack = exchange.create_order(&market(Side::Buy, dec!(0.01))).await.unwrap();
        assert_eq!(ack.average, Some(dec!(50000)));

        let balances = exchange.fetch_balance().await.unwrap();
        assert_eq!(balances["USDT"].free, dec!(500));
        assert_eq!(balances["BTC"].free, dec!(0.01));

        exchange.create_order(&market(Side::Sell, dec!(0.01))).await.unwrap();
        let balances = exchange.fetch_balance().await.unwrap();
        assert_eq!(balances["USDT"].free, dec!(1000));
    }

    #[tokio::test]
    async fn test_insufficient_funds() {
        let exchange = paper(dec!(100));
        let err = exchange.create_order(&market(Side::Buy, dec!(0.01))).await.unwrap_err();
        assert!(matches!(err, TradingError::InsufficientFunds(_)));
    }

    #[test]
    fn test_limit_reserve_and_cancel() {
        tokio_test::block_on(async {
            let exchange = paper(dec!(1000));
            let order = OrderRequest {
                price: Some(dec!(40000)),
                order_type: OrderType::Limit,
                ..market(Side::Buy, dec!(0.01))
            };
            let ack = exchange.create_order(&order).await.unwrap();
            assert_eq!(exchange.fetch_open_orders(None).await.unwrap().len(), 1);
            assert_eq!(exchange.fetch_balance().await.unwrap()["USDT"].used, dec!(400));

            exchange.cancel_order(&ack.id, "BTC/USDT").await.unwrap();
            let balances = exchange.fetch_balance().await.unwrap();
            assert_eq!(balances["USDT"].free, dec!(1000));
            assert!(exchange.fetch_open_orders(Some("BTC/USDT")).await.unwrap().is_empty());
        });
    }
}
