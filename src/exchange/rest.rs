//! REST client for a unified exchange bridge.
//!
//! The bridge exposes one JSON surface for every venue (ticker, OHLCV, balance,
//! orders) and holds the venue-specific signing. Credentials travel as headers.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::config::ExchangeConfig;
use crate::error::{TradingError, TradingResult};
use crate::models::{Balance, Candle, MarketSnapshot, OpenOrder, OrderAck, OrderRequest};

use super::ExchangeApi;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Ticker payload from `GET /ticker`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerResponse {
    symbol: String,
    #[serde(default)]
    bid: Option<Decimal>,
    #[serde(default)]
    ask: Option<Decimal>,
    #[serde(default)]
    last: Option<Decimal>,
    #[serde(default)]
    base_volume: Option<Decimal>,
    #[serde(default)]
    percentage: Option<Decimal>,
    /// Milliseconds since epoch
    #[serde(default)]
    timestamp: Option<i64>,
}

/// Balance payload from `GET /balance`.
#[derive(Debug, Clone, Deserialize)]
struct BalanceResponse {
    #[serde(default)]
    free: HashMap<String, Decimal>,
    #[serde(default)]
    used: HashMap<String, Decimal>,
}

/// Order payload from `POST /orders`.
#[derive(Debug, Clone, Deserialize)]
struct OrderResponse {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    filled: Option<Decimal>,
    #[serde(default)]
    average: Option<Decimal>,
}

/// HTTP client for one exchange behind the bridge.
pub struct RestExchange {
    client: Client,
    config: ExchangeConfig,
}

impl RestExchange {
    pub fn new(config: ExchangeConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_url.trim_end_matches('/'), path)
    }

    fn auth_headers(&self) -> TradingResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        let mut insert = |name: &'static str, value: &str| -> TradingResult<()> {
            let value = HeaderValue::from_str(value)
                .map_err(|e| TradingError::Contract(format!("invalid {} header: {}", name, e)))?;
            headers.insert(HeaderName::from_static(name), value);
            Ok(())
        };

        insert("x-exchange", &self.config.id)?;
        insert("x-api-key", &self.config.api_key)?;
        insert("x-api-secret", &self.config.api_secret)?;
        if let Some(passphrase) = &self.config.passphrase {
            insert("x-api-passphrase", passphrase)?;
        }
        if self.config.testnet {
            insert("x-testnet", "true")?;
        }
        Ok(headers)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> TradingResult<T> {
        let response = request
            .headers(self.auth_headers()?)
            .send()
            .await
            .map_err(|e| TradingError::Network(format!("{} request failed: {}", what, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, what));
        }

        response
            .json()
            .await
            .map_err(|e| TradingError::Network(format!("Failed to parse {} response: {}", what, e)))
    }
}

/// Map a non-success HTTP status to the error taxonomy.
fn classify_status(status: StatusCode, body: &str, what: &str) -> TradingError {
    let message = format!("{} request failed: {} - {}", what, status, body);
    match status.as_u16() {
        401 | 403 => TradingError::Authentication(message),
        429 => TradingError::RateLimit(message),
        400..=499 => {
            let lower = body.to_lowercase();
            if lower.contains("insufficient") {
                TradingError::InsufficientFunds(message)
            } else {
                TradingError::Validation(message)
            }
        }
        _ => TradingError::Network(message),
    }
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[async_trait]
impl ExchangeApi for RestExchange {
    async fn load_markets(&self) -> TradingResult<()> {
        let url = self.url("markets");
        debug!(exchange = %self.config.id, url = %url, "Loading markets");
        let _: serde_json::Value = self.send(self.client.get(&url), "markets").await?;
        Ok(())
    }

    async fn fetch_ticker(&self, symbol: &str) -> TradingResult<MarketSnapshot> {
        let request = self.client.get(self.url("ticker")).query(&[("symbol", symbol)]);
        let ticker: TickerResponse = self.send(request, "ticker").await?;

        let last = ticker.last.unwrap_or_default();
        Ok(MarketSnapshot {
            symbol: ticker.symbol,
            bid: ticker.bid.unwrap_or(last),
            ask: ticker.ask.unwrap_or(last),
            last,
            volume: ticker.base_volume.unwrap_or_default(),
            change_pct: ticker.percentage.unwrap_or_default(),
            timestamp: ticker.timestamp.map(millis_to_utc).unwrap_or_else(Utc::now),
        })
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> TradingResult<Vec<Candle>> {
        let request = self.client.get(self.url("ohlcv")).query(&[
            ("symbol", symbol.to_string()),
            ("timeframe", timeframe.to_string()),
            ("limit", limit.to_string()),
        ]);
        let rows: Vec<[f64; 6]> = self.send(request, "ohlcv").await?;

        Ok(rows
            .into_iter()
            .map(|[ts, open, high, low, close, volume]| Candle {
                timestamp: millis_to_utc(ts as i64),
                open,
                high,
                low,
                close,
                volume,
            })
            .collect())
    }

    async fn fetch_balance(&self) -> TradingResult<HashMap<String, Balance>> {
        let response: BalanceResponse = self.send(self.client.get(self.url("balance")), "balance").await?;

        let mut balances: HashMap<String, Balance> = HashMap::new();
        for (currency, free) in response.free {
            balances.entry(currency).or_default().free = free;
        }
        for (currency, used) in response.used {
            balances.entry(currency).or_default().used = used;
        }
        Ok(balances)
    }

    async fn create_order(&self, order: &OrderRequest) -> TradingResult<OrderAck> {
        debug!(
            exchange = %self.config.id,
            symbol = %order.symbol,
            side = %order.side,
            amount = %order.amount,
            "Submitting order"
        );
        let request = self.client.post(self.url("orders")).json(order);
        let raw: serde_json::Value = self.send(request, "order").await?;
        let parsed: OrderResponse = serde_json::from_value(raw.clone())
            .map_err(|e| TradingError::Network(format!("Failed to parse order response: {}", e)))?;

        Ok(OrderAck {
            id: parsed.id,
            status: parsed.status,
            filled: parsed.filled.unwrap_or_default(),
            average: parsed.average,
            raw,
        })
    }

    async fn cancel_order(&self, id: &str, symbol: &str) -> TradingResult<serde_json::Value> {
        let request = self
            .client
            .delete(self.url(&format!("orders/{}", id)))
            .query(&[("symbol", symbol)]);
        self.send(request, "cancel").await
    }

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> TradingResult<Vec<OpenOrder>> {
        let mut request = self.client.get(self.url("orders/open"));
        if let Some(symbol) = symbol {
            request = request.query(&[("symbol", symbol)]);
        }
        self.send(request, "open orders").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let auth = classify_status(StatusCode::UNAUTHORIZED, "bad key", "ticker");
        assert!(auth.is_auth());

        let limited = classify_status(StatusCode::TOO_MANY_REQUESTS, "", "ticker");
        assert!(matches!(limited, TradingError::RateLimit(_)));

        let funds = classify_status(StatusCode::BAD_REQUEST, "Insufficient balance for USDT", "order");
        assert!(matches!(funds, TradingError::InsufficientFunds(_)));

        let invalid = classify_status(StatusCode::BAD_REQUEST, "lot size", "order");
        assert!(matches!(invalid, TradingError::Validation(_)));

        let server = classify_status(StatusCode::BAD_GATEWAY, "", "order");
        assert!(server.is_retryable());
    }

    #[test]
    fn test_auth_headers() {
        let mut config = ExchangeConfig::new("kucoin", "http://localhost:9000/");
        config.api_key = "key".into();
        config.api_secret = "secret".into();
        config.passphrase = Some("phrase".into());
        config.testnet = true;

        let client = RestExchange::new(config).unwrap();
        let headers = client.auth_headers().unwrap();
        assert_eq!(headers.get("x-api-key").unwrap(), "key");
        assert_eq!(headers.get("x-api-passphrase").unwrap(), "phrase");
        assert_eq!(headers.get("x-testnet").unwrap(), "true");
        assert_eq!(client.url("ticker"), "http://localhost:9000/ticker");
    }
}
