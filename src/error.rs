//! Error taxonomy shared by the exchange, advisory and risk layers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TradingError {
    /// Transport failure or 5xx from a remote endpoint. Retried with backoff.
    #[error("Network error: {0}")]
    Network(String),

    /// Rejected credentials. Never retried; the connector is marked failed.
    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// The trade itself was rejected (bad size, unknown symbol, ...).
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    /// An advisory agent failed to produce a usable answer.
    #[error("Advisory error: {0}")]
    Advisory(String),

    #[error("Risk management error: {0}")]
    RiskManagement(String),

    /// Caller broke an API contract (e.g. limit order without a price).
    #[error("Contract violation: {0}")]
    Contract(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl TradingError {
    /// Whether the gateway may retry the call that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TradingError::Network(_) | TradingError::RateLimit(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, TradingError::Authentication(_))
    }
}

impl From<reqwest::Error> for TradingError {
    fn from(err: reqwest::Error) -> Self {
        match err.status().map(|s| s.as_u16()) {
            Some(401) | Some(403) => TradingError::Authentication(err.to_string()),
            Some(429) => TradingError::RateLimit(err.to_string()),
            Some(code) if (400..500).contains(&code) => TradingError::Validation(err.to_string()),
            _ => TradingError::Network(err.to_string()),
        }
    }
}

pub type TradingResult<T> = std::result::Result<T, TradingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(TradingError::Network("reset".into()).is_retryable());
        assert!(TradingError::RateLimit("429".into()).is_retryable());
        assert!(!TradingError::Authentication("bad key".into()).is_retryable());
        assert!(!TradingError::Validation("lot size".into()).is_retryable());
        assert!(!TradingError::InsufficientFunds("usdt".into()).is_retryable());
    }

    #[test]
    fn test_display_carries_reason() {
        let err = TradingError::Contract("limit order requires a price".into());
        assert_eq!(err.to_string(), "Contract violation: limit order requires a price");
    }
}
