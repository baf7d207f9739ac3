//! Data models for market data, grid positions, advisory audit and risk state.

mod advisory;
mod grid;
mod market;
mod risk;
mod trade;

pub use advisory::{
    AdvisoryResult, Decision, IndicatorSnapshot, SentimentClass, SentimentSnapshot,
    TradeHypothesis,
};
pub use grid::{GridLevel, GridPosition, PositionStatus};
pub use market::{
    split_symbol, Balance, Candle, MarketSnapshot, OpenOrder, OrderAck, OrderRequest,
    OrderResult, OrderType, Side,
};
pub use risk::{CircuitBreakerState, PositionRisk, RiskLevel, RiskMetrics};
pub use trade::TradeRecord;
