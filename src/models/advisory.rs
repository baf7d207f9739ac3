//! Trade hypotheses and the advisory results collected for them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Side;

/// Decision returned by one advisory agent, or by the consensus as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Deny,
    Pending,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Deny => "deny",
            Decision::Pending => "pending",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Indicator values attached to a hypothesis and to trade history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub rsi: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub atr: Option<f64>,
    pub adx: Option<f64>,
    pub bollinger_upper: Option<f64>,
    pub bollinger_lower: Option<f64>,
    pub volume: Option<f64>,
    pub volume_avg: Option<f64>,
}

/// Overall market mood classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentClass {
    Bullish,
    Bearish,
    #[default]
    Neutral,
}

impl SentimentClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentClass::Bullish => "bullish",
            SentimentClass::Bearish => "bearish",
            SentimentClass::Neutral => "neutral",
        }
    }
}

/// Aggregated sentiment at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentSnapshot {
    /// Weighted score in [-1, 1]
    pub score: f64,
    pub classification: SentimentClass,
    /// 0 (extreme fear) to 100 (extreme greed)
    pub fear_greed_index: u32,
    pub news_score: Option<f64>,
    pub confidence: f64,
    /// Names of the sources that resolved
    pub sources: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl SentimentSnapshot {
    /// Result used when no source resolves.
    pub fn neutral() -> Self {
        Self {
            score: 0.0,
            classification: SentimentClass::Neutral,
            fear_greed_index: 50,
            news_score: None,
            confidence: 0.0,
            sources: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Candidate trade put to the advisory agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeHypothesis {
    pub id: String,
    pub pair: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    #[serde(default)]
    pub change_24h_pct: Decimal,
    pub indicators: IndicatorSnapshot,
    pub sentiment: SentimentSnapshot,
    pub timestamp: DateTime<Utc>,
}

impl TradeHypothesis {
    pub fn new(
        pair: impl Into<String>,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        indicators: IndicatorSnapshot,
        sentiment: SentimentSnapshot,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pair: pair.into(),
            side,
            quantity,
            price,
            change_24h_pct: Decimal::ZERO,
            indicators,
            sentiment,
            timestamp: Utc::now(),
        }
    }

    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }
}

/// One agent's answer to one hypothesis. Kept as an audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisoryResult {
    pub agent: String,
    pub decision: Decision,
    /// 0.0 to 1.0
    pub confidence: f64,
    pub reasoning: String,
    pub latency_ms: u64,
    /// Unparsed response text, empty when the agent failed
    #[serde(default)]
    pub raw_response: String,
    pub timestamp: DateTime<Utc>,
}

impl AdvisoryResult {
    /// Result recorded for an agent that errored or timed out.
    pub fn failed(agent: impl Into<String>, reason: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            agent: agent.into(),
            decision: Decision::Pending,
            confidence: 0.0,
            reasoning: reason.into(),
            latency_ms,
            raw_response: String::new(),
            timestamp: Utc::now(),
        }
    }
}
