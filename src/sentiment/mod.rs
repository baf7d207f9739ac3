//! Market sentiment: independent sources combined into one weighted score.

mod sources;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::indicators::{IndicatorSet, Signal};
use crate::models::{SentimentClass, SentimentSnapshot};

pub use sources::{FearGreedSource, HeadlineSource};

const BULLISH_THRESHOLD: f64 = 0.2;
const BEARISH_THRESHOLD: f64 = -0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    FearGreed,
    News,
    Social,
    Technical,
    OnChain,
}

impl SourceKind {
    /// Fixed aggregation weight. The weights sum to 1.
    pub fn weight(&self) -> f64 {
        match self {
            SourceKind::FearGreed => 0.25,
            SourceKind::News => 0.30,
            SourceKind::Social => 0.20,
            SourceKind::Technical => 0.15,
            SourceKind::OnChain => 0.10,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::FearGreed => "fear_greed",
            SourceKind::News => "news",
            SourceKind::Social => "social",
            SourceKind::Technical => "technical",
            SourceKind::OnChain => "on_chain",
        }
    }
}

/// One resolved signal.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceReading {
    pub kind: SourceKind,
    /// [-1, 1]
    pub score: f64,
    /// [0, 1]
    pub confidence: f64,
    /// Raw index, fear/greed source only
    pub fear_greed_index: Option<u32>,
}

#[async_trait]
pub trait SentimentSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn fetch(&self) -> Result<SourceReading>;
}

/// Technical sentiment from the indicator sets of the tracked pairs:
/// `(buy signals - sell signals) / signals`.
pub fn technical_reading(sets: &[IndicatorSet]) -> Option<SourceReading> {
    let (mut buy, mut sell, mut total) = (0usize, 0usize, 0usize);
    for set in sets {
        let (b, s, t) = set.signal_counts();
        buy += b;
        sell += s;
        total += t;
    }
    if total == 0 {
        return None;
    }
    let directional = sets
        .iter()
        .flat_map(|s| s.readings())
        .filter(|(_, r)| r.signal != Signal::Neutral)
        .count();
    Some(SourceReading {
        kind: SourceKind::Technical,
        score: (buy as f64 - sell as f64) / total as f64,
        confidence: directional as f64 / total as f64,
        fear_greed_index: None,
    })
}

pub fn classify(score: f64) -> SentimentClass {
    if score > BULLISH_THRESHOLD {
        SentimentClass::Bullish
    } else if score < BEARISH_THRESHOLD {
        SentimentClass::Bearish
    } else {
        SentimentClass::Neutral
    }
}

/// Weighted sum over the readings that resolved. Missing sources add nothing.
pub fn combine(readings: &[SourceReading], now: DateTime<Utc>) -> SentimentSnapshot {
    if readings.is_empty() {
        let mut neutral = SentimentSnapshot::neutral();
        neutral.timestamp = now;
        return neutral;
    }

    let score: f64 = readings
        .iter()
        .map(|r| r.kind.weight() * r.score.clamp(-1.0, 1.0))
        .sum();
    let confidence: f64 = readings
        .iter()
        .map(|r| r.kind.weight() * r.confidence.clamp(0.0, 1.0))
        .sum();

    SentimentSnapshot {
        score,
        classification: classify(score),
        fear_greed_index: readings
            .iter()
            .find_map(|r| r.fear_greed_index)
            .unwrap_or(50),
        news_score: readings
            .iter()
            .find(|r| r.kind == SourceKind::News)
            .map(|r| r.score),
        confidence,
        sources: readings.iter().map(|r| r.kind.as_str().to_string()).collect(),
        timestamp: now,
    }
}

/// Fetches every configured source concurrently and caches the combined snapshot.
pub struct SentimentAggregator {
    sources: Vec<Box<dyn SentimentSource>>,
    cache_ttl: Duration,
    cached: Option<SentimentSnapshot>,
}

impl SentimentAggregator {
    pub fn new(sources: Vec<Box<dyn SentimentSource>>, cache_minutes: i64) -> Self {
        Self {
            sources,
            cache_ttl: Duration::minutes(cache_minutes),
            cached: None,
        }
    }

    /// Current snapshot, refreshed when the cache has expired.
    ///
    /// `technical` is folded in as the technical source. Never fails: with
    /// nothing resolved the result is neutral.
    pub async fn refresh(&mut self, technical: Option<SourceReading>) -> SentimentSnapshot {
        self.refresh_at(technical, Utc::now()).await
    }

    pub async fn refresh_at(
        &mut self,
        technical: Option<SourceReading>,
        now: DateTime<Utc>,
    ) -> SentimentSnapshot {
        if let Some(cached) = &self.cached {
            if now - cached.timestamp < self.cache_ttl {
                return cached.clone();
            }
        }

        let results = join_all(self.sources.iter().map(|s| async move { (s.kind(), s.fetch().await) })).await;

        let mut readings = Vec::with_capacity(results.len() + 1);
        for (kind, result) in results {
            match result {
                Ok(reading) => readings.push(reading),
                Err(e) => warn!(source = kind.as_str(), error = %e, "Sentiment source failed"),
            }
        }
        readings.extend(technical);

        let snapshot = combine(&readings, now);
        if readings.is_empty() {
            warn!("No sentiment source resolved, using neutral sentiment");
        } else {
            info!(
                score = snapshot.score,
                classification = snapshot.classification.as_str(),
                fear_greed = snapshot.fear_greed_index,
                sources = readings.len(),
                "Sentiment refreshed"
            );
        }
        debug!(sources = ?snapshot.sources, "Sentiment sources resolved");

        self.cached = Some(snapshot.clone());
        snapshot
    }
}
