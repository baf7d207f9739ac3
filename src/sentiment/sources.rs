//! HTTP-backed sentiment sources.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{SentimentSource, SourceKind, SourceReading};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const POSITIVE_KEYWORDS: &[&str] = &[
    "moon",
    "bull",
    "buy",
    "pump",
    "rally",
    "surge",
    "breakout",
    "adoption",
    "institutional",
];

const NEGATIVE_KEYWORDS: &[&str] = &[
    "manipulation",
    "crash",
    "dump",
    "scam",
    "hack",
    "bear",
    "fear",
    "panic",
    "sell",
    "drop",
];

/// Keyword score of one text in [-1, 1]: `(positive - negative) / words * 10`.
pub fn score_text(text: &str) -> f64 {
    let words = text.split_whitespace().count();
    if words == 0 {
        return 0.0;
    }
    let lower = text.to_lowercase();
    let count = |keywords: &[&str]| -> usize {
        keywords.iter().map(|k| lower.matches(k).count()).sum()
    };
    let positive = count(POSITIVE_KEYWORDS) as f64;
    let negative = count(NEGATIVE_KEYWORDS) as f64;
    ((positive - negative) / words as f64 * 10.0).clamp(-1.0, 1.0)
}

fn http_client() -> Result<Client> {
    Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")
}

#[derive(Debug, Deserialize)]
struct FearGreedResponse {
    data: Vec<FearGreedEntry>,
}

#[derive(Debug, Deserialize)]
struct FearGreedEntry {
    value: String,
    #[serde(default)]
    value_classification: String,
}

/// Crypto fear and greed index (alternative.me format).
pub struct FearGreedSource {
    client: Client,
    url: String,
}

impl FearGreedSource {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            url: url.into(),
        })
    }
}

/// Map an index value (0..=100) to a score in [-1, 1].
pub fn fear_greed_score(index: u32) -> f64 {
    ((index.min(100) as f64) - 50.0) / 50.0
}

#[async_trait]
impl SentimentSource for FearGreedSource {
    fn kind(&self) -> SourceKind {
        SourceKind::FearGreed
    }

    async fn fetch(&self) -> Result<SourceReading> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("Failed to fetch fear/greed index")?;

        if !response.status().is_success() {
            anyhow::bail!("Fear/greed request failed: {}", response.status());
        }

        let body: FearGreedResponse = response
            .json()
            .await
            .context("Failed to parse fear/greed response")?;
        let latest = body.data.first().context("Fear/greed response has no data")?;
        let index: u32 = latest
            .value
            .trim()
            .parse()
            .with_context(|| format!("Invalid fear/greed value '{}'", latest.value))?;

        debug!(index = index, classification = %latest.value_classification, "Fear/greed index");
        Ok(SourceReading {
            kind: SourceKind::FearGreed,
            score: fear_greed_score(index),
            confidence: 0.8,
            fear_greed_index: Some(index.min(100)),
        })
    }
}

#[derive(Debug, Deserialize)]
struct Headline {
    title: String,
    #[serde(default)]
    summary: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HeadlineFeed {
    List(Vec<Headline>),
    Wrapped { items: Vec<Headline> },
}

impl HeadlineFeed {
    fn into_items(self) -> Vec<Headline> {
        match self {
            HeadlineFeed::List(items) => items,
            HeadlineFeed::Wrapped { items } => items,
        }
    }
}

/// News or social feed returning JSON headlines, scored by keyword counts.
pub struct HeadlineSource {
    client: Client,
    url: String,
    kind: SourceKind,
}

impl HeadlineSource {
    pub fn news(url: impl Into<String>) -> Result<Self> {
        Self::new(url, SourceKind::News)
    }

    pub fn social(url: impl Into<String>) -> Result<Self> {
        Self::new(url, SourceKind::Social)
    }

    fn new(url: impl Into<String>, kind: SourceKind) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            url: url.into(),
            kind,
        })
    }
}

/// Average keyword score over headlines, with confidence growing with the sample.
fn score_headlines(items: &[Headline]) -> Option<(f64, f64)> {
    if items.is_empty() {
        return None;
    }
    let total: f64 = items
        .iter()
        .map(|h| score_text(&format!("{} {}", h.title, h.summary)))
        .sum();
    let confidence = (items.len() as f64 / 20.0).min(1.0);
    Some((total / items.len() as f64, confidence))
}

#[async_trait]
impl SentimentSource for HeadlineSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch(&self) -> Result<SourceReading> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {} feed", self.kind.as_str()))?;

        if !response.status().is_success() {
            anyhow::bail!("{} feed request failed: {}", self.kind.as_str(), response.status());
        }

        let feed: HeadlineFeed = response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} feed", self.kind.as_str()))?;
        let items = feed.into_items();
        let (score, confidence) = score_headlines(&items)
            .with_context(|| format!("{} feed returned no headlines", self.kind.as_str()))?;

        debug!(source = self.kind.as_str(), headlines = items.len(), score = score, "Headline sentiment");
        Ok(SourceReading {
            kind: self.kind,
            score,
            confidence,
            fear_greed_index: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_scoring() {
        assert_eq!(score_text(""), 0.0);
        // 1 positive in 10 words -> 1.0
        assert_eq!(score_text("bitcoin rally continues as markets open higher on strong demand"), 1.0);
        assert_eq!(score_text("exchange hack triggers panic"), -1.0);
        assert_eq!(score_text("quiet session for majors"), 0.0);
    }

    #[test]
    fn test_fear_greed_mapping() {
        assert_eq!(fear_greed_score(50), 0.0);
        assert_eq!(fear_greed_score(100), 1.0);
        assert_eq!(fear_greed_score(0), -1.0);
        assert_eq!(fear_greed_score(75), 0.5);
    }

    #[test]
    fn test_headline_feed_shapes() {
        let list: HeadlineFeed =
            serde_json::from_str(r#"[{"title": "ETF adoption surge"}]"#).unwrap();
        assert_eq!(list.into_items().len(), 1);

        let wrapped: HeadlineFeed = serde_json::from_str(
            r#"{"items": [{"title": "a", "summary": "b"}, {"title": "c"}]}"#,
        )
        .unwrap();
        let items = wrapped.into_items();
        assert_eq!(items.len(), 2);

        let (score, confidence) = score_headlines(&items).unwrap();
        assert_eq!(score, 0.0);
        assert_eq!(confidence, 0.1);
        assert!(score_headlines(&[]).is_none());
    }

    #[test]
    fn test_fear_greed_payload() {
        let body: FearGreedResponse = serde_json::from_str(
            r#"{"name":"Fear and Greed Index","data":[{"value":"27","value_classification":"Fear","timestamp":"1700000000"}]}"#,
        )
        .unwrap();
        assert_eq!(body.data[0].value, "27");
        assert_eq!(body.data[0].value_classification, "Fear");
    }
}
