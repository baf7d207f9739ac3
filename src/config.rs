//! Runtime configuration loaded from the environment (and `.env` via dotenvy).

use std::time::Duration;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Connection settings for one exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Exchange id, e.g. `binance`
    pub id: String,

    /// Base URL of the exchange REST bridge
    pub api_url: String,

    #[serde(skip_serializing)]
    pub api_key: String,

    #[serde(skip_serializing)]
    pub api_secret: String,

    #[serde(skip_serializing)]
    pub passphrase: Option<String>,

    pub testnet: bool,

    /// Minimum delay between two requests to this exchange
    pub rate_limit_ms: u64,

    /// Smallest order value the exchange accepts (quote currency)
    pub min_notional: Decimal,

    /// Attempts per call before a transient error is surfaced
    pub max_retries: u32,

    /// First backoff delay between attempts of one call
    pub retry_base_delay_ms: u64,

    /// Reconnect attempts before the connector is marked failed
    pub max_reconnect_attempts: u32,

    /// Base of the exponential reconnect delay
    pub reconnect_base_delay_ms: u64,
}

impl ExchangeConfig {
    pub fn new(id: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            api_url: api_url.into(),
            api_key: String::new(),
            api_secret: String::new(),
            passphrase: None,
            testnet: false,
            rate_limit_ms: 1000,
            min_notional: dec!(10),
            max_retries: 3,
            retry_base_delay_ms: 500,
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 1000,
        }
    }

    /// Read `{ID}_API_URL`, `{ID}_API_KEY`, ... for the given exchange id.
    pub fn from_env(id: &str) -> Result<Self> {
        let prefix = id.to_uppercase();
        let var = |suffix: &str| std::env::var(format!("{}_{}", prefix, suffix));

        let api_url = var("API_URL").with_context(|| format!("{}_API_URL not set", prefix))?;
        let api_key = var("API_KEY").with_context(|| format!("{}_API_KEY not set", prefix))?;
        let api_secret =
            var("API_SECRET").with_context(|| format!("{}_API_SECRET not set", prefix))?;

        let mut config = Self::new(id, api_url);
        config.api_key = api_key;
        config.api_secret = api_secret;
        config.passphrase = var("API_PASSPHRASE").ok();
        config.testnet = var("TESTNET")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        config.rate_limit_ms = env_parse(&format!("{}_RATE_LIMIT_MS", prefix), 1000);
        config.min_notional = env_parse(&format!("{}_MIN_NOTIONAL", prefix), dec!(10));
        Ok(config)
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_millis(self.rate_limit_ms)
    }
}

/// Advisory agent vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    OpenAi,
    Perplexity,
    Anthropic,
    /// Local indicator rules, no network
    Rules,
}

impl AgentKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" | "gpt" => Some(AgentKind::OpenAi),
            "perplexity" => Some(AgentKind::Perplexity),
            "claude" | "anthropic" => Some(AgentKind::Anthropic),
            "rules" | "copilot" | "local" => Some(AgentKind::Rules),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::OpenAi => "openai",
            AgentKind::Perplexity => "perplexity",
            AgentKind::Anthropic => "anthropic",
            AgentKind::Rules => "rules",
        }
    }

    fn key_var(&self) -> Option<&'static str> {
        match self {
            AgentKind::OpenAi => Some("OPENAI_API_KEY"),
            AgentKind::Perplexity => Some("PERPLEXITY_API_KEY"),
            AgentKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            AgentKind::Rules => None,
        }
    }

    fn default_model(&self) -> &'static str {
        match self {
            AgentKind::OpenAi => "gpt-4o",
            AgentKind::Perplexity => "sonar-medium-online",
            AgentKind::Anthropic => "claude-3-5-sonnet-20241022",
            AgentKind::Rules => "rsi-rules",
        }
    }

    fn default_endpoint(&self) -> &'static str {
        match self {
            AgentKind::OpenAi => "https://api.openai.com/v1/chat/completions",
            AgentKind::Perplexity => "https://api.perplexity.ai/chat/completions",
            AgentKind::Anthropic => "https://api.anthropic.com/v1/messages",
            AgentKind::Rules => "",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for one advisory agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub kind: AgentKind,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl AgentConfig {
    pub fn new(kind: AgentKind, api_key: Option<String>) -> Self {
        Self {
            name: kind.as_str().to_string(),
            kind,
            api_key,
            model: kind.default_model().to_string(),
            endpoint: kind.default_endpoint().to_string(),
            timeout_secs: 30,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Endpoints for the sentiment sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentConfig {
    pub fear_greed_url: String,
    /// JSON headline feed for news sentiment
    pub news_url: Option<String>,
    /// JSON headline feed for social sentiment
    pub social_url: Option<String>,
    pub cache_minutes: i64,
}

impl Default for SentimentConfig {
    fn default() -> Self {
        Self {
            fear_greed_url: "https://api.alternative.me/fng/".to_string(),
            news_url: None,
            social_url: None,
            cache_minutes: 15,
        }
    }
}

/// Everything the controller needs from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub exchanges: Vec<ExchangeConfig>,
    pub agents: Vec<AgentConfig>,
    pub sentiment: SentimentConfig,
    pub pairs: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let exchange_ids = env_list("EXCHANGES");
        if exchange_ids.is_empty() {
            bail!("EXCHANGES not set (comma-separated exchange ids)");
        }
        let exchanges = exchange_ids
            .iter()
            .map(|id| ExchangeConfig::from_env(id))
            .collect::<Result<Vec<_>>>()?;

        let mut agents = Vec::new();
        let agent_names = {
            let names = env_list("ADVISORY_AGENTS");
            if names.is_empty() {
                vec!["rules".to_string()]
            } else {
                names
            }
        };
        for name in agent_names {
            let Some(kind) = AgentKind::parse(&name) else {
                bail!("Unknown advisory agent '{}'", name);
            };
            let api_key = kind.key_var().and_then(|v| std::env::var(v).ok());
            if kind.key_var().is_some() && api_key.is_none() {
                warn!(agent = %kind, "API key missing, agent disabled");
                continue;
            }
            let mut agent = AgentConfig::new(kind, api_key);
            if let Ok(model) = std::env::var(format!("{}_MODEL", kind.as_str().to_uppercase())) {
                agent.model = model;
            }
            agent.timeout_secs = env_parse("ADVISORY_TIMEOUT_SECS", 30);
            agents.push(agent);
        }

        let mut sentiment = SentimentConfig::default();
        if let Ok(url) = std::env::var("FEAR_GREED_URL") {
            sentiment.fear_greed_url = url;
        }
        sentiment.news_url = std::env::var("NEWS_FEED_URL").ok();
        sentiment.social_url = std::env::var("SOCIAL_FEED_URL").ok();

        let pairs = {
            let pairs = env_list("TRADING_PAIRS");
            if pairs.is_empty() {
                default_pairs()
            } else {
                pairs
            }
        };

        Ok(Self {
            exchanges,
            agents,
            sentiment,
            pairs,
        })
    }
}

pub fn default_pairs() -> Vec<String> {
    ["BTC/USDT", "ETH/USDT", "SOL/USDT", "BNB/USDT", "XRP/USDT"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_kind_aliases() {
        assert_eq!(AgentKind::parse("Claude"), Some(AgentKind::Anthropic));
        assert_eq!(AgentKind::parse("copilot"), Some(AgentKind::Rules));
        assert_eq!(AgentKind::parse(" openai "), Some(AgentKind::OpenAi));
        assert_eq!(AgentKind::parse("bard"), None);
    }

    #[test]
    fn test_agent_defaults() {
        let agent = AgentConfig::new(AgentKind::Perplexity, Some("k".into()));
        assert_eq!(agent.model, "sonar-medium-online");
        assert_eq!(agent.endpoint, "https://api.perplexity.ai/chat/completions");
        assert_eq!(agent.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_exchange_defaults() {
        let config = ExchangeConfig::new("binance", "http://localhost:8080");
        assert_eq!(config.rate_limit(), Duration::from_secs(1));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.min_notional, dec!(10));
    }
}
