//! Advisory agents, one variant per vendor.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::{AgentConfig, AgentKind};
use crate::error::{TradingError, TradingResult};
use crate::models::{Decision, TradeHypothesis};

use super::prompt::{build_prompt, parse_response, ParsedReply, SYSTEM_PROMPT};

const MAX_TOKENS: u32 = 200;
const TEMPERATURE: f64 = 0.1;
const ANTHROPIC_VERSION: &str = "2023-06-01";
const RULES_TIMEOUT: Duration = Duration::from_secs(1);

/// Answer from one agent before it becomes an audit record.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub decision: Decision,
    pub confidence: f64,
    pub reasoning: String,
    pub raw: String,
}

impl AgentReply {
    fn from_text(raw: String) -> Self {
        let ParsedReply {
            decision,
            confidence,
            reasoning,
        } = parse_response(&raw);
        Self {
            decision,
            confidence,
            reasoning,
            raw,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

/// A configured advisory agent.
#[derive(Debug, Clone)]
pub enum AdvisoryAgent {
    /// OpenAI chat completions
    OpenAi(AgentConfig),
    /// Perplexity chat completions (OpenAI-compatible shape)
    Perplexity(AgentConfig),
    /// Anthropic messages API
    Anthropic(AgentConfig),
    /// Local RSI rules, no network
    Rules { name: String },
    /// Fixed reply after a delay
    #[cfg(test)]
    Scripted {
        name: String,
        reply: Result<String, String>,
        delay: Duration,
    },
}

impl AdvisoryAgent {
    pub fn from_config(config: AgentConfig) -> Self {
        match config.kind {
            AgentKind::OpenAi => AdvisoryAgent::OpenAi(config),
            AgentKind::Perplexity => AdvisoryAgent::Perplexity(config),
            AgentKind::Anthropic => AdvisoryAgent::Anthropic(config),
            AgentKind::Rules => AdvisoryAgent::Rules { name: config.name },
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AdvisoryAgent::OpenAi(c) | AdvisoryAgent::Perplexity(c) | AdvisoryAgent::Anthropic(c) => {
                &c.name
            }
            AdvisoryAgent::Rules { name } => name,
            #[cfg(test)]
            AdvisoryAgent::Scripted { name, .. } => name,
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            AdvisoryAgent::OpenAi(c) | AdvisoryAgent::Perplexity(c) | AdvisoryAgent::Anthropic(c) => {
                c.timeout()
            }
            AdvisoryAgent::Rules { .. } => RULES_TIMEOUT,
            #[cfg(test)]
            AdvisoryAgent::Scripted { .. } => Duration::from_millis(200),
        }
    }

    /// Ask the agent about one hypothesis.
    pub async fn ask(&self, client: &Client, hypothesis: &TradeHypothesis) -> TradingResult<AgentReply> {
        match self {
            AdvisoryAgent::OpenAi(config) | AdvisoryAgent::Perplexity(config) => {
                let text = chat_completion(client, config, &build_prompt(hypothesis)).await?;
                Ok(AgentReply::from_text(text))
            }
            AdvisoryAgent::Anthropic(config) => {
                let text = anthropic_message(client, config, &build_prompt(hypothesis)).await?;
                Ok(AgentReply::from_text(text))
            }
            AdvisoryAgent::Rules { .. } => Ok(rules_reply(hypothesis)),
            #[cfg(test)]
            AdvisoryAgent::Scripted { reply, delay, .. } => {
                tokio::time::sleep(*delay).await;
                match reply {
                    Ok(text) => Ok(AgentReply::from_text(text.clone())),
                    Err(e) => Err(TradingError::Advisory(e.clone())),
                }
            }
        }
    }
}

fn api_key(config: &AgentConfig) -> TradingResult<&str> {
    config
        .api_key
        .as_deref()
        .ok_or_else(|| TradingError::Advisory(format!("{}: API key not configured", config.name)))
}

async fn post_json<T: serde::de::DeserializeOwned>(
    request: reqwest::RequestBuilder,
    config: &AgentConfig,
) -> TradingResult<T> {
    let response = request
        .send()
        .await
        .map_err(|e| TradingError::Advisory(format!("{} request failed: {}", config.name, e)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TradingError::Advisory(format!(
            "{} request failed: {} - {}",
            config.name, status, body
        )));
    }

    response
        .json()
        .await
        .map_err(|e| TradingError::Advisory(format!("Failed to parse {} response: {}", config.name, e)))
}

async fn chat_completion(client: &Client, config: &AgentConfig, prompt: &str) -> TradingResult<String> {
    let payload = json!({
        "model": config.model,
        "messages": [
            { "role": "system", "content": SYSTEM_PROMPT },
            { "role": "user", "content": prompt },
        ],
        "max_tokens": MAX_TOKENS,
        "temperature": TEMPERATURE,
    });

    debug!(agent = %config.name, model = %config.model, "Querying chat completion agent");
    let request = client
        .post(&config.endpoint)
        .bearer_auth(api_key(config)?)
        .json(&payload);
    let response: ChatResponse = post_json(request, config).await?;

    response
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .ok_or_else(|| TradingError::Advisory(format!("{}: empty response", config.name)))
}

async fn anthropic_message(client: &Client, config: &AgentConfig, prompt: &str) -> TradingResult<String> {
    let payload = json!({
        "model": config.model,
        "max_tokens": MAX_TOKENS,
        "temperature": TEMPERATURE,
        "system": SYSTEM_PROMPT,
        "messages": [{ "role": "user", "content": prompt }],
    });

    debug!(agent = %config.name, model = %config.model, "Querying messages agent");
    let request = client
        .post(&config.endpoint)
        .header("x-api-key", api_key(config)?)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .json(&payload);
    let response: MessagesResponse = post_json(request, config).await?;

    let text: String = response.content.into_iter().map(|b| b.text).collect();
    if text.trim().is_empty() {
        return Err(TradingError::Advisory(format!("{}: empty response", config.name)));
    }
    Ok(text)
}

/// RSI rules: overbought denies, oversold approves, otherwise a moderate approve.
fn rules_reply(h: &TradeHypothesis) -> AgentReply {
    let (decision, confidence, reasoning) = match h.indicators.rsi {
        Some(rsi) if rsi > 70.0 => (Decision::Deny, 0.8, "RSI indicates overbought conditions"),
        Some(rsi) if rsi < 30.0 => (
            Decision::Approve,
            0.8,
            "RSI indicates oversold, good buying opportunity",
        ),
        _ => (
            Decision::Approve,
            0.7,
            "Technical analysis suggests favorable conditions",
        ),
    };
    AgentReply {
        decision,
        confidence,
        reasoning: reasoning.to_string(),
        raw: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IndicatorSnapshot, SentimentSnapshot, Side};
    use rust_decimal_macros::dec;

    fn hypothesis(rsi: Option<f64>) -> TradeHypothesis {
        TradeHypothesis::new(
            "ETH/USDT",
            Side::Buy,
            dec!(0.1),
            dec!(3000),
            IndicatorSnapshot {
                rsi,
                ..Default::default()
            },
            SentimentSnapshot::neutral(),
        )
    }

    #[test]
    fn test_rules_agent() {
        let over = rules_reply(&hypothesis(Some(75.0)));
        assert_eq!(over.decision, Decision::Deny);
        assert_eq!(over.confidence, 0.8);

        let under = rules_reply(&hypothesis(Some(25.0)));
        assert_eq!(under.decision, Decision::Approve);
        assert_eq!(under.confidence, 0.8);

        let mid = rules_reply(&hypothesis(None));
        assert_eq!(mid.decision, Decision::Approve);
        assert_eq!(mid.confidence, 0.7);
    }

    #[test]
    fn test_agent_from_config() {
        let agent = AdvisoryAgent::from_config(AgentConfig::new(AgentKind::Anthropic, Some("k".into())));
        assert!(matches!(agent, AdvisoryAgent::Anthropic(_)));
        assert_eq!(agent.name(), "anthropic");
        assert_eq!(agent.timeout(), Duration::from_secs(30));

        let rules = AdvisoryAgent::from_config(AgentConfig::new(AgentKind::Rules, None));
        assert_eq!(rules.name(), "rules");
    }

    #[tokio::test]
    async fn test_missing_key_is_advisory_error() {
        let agent = AdvisoryAgent::from_config(AgentConfig::new(AgentKind::OpenAi, None));
        let client = Client::new();
        let err = agent.ask(&client, &hypothesis(Some(50.0))).await.unwrap_err();
        assert!(matches!(err, TradingError::Advisory(_)));
    }

    #[test]
    fn test_response_shapes() {
        let chat: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"YES\nlooks fine"}}]}"#,
        )
        .unwrap();
        assert_eq!(chat.choices[0].message.content, "YES\nlooks fine");

        let msg: MessagesResponse =
            serde_json::from_str(r#"{"content":[{"type":"text","text":"NO - event risk"}]}"#).unwrap();
        assert_eq!(msg.content[0].text, "NO - event risk");
    }
}
