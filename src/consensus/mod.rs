//! Advisory consensus: fan a hypothesis out to every agent and reduce the answers.

mod agent;
mod prompt;

use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use futures::future::join_all;
use reqwest::Client;
use tracing::{info, warn};

use crate::models::{AdvisoryResult, Decision, TradeHypothesis};

pub use agent::AdvisoryAgent;

/// Share of respondents needed to approve or deny.
pub const CONSENSUS_THRESHOLD: f64 = 0.6;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome for one hypothesis with its audit trail.
#[derive(Debug, Clone)]
pub struct Consensus {
    pub hypothesis_id: String,
    pub decision: Decision,
    pub approvals: usize,
    pub denials: usize,
    pub results: Vec<AdvisoryResult>,
}

impl Consensus {
    pub fn approved(&self) -> bool {
        self.decision == Decision::Approve
    }

    /// Names of the agents that answered.
    pub fn agents(&self) -> Vec<String> {
        self.results.iter().map(|r| r.agent.clone()).collect()
    }
}

/// Reduce agent decisions: approve if `A/T >= 0.6`, deny if `D/T >= 0.6`, else pending.
pub fn reduce(results: &[AdvisoryResult]) -> Decision {
    let total = results.len();
    if total == 0 {
        return Decision::Pending;
    }
    let approvals = results.iter().filter(|r| r.decision == Decision::Approve).count();
    let denials = results.iter().filter(|r| r.decision == Decision::Deny).count();

    if approvals as f64 / total as f64 >= CONSENSUS_THRESHOLD {
        Decision::Approve
    } else if denials as f64 / total as f64 >= CONSENSUS_THRESHOLD {
        Decision::Deny
    } else {
        Decision::Pending
    }
}

pub struct ConsensusValidator {
    agents: Vec<AdvisoryAgent>,
    client: Client,
}

impl ConsensusValidator {
    pub fn new(agents: Vec<AdvisoryAgent>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { agents, client })
    }

    pub fn agent_names(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.name().to_string()).collect()
    }

    /// Query every agent concurrently, each under its own timeout.
    ///
    /// A failing agent becomes a pending result with zero confidence.
    pub async fn validate(&self, hypothesis: &TradeHypothesis) -> Consensus {
        let results = join_all(self.agents.iter().map(|agent| self.consult(agent, hypothesis))).await;

        let decision = reduce(&results);
        let approvals = results.iter().filter(|r| r.decision == Decision::Approve).count();
        let denials = results.iter().filter(|r| r.decision == Decision::Deny).count();

        info!(
            pair = %hypothesis.pair,
            hypothesis = %hypothesis.id,
            approvals = approvals,
            denials = denials,
            total = results.len(),
            decision = %decision,
            "Advisory consensus"
        );

        Consensus {
            hypothesis_id: hypothesis.id.clone(),
            decision,
            approvals,
            denials,
            results,
        }
    }

    async fn consult(&self, agent: &AdvisoryAgent, hypothesis: &TradeHypothesis) -> AdvisoryResult {
        let started = Instant::now();
        let outcome = tokio::time::timeout(agent.timeout(), agent.ask(&self.client, hypothesis)).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(reply)) => AdvisoryResult {
                agent: agent.name().to_string(),
                decision: reply.decision,
                confidence: reply.confidence,
                reasoning: reply.reasoning,
                latency_ms,
                raw_response: reply.raw,
                timestamp: Utc::now(),
            },
            Ok(Err(e)) => {
                warn!(agent = %agent.name(), error = %e, "Advisory agent failed");
                AdvisoryResult::failed(agent.name(), e.to_string(), latency_ms)
            }
            Err(_) => {
                warn!(agent = %agent.name(), timeout_ms = agent.timeout().as_millis() as u64, "Advisory agent timed out");
                AdvisoryResult::failed(
                    agent.name(),
                    format!("timed out after {:?}", agent.timeout()),
                    latency_ms,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IndicatorSnapshot, SentimentSnapshot, Side};
    use rust_decimal_macros::dec;

    fn result(decision: Decision) -> AdvisoryResult {
        AdvisoryResult {
            agent: "a".into(),
            decision,
            confidence: 0.5,
            reasoning: String::new(),
            latency_ms: 0,
            raw_response: String::new(),
            timestamp: Utc::now(),
        }
    }

    fn results(approve: usize, deny: usize, pending: usize) -> Vec<AdvisoryResult> {
        std::iter::repeat(Decision::Approve)
            .take(approve)
            .chain(std::iter::repeat(Decision::Deny).take(deny))
            .chain(std::iter::repeat(Decision::Pending).take(pending))
            .map(result)
            .collect()
    }

    fn scripted(name: &str, reply: Result<&str, &str>, delay_ms: u64) -> AdvisoryAgent {
        AdvisoryAgent::Scripted {
            name: name.to_string(),
            reply: reply.map(str::to_string).map_err(str::to_string),
            delay: Duration::from_millis(delay_ms),
        }
    }

    fn hypothesis() -> TradeHypothesis {
        TradeHypothesis::new(
            "BTC/USDT",
            Side::Buy,
            dec!(0.002),
            dec!(50000),
            IndicatorSnapshot::default(),
            SentimentSnapshot::neutral(),
        )
    }

    #[test]
    fn test_three_of_five_approves() {
        assert_eq!(reduce(&results(3, 1, 1)), Decision::Approve);
    }

    #[test]
    fn test_three_of_five_denies() {
        assert_eq!(reduce(&results(2, 3, 0)), Decision::Deny);
    }

    #[test]
    fn test_split_vote_is_pending() {
        assert_eq!(reduce(&results(2, 2, 1)), Decision::Pending);
        assert_eq!(reduce(&[]), Decision::Pending);
    }

    #[tokio::test]
    async fn test_failures_and_timeouts_become_pending() {
        let validator = ConsensusValidator::new(vec![
            scripted("gpt", Ok("YES\nclean setup"), 0),
            scripted("pplx", Ok("YES, strong demand"), 0),
            scripted("claude", Ok("YES"), 0),
            scripted("broken", Err("HTTP 500"), 0),
            scripted("slow", Ok("NO"), 1_000),
        ])
        .unwrap();

        let consensus = validator.validate(&hypothesis()).await;
        assert_eq!(consensus.results.len(), 5);
        assert_eq!(consensus.decision, Decision::Approve);
        assert!(consensus.approved());

        let broken = consensus.results.iter().find(|r| r.agent == "broken").unwrap();
        assert_eq!(broken.decision, Decision::Pending);
        assert_eq!(broken.confidence, 0.0);
        assert!(broken.reasoning.contains("HTTP 500"));

        let slow = consensus.results.iter().find(|r| r.agent == "slow").unwrap();
        assert_eq!(slow.decision, Decision::Pending);
        assert!(slow.reasoning.contains("timed out"));
    }

    #[tokio::test]
    async fn test_pending_consensus_blocks() {
        let validator = ConsensusValidator::new(vec![
            scripted("a", Ok("YES"), 0),
            scripted("b", Ok("NO"), 0),
            scripted("c", Ok("unsure"), 0),
        ])
        .unwrap();

        let consensus = validator.validate(&hypothesis()).await;
        assert_eq!(consensus.decision, Decision::Pending);
        assert!(!consensus.approved());
        assert_eq!(consensus.agents(), vec!["a", "b", "c"]);
    }
}
