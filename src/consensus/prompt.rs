//! Hypothesis prompt and free-text response parsing.

use crate::models::{Decision, TradeHypothesis};

pub const SYSTEM_PROMPT: &str = "You are an expert cryptocurrency trader and analyst. \
Analyze the provided trading scenario and respond with YES or NO followed by a brief justification.";

const MAX_REASONING_CHARS: usize = 200;

fn opt(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) => format!("{:.*}", precision, v),
        None => "N/A".to_string(),
    }
}

pub fn build_prompt(h: &TradeHypothesis) -> String {
    let ind = &h.indicators;
    let news = h
        .sentiment
        .news_score
        .map(|s| format!("{:.2}", s))
        .unwrap_or_else(|| "N/A".to_string());

    format!(
        "Trading Analysis Request:\n\
         Pair: {pair}\n\
         Side: {side}\n\
         Size: {size}\n\
         \n\
         Technical Indicators:\n\
         - RSI: {rsi}\n\
         - MACD: {macd}\n\
         - Volume: {volume}\n\
         - ATR: {atr}\n\
         - ADX: {adx}\n\
         \n\
         Market Sentiment:\n\
         - Fear & Greed Index: {fg}\n\
         - News Sentiment: {news}\n\
         - Overall Sentiment: {overall}\n\
         \n\
         Price Information:\n\
         - Current Price: {price}\n\
         - 24h Change: {change}%\n\
         \n\
         Questions to analyze:\n\
         1) Is there any global event or news that could hurt/help this trade?\n\
         2) Does current sentiment (fear/greed) favor this entry?\n\
         3) Do you confirm this order should be executed now?\n\
         \n\
         Respond with YES/NO followed by a 1-line justification.",
        pair = h.pair,
        side = h.side.as_str().to_uppercase(),
        size = h.quantity,
        rsi = opt(ind.rsi, 2),
        macd = opt(ind.macd, 4),
        volume = opt(ind.volume, 2),
        atr = opt(ind.atr, 4),
        adx = opt(ind.adx, 2),
        fg = h.sentiment.fear_greed_index,
        news = news,
        overall = h.sentiment.classification.as_str(),
        price = h.price,
        change = h.change_24h_pct,
    )
}

/// Parsed advisory answer.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReply {
    pub decision: Decision,
    pub confidence: f64,
    pub reasoning: String,
}

/// Read a YES/NO answer. Anything else is pending.
pub fn parse_response(content: &str) -> ParsedReply {
    let trimmed = content.trim();
    let upper = trimmed.to_uppercase();

    let decision = if upper.starts_with("YES") {
        Decision::Approve
    } else if upper.starts_with("NO") {
        Decision::Deny
    } else {
        Decision::Pending
    };

    let confidence = if upper.contains("HIGH CONFIDENCE") || upper.contains("STRONG") {
        0.9
    } else if upper.contains("MODERATE") || upper.contains("MEDIUM") {
        0.7
    } else if upper.contains("LOW") || upper.contains("WEAK") {
        0.3
    } else {
        0.5
    };

    let mut lines = trimmed.lines().map(str::trim).filter(|l| !l.is_empty());
    let first = lines.next().unwrap_or_default();
    let reasoning = lines.next().unwrap_or(first);

    ParsedReply {
        decision,
        confidence,
        reasoning: reasoning.chars().take(MAX_REASONING_CHARS).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IndicatorSnapshot, SentimentSnapshot, Side};
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_decisions() {
        assert_eq!(parse_response("YES - momentum intact").decision, Decision::Approve);
        assert_eq!(parse_response("  no, macro risk").decision, Decision::Deny);
        assert_eq!(parse_response("Maybe later").decision, Decision::Pending);
        assert_eq!(parse_response("").decision, Decision::Pending);
    }

    #[test]
    fn test_parse_confidence_keywords() {
        assert_eq!(parse_response("YES with high confidence").confidence, 0.9);
        assert_eq!(parse_response("YES, strong setup").confidence, 0.9);
        assert_eq!(parse_response("NO, moderate risk").confidence, 0.7);
        assert_eq!(parse_response("YES but weak volume").confidence, 0.3);
        assert_eq!(parse_response("YES").confidence, 0.5);
    }

    #[test]
    fn test_reasoning_prefers_second_line() {
        let parsed = parse_response("YES\nFunding neutral, no event risk today.");
        assert_eq!(parsed.reasoning, "Funding neutral, no event risk today.");

        let single = parse_response("NO - exchange outage reported");
        assert_eq!(single.reasoning, "NO - exchange outage reported");
    }

    #[test]
    fn test_prompt_contents() {
        let indicators = IndicatorSnapshot {
            rsi: Some(42.5),
            ..Default::default()
        };
        let h = TradeHypothesis::new(
            "BTC/USDT",
            Side::Buy,
            dec!(0.002),
            dec!(50000),
            indicators,
            SentimentSnapshot::neutral(),
        );
        let prompt = build_prompt(&h);
        assert!(prompt.contains("Pair: BTC/USDT"));
        assert!(prompt.contains("Side: BUY"));
        assert!(prompt.contains("- RSI: 42.50"));
        assert!(prompt.contains("- MACD: N/A"));
        assert!(prompt.contains("- Fear & Greed Index: 50"));
        assert!(prompt.ends_with("Respond with YES/NO followed by a 1-line justification."));
    }
}
