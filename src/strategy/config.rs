//! Strategy configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Market regime used to parameterize the grid. Chosen by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    #[default]
    Sideways,
    Trending,
}

impl Regime {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "sideways" | "range" | "ranging" => Some(Regime::Sideways),
            "trending" | "trend" => Some(Regime::Trending),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Sideways => "sideways",
            Regime::Trending => "trending",
        }
    }

    /// Allowed spacing between adjacent levels, as fractions.
    pub fn spacing_range(&self) -> (Decimal, Decimal) {
        match self {
            Regime::Sideways => (dec!(0.01), dec!(0.03)),
            Regime::Trending => (dec!(0.02), dec!(0.05)),
        }
    }

    /// Allowed total ladder width (spacing x levels), as fractions.
    pub fn width_range(&self) -> (Decimal, Decimal) {
        match self {
            Regime::Sideways => (dec!(0.15), dec!(0.25)),
            Regime::Trending => (dec!(0.25), dec!(0.40)),
        }
    }

    pub fn default_spacing(&self) -> Decimal {
        let (lo, hi) = self.spacing_range();
        (lo + hi) / Decimal::TWO
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// DCA grid strategy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    // === Exit Rules ===
    /// Close when P&L reaches this percentage (1.0 = 1%)
    pub profit_target_pct: Decimal,

    /// Close when P&L falls to this percentage (negative)
    pub stop_loss_pct: Decimal,

    /// Close positions older than this
    pub max_duration_hours: i64,

    // === Entry Rules ===
    /// Open new positions until this many pairs are held
    pub min_pairs: usize,

    /// Quote currencies a pair must trade against to be eligible
    pub quote_currencies: Vec<String>,

    /// Entry size as a percentage of free quote balance
    pub position_size_pct: Decimal,

    /// Smallest order value, in quote currency
    pub min_notional: Decimal,

    pub rsi_min: f64,
    pub rsi_max: f64,
    pub fear_greed_min: u32,
    pub fear_greed_max: u32,

    /// Current volume must be at least this fraction of its trailing average
    pub min_volume_ratio: f64,

    // === Grid ===
    pub regime: Regime,

    /// Total levels across both sides
    pub grid_levels: u32,

    // === Loop ===
    pub interval_secs: u64,
    pub timeframe: String,
    pub candle_limit: u32,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            profit_target_pct: dec!(1.0),
            stop_loss_pct: dec!(-3.0),
            max_duration_hours: 72,

            min_pairs: 3,
            quote_currencies: vec!["USDT".into(), "USDC".into(), "DAI".into()],
            position_size_pct: dec!(1.0),
            min_notional: dec!(10),
            rsi_min: 30.0,
            rsi_max: 70.0,
            fear_greed_min: 20,
            fear_greed_max: 80,
            min_volume_ratio: 0.5,

            regime: Regime::Sideways,
            grid_levels: 10,

            interval_secs: 60,
            timeframe: "1h".to_string(),
            candle_limit: 200,
        }
    }
}

impl StrategyConfig {
    pub fn accepts_quote(&self, quote: &str) -> bool {
        self.quote_currencies.iter().any(|q| q.eq_ignore_ascii_case(quote))
    }
}
