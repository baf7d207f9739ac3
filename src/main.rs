//! GridPilot
//!
//! Multi-exchange DCA grid trading controller. Entries are filtered by
//! technical indicators and market sentiment, confirmed by a quorum of
//! advisory agents, and gated by risk limits with a circuit breaker.

mod config;
mod consensus;
mod db;
mod error;
mod exchange;
mod indicators;
mod models;
mod notify;
mod risk;
mod sentiment;
mod strategy;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::{AppConfig, ExchangeConfig};
use crate::consensus::{AdvisoryAgent, ConsensusValidator};
use crate::db::{Database, SETTING_PAUSED, SETTING_RISK_LIMITS, SETTING_STRATEGY};
use crate::exchange::{ExchangeApi, ExchangeGateway, ExchangeRouter, PaperExchange, RestExchange};
use crate::notify::{spawn_alert_forwarder, Notifier};
use crate::risk::{RiskLimits, RiskManager};
use crate::sentiment::{FearGreedSource, HeadlineSource, SentimentAggregator, SentimentSource};
use crate::strategy::{EngineComponents, Regime, StrategyConfig, StrategyEngine};

/// Grid trading controller CLI.
#[derive(Parser)]
#[command(name = "gridpilot")]
#[command(about = "Risk-gated DCA grid trading across exchanges", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "sqlite:./gridpilot.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the trading loop
    Run {
        /// Cycle interval in seconds (overrides the stored setting)
        #[arg(short, long)]
        interval: Option<u64>,

        /// Simulate balances and fills on top of live market data
        #[arg(long)]
        paper: bool,

        /// Grid regime (sideways, trending)
        #[arg(short, long)]
        regime: Option<String>,

        /// Starting portfolio value in quote currency
        #[arg(short, long, default_value = "10000")]
        capital: f64,

        /// Simulated fee per paper fill, as a fraction of notional
        #[arg(long, default_value = "0.001")]
        paper_fee: f64,
    },

    /// Show open grid positions and recent trades
    Status {
        /// Number of recent trades to show
        #[arg(short, long, default_value = "10")]
        trades: i64,
    },

    /// Show effective strategy and risk settings
    Config,

    /// Connect every configured exchange and report its health
    Health,

    /// Try to lift a circuit-breaker suspension
    Resume,

    /// Skip cycles in a running engine until unpaused
    Pause,

    /// Let a paused engine run cycles again
    Unpause,

    /// Re-enable a stored exchange or advisory agent
    Enable {
        /// Exchange id or agent name
        name: String,
    },

    /// Exclude a stored exchange or advisory agent from the next run
    Disable {
        /// Exchange id or agent name
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let db = Database::new(&cli.database).await?;

    match cli.command {
        Commands::Run {
            interval,
            paper,
            regime,
            capital,
            paper_fee,
        } => {
            let mut app = AppConfig::from_env()?;
            let capital = Decimal::try_from(capital).context("Invalid capital")?;
            let paper_fee = Decimal::try_from(paper_fee).context("Invalid paper fee")?;

            let mut strategy = load_or_init(&db, SETTING_STRATEGY, StrategyConfig::default).await?;
            let limits = load_or_init(&db, SETTING_RISK_LIMITS, RiskLimits::default).await?;
            if let Some(secs) = interval {
                strategy.interval_secs = secs;
            }
            if let Some(name) = regime {
                strategy.regime = Regime::parse(&name)
                    .with_context(|| format!("Unknown regime '{}'", name))?;
            }

            db.sync_config(&mut app).await?;

            let router = build_router(&app.exchanges, paper.then_some((capital, paper_fee)))?;
            if router.is_empty() {
                bail!("Every configured exchange is disabled");
            }
            let sentiment = SentimentAggregator::new(
                build_sentiment_sources(&app)?,
                app.sentiment.cache_minutes,
            );
            let consensus = ConsensusValidator::new(
                app.agents.into_iter().map(AdvisoryAgent::from_config).collect(),
            )?;

            let notifier = Notifier::new();
            let _alerts = spawn_alert_forwarder(&notifier, std::env::var("ALERT_WEBHOOK_URL").ok());
            let risk = RiskManager::new(limits, capital).with_notifier(notifier);

            info!(
                capital = %capital,
                paper = paper,
                regime = %strategy.regime,
                interval = strategy.interval_secs,
                exchanges = %router.exchange_ids().join(","),
                agents = %consensus.agent_names().join(","),
                "Starting grid controller"
            );

            println!("\n=== GridPilot ===");
            println!("Capital:     ${}", capital);
            println!("Mode:        {}", if paper { "PAPER (simulated fills)" } else { "LIVE TRADING" });
            println!("Regime:      {}", strategy.regime);
            println!("Interval:    {}s", strategy.interval_secs);
            println!("Pairs:       {}", app.pairs.join(", "));
            println!("Exchanges:   {}", router.exchange_ids().join(", "));
            println!("Agents:      {}", consensus.agent_names().join(", "));
            println!("\nPress Ctrl+C to stop.\n");

            let components = EngineComponents {
                router,
                sentiment,
                consensus,
                risk,
                db,
            };
            let mut engine = StrategyEngine::new(strategy, components, app.pairs, capital);
            engine.initialize().await?;

            if let Err(e) = engine.run().await {
                tracing::error!(error = %e, "Engine error");
            }

            let risk = engine.risk();
            println!("\n=== Session Summary ===");
            println!("Engine State:     {}", engine.state().as_str());
            println!("Daily P&L:        ${:.2}", risk.daily_pnl());
            println!("Risk Level:       {}", risk.risk_level());
            println!("Open Positions:   {}", engine.positions().count());
        }

        Commands::Status { trades } => {
            let positions = db.load_open_positions().await?;
            let breaker = db.load_breaker().await?.unwrap_or_default();
            let history = db.recent_trades(trades).await?;
            let streak = db.consecutive_losing_days().await?;

            println!("\n=== Circuit Breaker ===");
            println!("Suspended:        {}", if breaker.suspended { "Yes" } else { "No" });
            if let Some(reason) = &breaker.reason {
                println!("Reason:           {}", reason);
            }
            if let Some(at) = breaker.suspended_at {
                println!("Since:            {}", at.to_rfc3339());
            }
            println!("Risk Level:       {}", breaker.risk_level);
            println!("Losing Streak:    {} day(s)", streak);

            let paused = db.get_setting(SETTING_PAUSED).await?;
            println!("Engine Paused:    {}", if paused.as_deref() == Some("true") { "Yes" } else { "No" });

            println!("\n=== Configuration ===");
            for exchange in db.load_exchanges().await? {
                println!(
                    "  exchange {:<12} {:<8} {}{} min ${} {}ms",
                    exchange.id,
                    if exchange.is_active { "active" } else { "disabled" },
                    exchange.api_url,
                    if exchange.testnet { " (testnet)" } else { "" },
                    exchange.min_notional,
                    exchange.rate_limit_ms
                );
            }
            for agent in db.load_agents().await? {
                println!(
                    "  agent    {:<12} {:<8} {} {} (priority {})",
                    agent.name,
                    if agent.is_active { "active" } else { "disabled" },
                    agent.kind,
                    if agent.endpoint.is_empty() { agent.model.as_str() } else { agent.endpoint.as_str() },
                    agent.priority
                );
            }

            println!("\n=== Open Positions ({}) ===", positions.len());
            for pos in &positions {
                let filled = pos.levels.iter().filter(|l| l.filled).count();
                println!(
                    "  {:<12} {:<10} {} @ {:.4} -> {:.4} ({:.2}%) levels {}/{} age {}h",
                    pos.pair,
                    pos.exchange_id,
                    pos.total_quantity,
                    pos.average_price,
                    pos.current_price,
                    pos.pnl_pct(),
                    filled,
                    pos.levels.len(),
                    pos.age().num_hours()
                );
            }

            println!("\n=== Recent Trades ===");
            if history.is_empty() {
                println!("  No trades recorded.");
            }
            for trade in &history {
                println!(
                    "  {} {:<12} {:<14} P&L: ${:.2} ({:.2}%)",
                    trade.closed_at,
                    trade.pair,
                    trade.exit_reason,
                    trade.realized_pnl,
                    trade.realized_pnl_pct
                );
            }
        }

        Commands::Config => {
            let strategy: StrategyConfig = db.load_json(SETTING_STRATEGY).await?.unwrap_or_default();
            let limits: RiskLimits = db.load_json(SETTING_RISK_LIMITS).await?.unwrap_or_default();

            println!("\n=== Strategy Configuration ===\n");
            println!("Exit Rules:");
            println!("  Profit Target:        {}%", strategy.profit_target_pct);
            println!("  Stop Loss:            {}%", strategy.stop_loss_pct);
            println!("  Max Duration:         {}h", strategy.max_duration_hours);

            println!("\nEntry Rules:");
            println!("  Min Pairs:            {}", strategy.min_pairs);
            println!("  Quote Currencies:     {}", strategy.quote_currencies.join(", "));
            println!("  Position Size:        {}% of free balance", strategy.position_size_pct);
            println!("  Min Notional:         ${}", strategy.min_notional);
            println!("  RSI Window:           {} - {}", strategy.rsi_min, strategy.rsi_max);
            println!("  Fear/Greed Window:    {} - {}", strategy.fear_greed_min, strategy.fear_greed_max);

            println!("\nGrid:");
            println!("  Regime:               {}", strategy.regime);
            println!("  Levels:               {}", strategy.grid_levels);
            println!("  Interval:             {}s", strategy.interval_secs);

            println!("\n=== Risk Limits ===\n");
            println!("  Max Position Size:    ${}", limits.max_position_size_usd);
            println!("  Max Pair Exposure:    {}%", limits.max_pair_exposure * Decimal::ONE_HUNDRED);
            println!("  Max Portfolio Exp.:   {}%", limits.max_portfolio_exposure * Decimal::ONE_HUNDRED);
            println!("  Max Daily Drawdown:   {}%", limits.max_daily_drawdown * Decimal::ONE_HUNDRED);
            println!("  Max Open Positions:   {}", limits.max_open_positions);
            println!("  Volatility Limit:     {:.0}%", limits.volatility_limit * 100.0);
            println!("  Resume Cooldown:      {}m", limits.resume_cooldown_minutes);
        }

        Commands::Health => {
            let app = AppConfig::from_env()?;
            let router = build_router(&app.exchanges, None)?;
            router.connect_all().await;
            let report = router.health_report().await;

            println!("\n=== Exchange Health: {} ===\n", report.status.as_str());
            for status in &report.exchanges {
                println!(
                    "  {:<12} {:<13} reconnects {} {}",
                    status.exchange_id,
                    status.state.as_str(),
                    status.reconnect_attempts,
                    status.last_error.as_deref().unwrap_or("")
                );
            }
        }

        Commands::Resume => {
            let breaker = db.load_breaker().await?.unwrap_or_default();
            if !breaker.suspended {
                println!("Trading is not suspended.");
                return Ok(());
            }

            let limits: RiskLimits = db.load_json(SETTING_RISK_LIMITS).await?.unwrap_or_default();
            let streak = db.consecutive_losing_days().await?;
            let mut risk = RiskManager::new(limits, Decimal::ZERO);
            risk.restore(breaker, streak, Vec::new());

            if risk.resume_trading() {
                db.save_breaker(risk.breaker()).await?;
                println!("Trading resumed.");
            } else {
                println!(
                    "Resume refused: cooldown not elapsed or risk level {}.",
                    risk.risk_level()
                );
            }
        }

        Commands::Pause => {
            db.set_setting(SETTING_PAUSED, "true").await?;
            println!("Engine will pause at the next cycle.");
        }

        Commands::Unpause => {
            db.set_setting(SETTING_PAUSED, "false").await?;
            println!("Engine will run at the next cycle.");
        }

        Commands::Enable { name } => set_active(&db, &name, true).await?,

        Commands::Disable { name } => set_active(&db, &name, false).await?,
    }

    Ok(())
}

/// Flip the stored active flag of an exchange or agent. Takes effect on the next run.
async fn set_active(db: &Database, name: &str, active: bool) -> Result<()> {
    let exchange = db.set_exchange_active(name, active).await?;
    let agent = db.set_agent_active(name, active).await?;
    if !exchange && !agent {
        bail!("No stored exchange or agent named '{}'", name);
    }
    println!("{} {}.", name, if active { "enabled" } else { "disabled" });
    Ok(())
}

/// Stored setting, or the default written back on first start.
async fn load_or_init<T, F>(db: &Database, key: &str, default: F) -> Result<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
    F: FnOnce() -> T,
{
    match db.load_json(key).await? {
        Some(value) => Ok(value),
        None => {
            let value = default();
            db.save_json(key, &value).await?;
            info!(key = key, "Wrote default settings");
            Ok(value)
        }
    }
}

/// Gateways for every configured exchange. With `paper` set to
/// `(capital, fee_rate)`, fills are simulated against a balance of that size
/// in each accepted quote currency.
fn build_router(exchanges: &[ExchangeConfig], paper: Option<(Decimal, Decimal)>) -> Result<ExchangeRouter> {
    let quotes = StrategyConfig::default().quote_currencies;
    let mut gateways = Vec::with_capacity(exchanges.len());

    for config in exchanges {
        let feed: Arc<dyn ExchangeApi> = Arc::new(
            RestExchange::new(config.clone())
                .with_context(|| format!("Failed to create client for {}", config.id))?,
        );
        let api: Arc<dyn ExchangeApi> = match paper {
            Some((capital, fee_rate)) => {
                let balances: HashMap<String, Decimal> =
                    quotes.iter().map(|q| (q.clone(), capital)).collect();
                Arc::new(PaperExchange::new(feed, balances).with_fee_rate(fee_rate))
            }
            None => feed,
        };
        gateways.push(ExchangeGateway::new(config.clone(), api));
    }

    let router = ExchangeRouter::new(gateways);
    if router.is_empty() {
        warn!("No exchanges configured");
    }
    Ok(router)
}

fn build_sentiment_sources(app: &AppConfig) -> Result<Vec<Box<dyn SentimentSource>>> {
    let mut sources: Vec<Box<dyn SentimentSource>> =
        vec![Box::new(FearGreedSource::new(app.sentiment.fear_greed_url.clone())?)];
    if let Some(url) = &app.sentiment.news_url {
        sources.push(Box::new(HeadlineSource::news(url.clone())?));
    }
    if let Some(url) = &app.sentiment.social_url {
        sources.push(Box::new(HeadlineSource::social(url.clone())?));
    }
    Ok(sources)
}
