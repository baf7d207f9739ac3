//! SQLite persistence for configuration, grid positions and audit history.
//!
//! Stores everything needed to resume after restart:
//! - Exchange and advisory-agent configuration
//! - Open grid positions with their serialized ladders
//! - Trade history and advisory audit records
//! - Settings, including the circuit-breaker state
//! - Daily realized P&L

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::info;

use crate::config::{AgentConfig, AppConfig, ExchangeConfig};
use crate::models::{
    AdvisoryResult, CircuitBreakerState, GridPosition, PositionStatus, TradeRecord,
};

pub const SETTING_STRATEGY: &str = "strategy_config";
pub const SETTING_RISK_LIMITS: &str = "risk_limits";
pub const SETTING_BREAKER: &str = "circuit_breaker";
pub const SETTING_PAUSED: &str = "engine_paused";

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Stored exchange row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredExchange {
    pub id: String,
    pub api_url: String,
    pub testnet: bool,
    pub rate_limit_ms: i64,
    pub min_notional: f64,
    pub is_active: bool,
}

/// Stored advisory agent row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredAgent {
    pub name: String,
    pub kind: String,
    pub model: String,
    pub endpoint: String,
    pub is_active: bool,
    pub priority: i64,
}

/// Stored grid position row. Decimal columns are TEXT to keep them exact.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredPosition {
    pub id: String,
    pub pair: String,
    pub exchange_id: String,
    pub total_quantity: String,
    pub average_price: String,
    pub total_invested: String,
    pub realized_proceeds: String,
    pub current_price: String,
    pub status: String,
    pub levels_json: String,
    pub hypothesis_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl StoredPosition {
    pub fn into_position(self) -> Result<GridPosition> {
        let dec = |field: &str, value: &str| {
            Decimal::from_str(value).with_context(|| format!("Bad {} '{}' for position {}", field, value, self.id))
        };
        let total_quantity = dec("total_quantity", &self.total_quantity)?;
        let current_price = dec("current_price", &self.current_price)?;
        let levels = GridPosition::levels_from_json(&self.levels_json)
            .with_context(|| format!("Bad ladder for position {}", self.id))?;

        Ok(GridPosition {
            pair: self.pair.clone(),
            exchange_id: self.exchange_id.clone(),
            total_quantity,
            average_price: dec("average_price", &self.average_price)?,
            total_invested: dec("total_invested", &self.total_invested)?,
            realized_proceeds: dec("realized_proceeds", &self.realized_proceeds)?,
            current_price,
            current_value: total_quantity * current_price,
            levels,
            status: if self.status == "closed" {
                PositionStatus::Closed
            } else {
                PositionStatus::Open
            },
            hypothesis_id: self.hypothesis_id.clone(),
            created_at: parse_time(&self.created_at),
            updated_at: parse_time(&self.updated_at),
            id: self.id,
        })
    }
}

/// Stored trade history row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredTrade {
    pub id: i64,
    pub position_id: String,
    pub pair: String,
    pub exchange_id: String,
    pub side: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub realized_pnl_pct: f64,
    pub exit_reason: String,
    pub rsi: Option<f64>,
    pub macd: Option<f64>,
    pub fear_greed_index: Option<i64>,
    pub sentiment: Option<String>,
    pub agents: String,
    pub opened_at: String,
    pub closed_at: String,
}

/// Stored advisory audit row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredAdvisory {
    pub id: i64,
    pub hypothesis_id: String,
    pub pair: String,
    pub agent: String,
    pub decision: String,
    pub confidence: f64,
    pub reasoning: String,
    pub latency_ms: i64,
    pub raw_response: String,
    pub created_at: String,
}

fn parse_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl Database {
    /// Open the database and create missing tables.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every in-memory connection is its own database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS exchanges (
                id TEXT PRIMARY KEY,
                api_url TEXT NOT NULL,
                testnet INTEGER NOT NULL DEFAULT 0,
                rate_limit_ms INTEGER NOT NULL DEFAULT 1000,
                min_notional REAL NOT NULL DEFAULT 10,
                is_active INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS advisory_agents (
                name TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                model TEXT NOT NULL,
                endpoint TEXT NOT NULL DEFAULT '',
                is_active INTEGER NOT NULL DEFAULT 1,
                priority INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS grid_positions (
                id TEXT PRIMARY KEY,
                pair TEXT NOT NULL,
                exchange_id TEXT NOT NULL,
                total_quantity TEXT NOT NULL,
                average_price TEXT NOT NULL,
                total_invested TEXT NOT NULL,
                realized_proceeds TEXT NOT NULL DEFAULT '0',
                current_price TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                levels_json TEXT NOT NULL DEFAULT '[]',
                hypothesis_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position_id TEXT NOT NULL,
                pair TEXT NOT NULL,
                exchange_id TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity REAL NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL NOT NULL,
                realized_pnl REAL NOT NULL,
                realized_pnl_pct REAL NOT NULL,
                exit_reason TEXT NOT NULL,
                rsi REAL,
                macd REAL,
                fear_greed_index INTEGER,
                sentiment TEXT,
                agents TEXT NOT NULL DEFAULT '',
                opened_at TEXT NOT NULL,
                closed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS advisory_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hypothesis_id TEXT NOT NULL,
                pair TEXT NOT NULL,
                agent TEXT NOT NULL,
                decision TEXT NOT NULL,
                confidence REAL NOT NULL,
                reasoning TEXT NOT NULL,
                latency_ms INTEGER NOT NULL,
                raw_response TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_pnl (
                date TEXT PRIMARY KEY,
                realized_pnl REAL NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_status ON grid_positions(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_advisory_hypothesis ON advisory_results(hypothesis_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Exchanges & Agents ====================

    /// Save or update an exchange configuration. Credentials are never stored.
    pub async fn save_exchange(&self, config: &ExchangeConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO exchanges (id, api_url, testnet, rate_limit_ms, min_notional)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                api_url = excluded.api_url,
                testnet = excluded.testnet,
                rate_limit_ms = excluded.rate_limit_ms,
                min_notional = excluded.min_notional,
                updated_at = datetime('now')
            "#,
        )
        .bind(&config.id)
        .bind(&config.api_url)
        .bind(config.testnet)
        .bind(config.rate_limit_ms as i64)
        .bind(config.min_notional.to_f64().unwrap_or(0.0))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_exchanges(&self) -> Result<Vec<StoredExchange>> {
        sqlx::query_as::<_, StoredExchange>(
            "SELECT id, api_url, testnet, rate_limit_ms, min_notional, is_active FROM exchanges ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch exchanges")
    }

    /// Returns whether a stored exchange matched.
    pub async fn set_exchange_active(&self, id: &str, active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE exchanges SET is_active = ?, updated_at = datetime('now') WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Save or update an advisory agent. API keys are never stored.
    pub async fn save_agent(&self, config: &AgentConfig, priority: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO advisory_agents (name, kind, model, endpoint, priority)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                kind = excluded.kind,
                model = excluded.model,
                endpoint = excluded.endpoint,
                updated_at = datetime('now')
            "#,
        )
        .bind(&config.name)
        .bind(config.kind.as_str())
        .bind(&config.model)
        .bind(&config.endpoint)
        .bind(priority)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Agents ordered by priority.
    pub async fn load_agents(&self) -> Result<Vec<StoredAgent>> {
        sqlx::query_as::<_, StoredAgent>(
            "SELECT name, kind, model, endpoint, is_active, priority FROM advisory_agents ORDER BY priority, name",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch advisory agents")
    }

    /// Returns whether a stored agent matched.
    pub async fn set_agent_active(&self, name: &str, active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE advisory_agents SET is_active = ?, updated_at = datetime('now') WHERE name = ?")
            .bind(active)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Register the environment's exchanges and agents, then apply the stored
    /// rows: inactive entries are dropped and agents follow stored priority.
    ///
    /// New agents are appended after the stored ones.
    pub async fn sync_config(&self, app: &mut AppConfig) -> Result<()> {
        let known: Vec<StoredAgent> = self.load_agents().await?;
        let next_priority = known.iter().map(|a| a.priority + 1).max().unwrap_or(0);
        for exchange in &app.exchanges {
            self.save_exchange(exchange).await?;
        }
        let mut appended = 0;
        for agent in &app.agents {
            let priority = match known.iter().find(|a| a.name == agent.name) {
                Some(stored) => stored.priority,
                None => {
                    appended += 1;
                    next_priority + appended - 1
                }
            };
            self.save_agent(agent, priority).await?;
        }

        let exchanges = self.load_exchanges().await?;
        app.exchanges.retain(|config| {
            let active = exchanges
                .iter()
                .find(|row| row.id == config.id)
                .map_or(true, |row| row.is_active);
            if !active {
                info!(exchange = %config.id, "Exchange disabled in database, skipping");
            }
            active
        });

        let agents = self.load_agents().await?;
        app.agents.retain(|config| {
            let active = agents
                .iter()
                .find(|row| row.name == config.name)
                .map_or(true, |row| row.is_active);
            if !active {
                info!(agent = %config.name, "Advisory agent disabled in database, skipping");
            }
            active
        });
        app.agents.sort_by_key(|config| {
            agents
                .iter()
                .position(|row| row.name == config.name)
                .unwrap_or(usize::MAX)
        });

        Ok(())
    }

    // ==================== Grid Positions ====================

    /// Insert or overwrite a position and its ladder.
    pub async fn save_position(&self, position: &GridPosition) -> Result<()> {
        let levels_json = position.levels_json().context("Failed to serialize grid ladder")?;
        sqlx::query(
            r#"
            INSERT INTO grid_positions (
                id, pair, exchange_id, total_quantity, average_price, total_invested,
                realized_proceeds, current_price, status, levels_json, hypothesis_id,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                total_quantity = excluded.total_quantity,
                average_price = excluded.average_price,
                total_invested = excluded.total_invested,
                realized_proceeds = excluded.realized_proceeds,
                current_price = excluded.current_price,
                status = excluded.status,
                levels_json = excluded.levels_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&position.id)
        .bind(&position.pair)
        .bind(&position.exchange_id)
        .bind(position.total_quantity.to_string())
        .bind(position.average_price.to_string())
        .bind(position.total_invested.to_string())
        .bind(position.realized_proceeds.to_string())
        .bind(position.current_price.to_string())
        .bind(position.status.as_str())
        .bind(levels_json)
        .bind(&position.hypothesis_id)
        .bind(position.created_at.to_rfc3339())
        .bind(position.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_open_positions(&self) -> Result<Vec<GridPosition>> {
        let rows = sqlx::query_as::<_, StoredPosition>(
            "SELECT * FROM grid_positions WHERE status = 'open' ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch positions")?;

        rows.into_iter().map(StoredPosition::into_position).collect()
    }

    // ==================== Trade History ====================

    /// Append a closed-position record.
    pub async fn record_trade(&self, trade: &TradeRecord) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO trade_history (
                position_id, pair, exchange_id, side, quantity, entry_price, exit_price,
                realized_pnl, realized_pnl_pct, exit_reason, rsi, macd, fear_greed_index,
                sentiment, agents, opened_at, closed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&trade.position_id)
        .bind(&trade.pair)
        .bind(&trade.exchange_id)
        .bind(trade.side.as_str())
        .bind(trade.quantity.to_f64().unwrap_or(0.0))
        .bind(trade.entry_price.to_f64().unwrap_or(0.0))
        .bind(trade.exit_price.to_f64().unwrap_or(0.0))
        .bind(trade.realized_pnl.to_f64().unwrap_or(0.0))
        .bind(trade.realized_pnl_pct.to_f64().unwrap_or(0.0))
        .bind(&trade.exit_reason)
        .bind(trade.rsi)
        .bind(trade.macd)
        .bind(trade.fear_greed_index.map(i64::from))
        .bind(&trade.sentiment)
        .bind(trade.agents.join(","))
        .bind(trade.opened_at.to_rfc3339())
        .bind(trade.closed_at.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(sqlx::Row::get(&result, "id"))
    }

    pub async fn recent_trades(&self, limit: i64) -> Result<Vec<StoredTrade>> {
        sqlx::query_as::<_, StoredTrade>("SELECT * FROM trade_history ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch trade history")
    }

    // ==================== Advisory Audit ====================

    pub async fn record_advisory(
        &self,
        hypothesis_id: &str,
        pair: &str,
        result: &AdvisoryResult,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO advisory_results (
                hypothesis_id, pair, agent, decision, confidence, reasoning,
                latency_ms, raw_response, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(hypothesis_id)
        .bind(pair)
        .bind(&result.agent)
        .bind(result.decision.as_str())
        .bind(result.confidence)
        .bind(&result.reasoning)
        .bind(result.latency_ms as i64)
        .bind(&result.raw_response)
        .bind(result.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn advisory_results(&self, hypothesis_id: &str) -> Result<Vec<StoredAdvisory>> {
        sqlx::query_as::<_, StoredAdvisory>(
            "SELECT * FROM advisory_results WHERE hypothesis_id = ? ORDER BY id",
        )
        .bind(hypothesis_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch advisory results")
    }

    // ==================== Settings ====================

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(v,)| v))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Read a JSON-encoded setting.
    pub async fn load_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_setting(key).await? {
            Some(raw) => {
                let value = serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse setting '{}'", key))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn save_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set_setting(key, &raw).await
    }

    pub async fn load_breaker(&self) -> Result<Option<CircuitBreakerState>> {
        self.load_json(SETTING_BREAKER).await
    }

    pub async fn save_breaker(&self, state: &CircuitBreakerState) -> Result<()> {
        self.save_json(SETTING_BREAKER, state).await
    }

    // ==================== Daily P&L ====================

    pub async fn record_daily_pnl(&self, date: NaiveDate, pnl: Decimal) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO daily_pnl (date, realized_pnl) VALUES (?, ?)
            ON CONFLICT(date) DO UPDATE SET realized_pnl = excluded.realized_pnl
            "#,
        )
        .bind(date.format("%Y-%m-%d").to_string())
        .bind(pnl.to_f64().unwrap_or(0.0))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent `limit` days, oldest first.
    pub async fn daily_pnl_history(&self, limit: i64) -> Result<Vec<(NaiveDate, Decimal)>> {
        let rows: Vec<(String, f64)> =
            sqlx::query_as("SELECT date, realized_pnl FROM daily_pnl ORDER BY date DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;

        let mut history = rows
            .into_iter()
            .map(|(date, pnl)| {
                let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                    .with_context(|| format!("Bad daily_pnl date '{}'", date))?;
                Ok((date, Decimal::try_from(pnl).unwrap_or_default()))
            })
            .collect::<Result<Vec<_>>>()?;
        history.reverse();
        Ok(history)
    }

    /// Trailing run of losing days ending at the latest recorded day.
    pub async fn consecutive_losing_days(&self) -> Result<u32> {
        let history = self.daily_pnl_history(30).await?;
        Ok(history
            .iter()
            .rev()
            .take_while(|(_, pnl)| *pnl < Decimal::ZERO)
            .count() as u32)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
