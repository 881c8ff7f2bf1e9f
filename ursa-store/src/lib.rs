//! Persistence boundary for pipeline-owned market state.
//!
//! The pipeline is the single writer for every entity behind this trait;
//! request handlers only ever read. Uniqueness of `tx_hash` is enforced at
//! the storage layer so idempotence survives at-least-once delivery.

use chrono::{DateTime, Utc};
use rusqlite::ErrorCode;
use thiserror::Error;

use ursa_core::{AgentMetrics, Candle, Position, Price, Timeframe, Trade};

mod sqlite;

pub use sqlite::SqliteMarketStore;

/// Storage failures observed by the pipeline.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("corrupt {column} column: {value}")]
    Corrupt { column: &'static str, value: String },
}

impl StoreError {
    /// Whether a retry may reasonably succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Outcome of an idempotent trade insert.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TradeWrite {
    Inserted,
    /// The `tx_hash` was already recorded; the write was a no-op.
    Duplicate,
}

/// Repository contract for all pipeline-owned entities.
pub trait MarketStore: Send + Sync {
    /// Insert a trade keyed by `tx_hash`, reporting duplicates instead of
    /// failing on them.
    fn insert_trade(&self, trade: &Trade) -> Result<TradeWrite, StoreError>;

    fn trade_count(&self, agent_id: &str) -> Result<u64, StoreError>;

    /// Trades for an agent with `timestamp >= since`, oldest first.
    fn trades_since(&self, agent_id: &str, since: DateTime<Utc>)
        -> Result<Vec<Trade>, StoreError>;

    /// Price of the most recent trade by event timestamp.
    fn latest_price(&self, agent_id: &str) -> Result<Option<Price>, StoreError>;

    /// Price of the last trade at or before `at`.
    fn price_at_or_before(
        &self,
        agent_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Price>, StoreError>;

    /// All-time `(low, high)` trade prices for an agent.
    fn price_extremes(&self, agent_id: &str) -> Result<Option<(Price, Price)>, StoreError>;

    fn candle(
        &self,
        agent_id: &str,
        timeframe: Timeframe,
        interval_start: DateTime<Utc>,
    ) -> Result<Option<Candle>, StoreError>;

    fn upsert_candle(&self, candle: &Candle) -> Result<(), StoreError>;

    /// Most recent candles for a timeframe, newest first.
    fn candles(
        &self,
        agent_id: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, StoreError>;

    fn position(&self, user_id: &str, agent_id: &str) -> Result<Option<Position>, StoreError>;

    fn upsert_position(&self, position: &Position) -> Result<(), StoreError>;

    fn positions_for_agent(&self, agent_id: &str) -> Result<Vec<Position>, StoreError>;

    fn upsert_metrics(&self, metrics: &AgentMetrics) -> Result<(), StoreError>;

    fn metrics(&self, agent_id: &str) -> Result<Option<AgentMetrics>, StoreError>;
}
