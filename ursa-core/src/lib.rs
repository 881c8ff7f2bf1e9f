//! Fundamental data types shared across the entire workspace.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for quantity precision.
pub type Quantity = Decimal;
/// On-chain address of an agent token mint.
pub type AgentId = String;
/// Wallet address of a trader.
pub type UserId = String;
/// Transaction signature; globally unique and used as the idempotency key.
pub type TxHash = String;

/// The side of a trade.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Tagged trade side carrying the counterparty wallet.
///
/// Upstream payloads encode the trader as either a `buyer` or a `seller`
/// field; the variant is resolved once at the ingestion boundary so the rest
/// of the pipeline never inspects field presence.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "side")]
pub enum TradeSide {
    Buy { buyer: UserId },
    Sell { seller: UserId },
}

impl TradeSide {
    /// The plain side of this trade.
    #[must_use]
    pub fn side(&self) -> Side {
        match self {
            Self::Buy { .. } => Side::Buy,
            Self::Sell { .. } => Side::Sell,
        }
    }

    /// Wallet address of the trader, regardless of side.
    #[must_use]
    pub fn trader(&self) -> &UserId {
        match self {
            Self::Buy { buyer } => buyer,
            Self::Sell { seller } => seller,
        }
    }
}

/// Immutable record of a verified on-chain trade against an agent's curve.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Trade {
    pub agent_id: AgentId,
    #[serde(flatten)]
    pub side: TradeSide,
    /// Agent tokens exchanged.
    pub base_amount: Quantity,
    /// Quote-asset (SOL) notional exchanged.
    pub quote_amount: Price,
    pub block_height: u64,
    pub tx_hash: TxHash,
    pub timestamp: DateTime<Utc>,
}

impl Trade {
    /// Effective execution price in quote units per token.
    ///
    /// Callers must reject zero `base_amount` trades before asking for a
    /// price; [`Trade::validate`] enforces this at the ingest boundary.
    #[must_use]
    pub fn price(&self) -> Price {
        self.quote_amount / self.base_amount
    }

    /// Reject malformed payloads before they enter any queue.
    pub fn validate(&self) -> Result<(), InvalidTrade> {
        if self.tx_hash.trim().is_empty() {
            return Err(InvalidTrade::MissingTxHash);
        }
        if self.agent_id.trim().is_empty() {
            return Err(InvalidTrade::MissingAgent);
        }
        if self.base_amount <= Decimal::ZERO {
            return Err(InvalidTrade::NonPositiveBaseAmount(self.base_amount));
        }
        if self.quote_amount <= Decimal::ZERO {
            return Err(InvalidTrade::NonPositiveQuoteAmount(self.quote_amount));
        }
        Ok(())
    }
}

/// Validation failures surfaced synchronously to the ingest caller.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum InvalidTrade {
    #[error("trade is missing a transaction hash")]
    MissingTxHash,
    #[error("trade is missing an agent id")]
    MissingAgent,
    #[error("base amount must be positive, got {0}")]
    NonPositiveBaseAmount(Quantity),
    #[error("quote amount must be positive, got {0}")]
    NonPositiveQuoteAmount(Price),
}

/// Interval granularity used when aggregating trades into candles.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeframe {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    FourHours,
    OneDay,
    OneWeek,
}

impl Timeframe {
    /// Every supported timeframe, coarsest last.
    pub const ALL: [Timeframe; 8] = [
        Self::OneMinute,
        Self::FiveMinutes,
        Self::FifteenMinutes,
        Self::ThirtyMinutes,
        Self::OneHour,
        Self::FourHours,
        Self::OneDay,
        Self::OneWeek,
    ];

    /// Interval length in whole seconds.
    #[must_use]
    pub fn as_secs(self) -> i64 {
        match self {
            Self::OneMinute => 60,
            Self::FiveMinutes => 300,
            Self::FifteenMinutes => 900,
            Self::ThirtyMinutes => 1_800,
            Self::OneHour => 3_600,
            Self::FourHours => 14_400,
            Self::OneDay => 86_400,
            Self::OneWeek => 604_800,
        }
    }

    /// Convert the interval into a chrono `Duration`.
    #[must_use]
    pub fn as_duration(self) -> Duration {
        Duration::seconds(self.as_secs())
    }

    /// Short identifier used in channel names and storage keys.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
            Self::FourHours => "4h",
            Self::OneDay => "1d",
            Self::OneWeek => "1w",
        }
    }

    /// Calendar-aligned start of the interval containing `at`.
    ///
    /// Boundaries fall on the Unix epoch grid, so hour candles open on `:00`
    /// rather than at the first observed trade.
    #[must_use]
    pub fn interval_start(self, at: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.as_secs();
        let floored = at.timestamp().div_euclid(secs) * secs;
        Utc.timestamp_opt(floored, 0).single().unwrap_or(at)
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "1m" | "1min" | "1minute" => Ok(Self::OneMinute),
            "5m" | "5min" | "5minutes" => Ok(Self::FiveMinutes),
            "15m" | "15min" | "15minutes" => Ok(Self::FifteenMinutes),
            "30m" | "30min" | "30minutes" => Ok(Self::ThirtyMinutes),
            "1h" | "60m" | "1hour" => Ok(Self::OneHour),
            "4h" | "240m" | "4hours" => Ok(Self::FourHours),
            "1d" | "day" | "d" => Ok(Self::OneDay),
            "1w" | "week" | "w" => Ok(Self::OneWeek),
            other => Err(format!("unsupported timeframe '{other}'")),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Aggregated OHLCV bar keyed by `(agent_id, timeframe, interval_start)`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Candle {
    pub agent_id: AgentId,
    pub timeframe: Timeframe,
    pub interval_start: DateTime<Utc>,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    /// Quote-asset volume; non-decreasing within an interval.
    pub volume: Price,
    pub trade_count: u64,
}

/// Holdings of one user in one agent token.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Position {
    pub user_id: UserId,
    pub agent_id: AgentId,
    pub balance: Quantity,
    pub total_invested: Price,
    pub average_cost: Price,
    pub realized_pnl: Price,
    pub current_value: Price,
    pub last_trade_at: Option<DateTime<Utc>>,
}

impl Position {
    /// An empty position for a `(user, agent)` pair that has never traded.
    #[must_use]
    pub fn empty(user_id: impl Into<UserId>, agent_id: impl Into<AgentId>) -> Self {
        Self {
            user_id: user_id.into(),
            agent_id: agent_id.into(),
            balance: Decimal::ZERO,
            total_invested: Decimal::ZERO,
            average_cost: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            current_value: Decimal::ZERO,
            last_trade_at: None,
        }
    }

    /// Whether this position counts towards the agent's holder tally.
    #[must_use]
    pub fn is_holder(&self) -> bool {
        self.balance > Decimal::ZERO
    }
}

/// Derived per-agent statistics.
///
/// Never authoritative: always recomputable from trade and position history,
/// and treated as a cache by everything downstream.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AgentMetrics {
    pub agent_id: AgentId,
    pub current_price: Price,
    pub market_cap: Price,
    pub volume_24h: Price,
    /// Percentage move against the price 24 hours ago.
    pub price_change_24h: Price,
    pub holders: u64,
    pub all_time_high: Price,
    pub all_time_low: Price,
    pub total_transactions: u64,
    pub updated_at: DateTime<Utc>,
}

/// Name of the platform-wide broadcast channel.
pub const PLATFORM_CHANNEL: &str = "platform";

/// Channel name carrying events for a single agent.
#[must_use]
pub fn agent_channel(agent_id: &str) -> String {
    format!("agent:{agent_id}")
}

/// Discriminant for broadcast envelopes.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketEventKind {
    TradeExecuted,
    MetricsUpdated,
}

/// Envelope published to agent and platform channels.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MarketEvent {
    pub kind: MarketEventKind,
    pub agent_address: AgentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade: Option<Trade>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<AgentMetrics>,
    pub timestamp: DateTime<Utc>,
}

impl MarketEvent {
    /// Envelope for a freshly processed trade.
    #[must_use]
    pub fn trade_executed(trade: Trade, at: DateTime<Utc>) -> Self {
        Self {
            kind: MarketEventKind::TradeExecuted,
            agent_address: trade.agent_id.clone(),
            trade: Some(trade),
            metrics: None,
            timestamp: at,
        }
    }

    /// Envelope for a recomputed metrics snapshot.
    #[must_use]
    pub fn metrics_updated(metrics: AgentMetrics, at: DateTime<Utc>) -> Self {
        Self {
            kind: MarketEventKind::MetricsUpdated,
            agent_address: metrics.agent_id.clone(),
            trade: None,
            metrics: Some(metrics),
            timestamp: at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_trade() -> Trade {
        Trade {
            agent_id: "AgentMint1111".into(),
            side: TradeSide::Buy {
                buyer: "Wallet1111".into(),
            },
            base_amount: Decimal::from(100),
            quote_amount: Decimal::from(25),
            block_height: 1_024,
            tx_hash: "sig-abc".into(),
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 12, 34, 56).unwrap(),
        }
    }

    #[test]
    fn trade_price_is_quote_over_base() {
        let trade = sample_trade();
        assert_eq!(trade.price(), Decimal::new(25, 2));
    }

    #[test]
    fn validate_rejects_malformed_trades() {
        let mut trade = sample_trade();
        trade.base_amount = Decimal::ZERO;
        assert_eq!(
            trade.validate(),
            Err(InvalidTrade::NonPositiveBaseAmount(Decimal::ZERO))
        );

        let mut trade = sample_trade();
        trade.tx_hash = "  ".into();
        assert_eq!(trade.validate(), Err(InvalidTrade::MissingTxHash));

        assert!(sample_trade().validate().is_ok());
    }

    #[test]
    fn trade_side_resolves_trader() {
        let trade = sample_trade();
        assert_eq!(trade.side.side(), Side::Buy);
        assert_eq!(trade.side.trader(), "Wallet1111");
    }

    #[test]
    fn hour_intervals_align_to_the_top_of_the_hour() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 34, 56).unwrap();
        let start = Timeframe::OneHour.interval_start(at);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn day_intervals_align_to_midnight() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 23, 59, 59).unwrap();
        let start = Timeframe::OneDay.interval_start(at);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn timeframe_parses_common_spellings() {
        assert_eq!("1h".parse::<Timeframe>().unwrap(), Timeframe::OneHour);
        assert_eq!("30min".parse::<Timeframe>().unwrap(), Timeframe::ThirtyMinutes);
        assert!("7m".parse::<Timeframe>().is_err());
    }

    #[test]
    fn trade_side_serializes_tagged() {
        let trade = sample_trade();
        let json = serde_json::to_value(&trade).unwrap();
        assert_eq!(json["side"], "buy");
        assert_eq!(json["buyer"], "Wallet1111");
    }
}
