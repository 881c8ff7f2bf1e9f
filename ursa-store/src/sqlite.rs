//! SQLite-backed implementation of [`MarketStore`].

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;

use ursa_core::{AgentMetrics, Candle, Position, Price, Side, Timeframe, Trade, TradeSide};

use crate::{MarketStore, StoreError, TradeWrite};

/// Repository storing market state in a single SQLite database.
///
/// Decimal columns are stored as canonical strings to preserve exact
/// precision; timestamps are stored as epoch milliseconds.
pub struct SqliteMarketStore {
    conn: Mutex<Connection>,
}

impl SqliteMarketStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    /// In-memory store; used by tests and short-lived tooling.
    pub fn new_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                tx_hash TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                side TEXT NOT NULL,
                trader TEXT NOT NULL,
                base_amount TEXT NOT NULL,
                quote_amount TEXT NOT NULL,
                price TEXT NOT NULL,
                block_height INTEGER NOT NULL,
                timestamp_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_agent_ts
                ON trades(agent_id, timestamp_ms);

            CREATE TABLE IF NOT EXISTS candles (
                agent_id TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                interval_start_ms INTEGER NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                trade_count INTEGER NOT NULL,
                PRIMARY KEY (agent_id, timeframe, interval_start_ms)
            );

            CREATE TABLE IF NOT EXISTS positions (
                user_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                balance TEXT NOT NULL,
                total_invested TEXT NOT NULL,
                average_cost TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                current_value TEXT NOT NULL,
                last_trade_at_ms INTEGER,
                PRIMARY KEY (user_id, agent_id)
            );
            CREATE INDEX IF NOT EXISTS idx_positions_agent ON positions(agent_id);

            CREATE TABLE IF NOT EXISTS agent_metrics (
                agent_id TEXT PRIMARY KEY,
                current_price TEXT NOT NULL,
                market_cap TEXT NOT NULL,
                volume_24h TEXT NOT NULL,
                price_change_24h TEXT NOT NULL,
                holders INTEGER NOT NULL,
                all_time_high TEXT NOT NULL,
                all_time_low TEXT NOT NULL,
                total_transactions INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("sqlite connection lock poisoned")
    }
}

fn dec(value: &Decimal) -> String {
    value.normalize().to_string()
}

fn parse_dec(column: &'static str, value: String) -> Result<Decimal, StoreError> {
    Decimal::from_str(&value).map_err(|_| StoreError::Corrupt { column, value })
}

fn parse_ts(column: &'static str, ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt {
            column,
            value: ms.to_string(),
        })
}

fn parse_timeframe(value: String) -> Result<Timeframe, StoreError> {
    Timeframe::from_str(&value).map_err(|_| StoreError::Corrupt {
        column: "timeframe",
        value,
    })
}

/// Raw trade row as read from SQLite, before decimal/timestamp parsing.
type TradeRow = (String, String, String, String, String, String, i64, i64);

fn trade_from_row(row: TradeRow) -> Result<Trade, StoreError> {
    let (tx_hash, agent_id, side, trader, base, quote, block_height, ts_ms) = row;
    let side = match side.as_str() {
        "buy" => TradeSide::Buy { buyer: trader },
        "sell" => TradeSide::Sell { seller: trader },
        other => {
            return Err(StoreError::Corrupt {
                column: "side",
                value: other.to_string(),
            })
        }
    };
    Ok(Trade {
        agent_id,
        side,
        base_amount: parse_dec("base_amount", base)?,
        quote_amount: parse_dec("quote_amount", quote)?,
        block_height: block_height as u64,
        tx_hash,
        timestamp: parse_ts("timestamp_ms", ts_ms)?,
    })
}

const SELECT_TRADE: &str =
    "SELECT tx_hash, agent_id, side, trader, base_amount, quote_amount, block_height, timestamp_ms
     FROM trades";

impl MarketStore for SqliteMarketStore {
    fn insert_trade(&self, trade: &Trade) -> Result<TradeWrite, StoreError> {
        let conn = self.lock();
        let side = match trade.side.side() {
            Side::Buy => "buy",
            Side::Sell => "sell",
        };
        let changed = conn.execute(
            r#"
            INSERT OR IGNORE INTO trades
                (tx_hash, agent_id, side, trader, base_amount, quote_amount, price,
                 block_height, timestamp_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                trade.tx_hash,
                trade.agent_id,
                side,
                trade.side.trader(),
                dec(&trade.base_amount),
                dec(&trade.quote_amount),
                dec(&trade.price()),
                trade.block_height as i64,
                trade.timestamp.timestamp_millis(),
            ],
        )?;
        if changed == 0 {
            Ok(TradeWrite::Duplicate)
        } else {
            Ok(TradeWrite::Inserted)
        }
    }

    fn trade_count(&self, agent_id: &str) -> Result<u64, StoreError> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trades WHERE agent_id = ?1",
            params![agent_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn trades_since(
        &self,
        agent_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Trade>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_TRADE} WHERE agent_id = ?1 AND timestamp_ms >= ?2 ORDER BY timestamp_ms"
        ))?;
        let rows = stmt
            .query_map(params![agent_id, since.timestamp_millis()], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            })?
            .collect::<Result<Vec<TradeRow>, _>>()?;
        rows.into_iter().map(trade_from_row).collect()
    }

    fn latest_price(&self, agent_id: &str) -> Result<Option<Price>, StoreError> {
        let conn = self.lock();
        let value: Option<String> = conn
            .query_row(
                "SELECT price FROM trades WHERE agent_id = ?1
                 ORDER BY timestamp_ms DESC, block_height DESC LIMIT 1",
                params![agent_id],
                |row| row.get(0),
            )
            .optional()?;
        value.map(|v| parse_dec("price", v)).transpose()
    }

    fn price_at_or_before(
        &self,
        agent_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Price>, StoreError> {
        let conn = self.lock();
        let value: Option<String> = conn
            .query_row(
                "SELECT price FROM trades WHERE agent_id = ?1 AND timestamp_ms <= ?2
                 ORDER BY timestamp_ms DESC, block_height DESC LIMIT 1",
                params![agent_id, at.timestamp_millis()],
                |row| row.get(0),
            )
            .optional()?;
        value.map(|v| parse_dec("price", v)).transpose()
    }

    fn price_extremes(&self, agent_id: &str) -> Result<Option<(Price, Price)>, StoreError> {
        // Prices are stored as text, so extremes are folded in Rust rather
        // than with SQL MIN/MAX.
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT price FROM trades WHERE agent_id = ?1")?;
        let prices = stmt
            .query_map(params![agent_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut extremes: Option<(Price, Price)> = None;
        for raw in prices {
            let price = parse_dec("price", raw)?;
            extremes = Some(match extremes {
                None => (price, price),
                Some((low, high)) => (low.min(price), high.max(price)),
            });
        }
        Ok(extremes)
    }

    fn candle(
        &self,
        agent_id: &str,
        timeframe: Timeframe,
        interval_start: DateTime<Utc>,
    ) -> Result<Option<Candle>, StoreError> {
        let conn = self.lock();
        let row: Option<(String, String, String, String, String, i64)> = conn
            .query_row(
                "SELECT open, high, low, close, volume, trade_count FROM candles
                 WHERE agent_id = ?1 AND timeframe = ?2 AND interval_start_ms = ?3",
                params![
                    agent_id,
                    timeframe.label(),
                    interval_start.timestamp_millis()
                ],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(open, high, low, close, volume, trade_count)| {
            Ok(Candle {
                agent_id: agent_id.to_string(),
                timeframe,
                interval_start,
                open: parse_dec("open", open)?,
                high: parse_dec("high", high)?,
                low: parse_dec("low", low)?,
                close: parse_dec("close", close)?,
                volume: parse_dec("volume", volume)?,
                trade_count: trade_count as u64,
            })
        })
        .transpose()
    }

    fn upsert_candle(&self, candle: &Candle) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO candles
                (agent_id, timeframe, interval_start_ms, open, high, low, close,
                 volume, trade_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(agent_id, timeframe, interval_start_ms) DO UPDATE SET
                open = excluded.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume,
                trade_count = excluded.trade_count
            "#,
            params![
                candle.agent_id,
                candle.timeframe.label(),
                candle.interval_start.timestamp_millis(),
                dec(&candle.open),
                dec(&candle.high),
                dec(&candle.low),
                dec(&candle.close),
                dec(&candle.volume),
                candle.trade_count as i64,
            ],
        )?;
        Ok(())
    }

    fn candles(
        &self,
        agent_id: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT interval_start_ms, open, high, low, close, volume, trade_count
             FROM candles WHERE agent_id = ?1 AND timeframe = ?2
             ORDER BY interval_start_ms DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![agent_id, timeframe.label(), limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(start_ms, open, high, low, close, volume, trade_count)| {
                Ok(Candle {
                    agent_id: agent_id.to_string(),
                    timeframe,
                    interval_start: parse_ts("interval_start_ms", start_ms)?,
                    open: parse_dec("open", open)?,
                    high: parse_dec("high", high)?,
                    low: parse_dec("low", low)?,
                    close: parse_dec("close", close)?,
                    volume: parse_dec("volume", volume)?,
                    trade_count: trade_count as u64,
                })
            })
            .collect()
    }

    fn position(&self, user_id: &str, agent_id: &str) -> Result<Option<Position>, StoreError> {
        let conn = self.lock();
        let row: Option<(String, String, String, String, String, Option<i64>)> = conn
            .query_row(
                "SELECT balance, total_invested, average_cost, realized_pnl, current_value,
                        last_trade_at_ms
                 FROM positions WHERE user_id = ?1 AND agent_id = ?2",
                params![user_id, agent_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(balance, invested, avg_cost, pnl, value, last_ms)| {
            Ok(Position {
                user_id: user_id.to_string(),
                agent_id: agent_id.to_string(),
                balance: parse_dec("balance", balance)?,
                total_invested: parse_dec("total_invested", invested)?,
                average_cost: parse_dec("average_cost", avg_cost)?,
                realized_pnl: parse_dec("realized_pnl", pnl)?,
                current_value: parse_dec("current_value", value)?,
                last_trade_at: last_ms.map(|ms| parse_ts("last_trade_at_ms", ms)).transpose()?,
            })
        })
        .transpose()
    }

    fn upsert_position(&self, position: &Position) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO positions
                (user_id, agent_id, balance, total_invested, average_cost,
                 realized_pnl, current_value, last_trade_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(user_id, agent_id) DO UPDATE SET
                balance = excluded.balance,
                total_invested = excluded.total_invested,
                average_cost = excluded.average_cost,
                realized_pnl = excluded.realized_pnl,
                current_value = excluded.current_value,
                last_trade_at_ms = excluded.last_trade_at_ms
            "#,
            params![
                position.user_id,
                position.agent_id,
                dec(&position.balance),
                dec(&position.total_invested),
                dec(&position.average_cost),
                dec(&position.realized_pnl),
                dec(&position.current_value),
                position.last_trade_at.map(|at| at.timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    fn positions_for_agent(&self, agent_id: &str) -> Result<Vec<Position>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id, balance, total_invested, average_cost, realized_pnl,
                    current_value, last_trade_at_ms
             FROM positions WHERE agent_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![agent_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<i64>>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(user_id, balance, invested, avg_cost, pnl, value, last_ms)| {
                Ok(Position {
                    user_id,
                    agent_id: agent_id.to_string(),
                    balance: parse_dec("balance", balance)?,
                    total_invested: parse_dec("total_invested", invested)?,
                    average_cost: parse_dec("average_cost", avg_cost)?,
                    realized_pnl: parse_dec("realized_pnl", pnl)?,
                    current_value: parse_dec("current_value", value)?,
                    last_trade_at: last_ms
                        .map(|ms| parse_ts("last_trade_at_ms", ms))
                        .transpose()?,
                })
            })
            .collect()
    }

    fn upsert_metrics(&self, metrics: &AgentMetrics) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO agent_metrics
                (agent_id, current_price, market_cap, volume_24h, price_change_24h,
                 holders, all_time_high, all_time_low, total_transactions, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(agent_id) DO UPDATE SET
                current_price = excluded.current_price,
                market_cap = excluded.market_cap,
                volume_24h = excluded.volume_24h,
                price_change_24h = excluded.price_change_24h,
                holders = excluded.holders,
                all_time_high = excluded.all_time_high,
                all_time_low = excluded.all_time_low,
                total_transactions = excluded.total_transactions,
                updated_at_ms = excluded.updated_at_ms
            "#,
            params![
                metrics.agent_id,
                dec(&metrics.current_price),
                dec(&metrics.market_cap),
                dec(&metrics.volume_24h),
                dec(&metrics.price_change_24h),
                metrics.holders as i64,
                dec(&metrics.all_time_high),
                dec(&metrics.all_time_low),
                metrics.total_transactions as i64,
                metrics.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn metrics(&self, agent_id: &str) -> Result<Option<AgentMetrics>, StoreError> {
        let conn = self.lock();
        let row: Option<(
            String,
            String,
            String,
            String,
            i64,
            String,
            String,
            i64,
            i64,
        )> = conn
            .query_row(
                "SELECT current_price, market_cap, volume_24h, price_change_24h, holders,
                        all_time_high, all_time_low, total_transactions, updated_at_ms
                 FROM agent_metrics WHERE agent_id = ?1",
                params![agent_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                    ))
                },
            )
            .optional()?;
        row.map(
            |(price, cap, volume, change, holders, high, low, txs, updated_ms)| {
                Ok(AgentMetrics {
                    agent_id: agent_id.to_string(),
                    current_price: parse_dec("current_price", price)?,
                    market_cap: parse_dec("market_cap", cap)?,
                    volume_24h: parse_dec("volume_24h", volume)?,
                    price_change_24h: parse_dec("price_change_24h", change)?,
                    holders: holders as u64,
                    all_time_high: parse_dec("all_time_high", high)?,
                    all_time_low: parse_dec("all_time_low", low)?,
                    total_transactions: txs as u64,
                    updated_at: parse_ts("updated_at_ms", updated_ms)?,
                })
            },
        )
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn trade(tx: &str, ts_min: u32) -> Trade {
        Trade {
            agent_id: "agent-a".into(),
            side: TradeSide::Buy {
                buyer: "wallet-1".into(),
            },
            base_amount: Decimal::from(10),
            quote_amount: Decimal::from(5),
            block_height: 99,
            tx_hash: tx.into(),
            timestamp: Utc.with_ymd_and_hms(2025, 3, 1, 10, ts_min, 0).unwrap(),
        }
    }

    #[test]
    fn trade_insert_is_idempotent() {
        let store = SqliteMarketStore::new_in_memory().unwrap();
        assert_eq!(store.insert_trade(&trade("tx-1", 0)).unwrap(), TradeWrite::Inserted);
        assert_eq!(
            store.insert_trade(&trade("tx-1", 0)).unwrap(),
            TradeWrite::Duplicate
        );
        assert_eq!(store.trade_count("agent-a").unwrap(), 1);
    }

    #[test]
    fn trades_round_trip_including_side() {
        let store = SqliteMarketStore::new_in_memory().unwrap();
        let mut sell = trade("tx-2", 5);
        sell.side = TradeSide::Sell {
            seller: "wallet-2".into(),
        };
        store.insert_trade(&trade("tx-1", 0)).unwrap();
        store.insert_trade(&sell).unwrap();

        let all = store
            .trades_since("agent-a", Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap())
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].tx_hash, "tx-1");
        assert_eq!(all[1].side, sell.side);
    }

    #[test]
    fn price_queries_respect_timestamps() {
        let store = SqliteMarketStore::new_in_memory().unwrap();
        let mut early = trade("tx-1", 0);
        early.quote_amount = Decimal::from(10);
        let mut late = trade("tx-2", 30);
        late.quote_amount = Decimal::from(40);
        store.insert_trade(&early).unwrap();
        store.insert_trade(&late).unwrap();

        assert_eq!(store.latest_price("agent-a").unwrap(), Some(Decimal::from(4)));
        let cutoff = Utc.with_ymd_and_hms(2025, 3, 1, 10, 15, 0).unwrap();
        assert_eq!(
            store.price_at_or_before("agent-a", cutoff).unwrap(),
            Some(Decimal::ONE)
        );
        assert_eq!(
            store.price_extremes("agent-a").unwrap(),
            Some((Decimal::ONE, Decimal::from(4)))
        );
    }

    #[test]
    fn candle_upsert_overwrites_by_key() {
        let store = SqliteMarketStore::new_in_memory().unwrap();
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let mut candle = Candle {
            agent_id: "agent-a".into(),
            timeframe: Timeframe::OneHour,
            interval_start: start,
            open: Decimal::from(5),
            high: Decimal::from(5),
            low: Decimal::from(5),
            close: Decimal::from(5),
            volume: Decimal::from(50),
            trade_count: 1,
        };
        store.upsert_candle(&candle).unwrap();
        candle.close = Decimal::from(8);
        candle.high = Decimal::from(8);
        candle.trade_count = 2;
        store.upsert_candle(&candle).unwrap();

        let loaded = store
            .candle("agent-a", Timeframe::OneHour, start)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.close, Decimal::from(8));
        assert_eq!(loaded.trade_count, 2);
        assert_eq!(store.candles("agent-a", Timeframe::OneHour, 10).unwrap().len(), 1);
    }

    #[test]
    fn positions_round_trip() {
        let store = SqliteMarketStore::new_in_memory().unwrap();
        let mut position = Position::empty("wallet-1", "agent-a");
        position.balance = Decimal::from(60);
        position.total_invested = Decimal::from(60);
        position.average_cost = Decimal::ONE;
        position.realized_pnl = Decimal::from(40);
        store.upsert_position(&position).unwrap();

        let loaded = store.position("wallet-1", "agent-a").unwrap().unwrap();
        assert_eq!(loaded, position);
        assert_eq!(store.positions_for_agent("agent-a").unwrap().len(), 1);
    }

    #[test]
    fn metrics_round_trip() {
        let store = SqliteMarketStore::new_in_memory().unwrap();
        let metrics = AgentMetrics {
            agent_id: "agent-a".into(),
            current_price: Decimal::new(5, 1),
            market_cap: Decimal::from(500_000_000),
            volume_24h: Decimal::from(1_234),
            price_change_24h: Decimal::new(125, 1),
            holders: 7,
            all_time_high: Decimal::ONE,
            all_time_low: Decimal::new(1, 2),
            total_transactions: 42,
            updated_at: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        };
        store.upsert_metrics(&metrics).unwrap();
        assert_eq!(store.metrics("agent-a").unwrap(), Some(metrics));
    }
}
