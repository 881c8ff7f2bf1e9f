//! Derived per-agent statistics, recomputed from trade and position history.
//!
//! The rollup is a pure function of stored history: it can run from scratch
//! at any time and is never a write-path dependency for candle or position
//! correctness. Snapshots are advisory and treated as cache downstream.

use std::sync::Arc;

use chrono::Duration;
use rust_decimal::Decimal;
use tracing::debug;

use ursa_core::{AgentMetrics, Clock, Price, Quantity};
use ursa_store::{MarketStore, StoreError};

/// Recomputes [`AgentMetrics`] snapshots on a coarse cadence.
pub struct MetricsRollup {
    store: Arc<dyn MarketStore>,
    clock: Arc<dyn Clock>,
    /// Fixed token supply backing market-cap derivation.
    total_supply: Quantity,
}

impl MetricsRollup {
    pub fn new(store: Arc<dyn MarketStore>, clock: Arc<dyn Clock>, total_supply: u64) -> Self {
        Self {
            store,
            clock,
            total_supply: Quantity::from(total_supply),
        }
    }

    /// Recompute every metric for one agent from stored history and persist
    /// the snapshot.
    pub fn recompute(&self, agent_id: &str) -> Result<AgentMetrics, StoreError> {
        let now = self.clock.now();
        let window_start = now - Duration::hours(24);

        let current_price = self.store.latest_price(agent_id)?.unwrap_or(Decimal::ZERO);
        let market_cap = current_price * self.total_supply;

        let window = self.store.trades_since(agent_id, window_start)?;
        let volume_24h: Price = window.iter().map(|trade| trade.quote_amount).sum();

        // Reference price for the 24h change: last trade at or before the
        // window start, falling back to the first trade inside the window
        // for agents younger than 24 hours.
        let reference_price = match self.store.price_at_or_before(agent_id, window_start)? {
            Some(price) => Some(price),
            None => window.first().map(|trade| trade.price()),
        };
        let price_change_24h = match reference_price {
            Some(reference) if reference > Decimal::ZERO => {
                (current_price - reference) / reference * Decimal::from(100)
            }
            _ => Decimal::ZERO,
        };

        let (all_time_low, all_time_high) = self
            .store
            .price_extremes(agent_id)?
            .unwrap_or((Decimal::ZERO, Decimal::ZERO));

        let holders = self
            .store
            .positions_for_agent(agent_id)?
            .iter()
            .filter(|position| position.is_holder())
            .count() as u64;

        let metrics = AgentMetrics {
            agent_id: agent_id.to_string(),
            current_price,
            market_cap,
            volume_24h,
            price_change_24h,
            holders,
            all_time_high,
            all_time_low,
            total_transactions: self.store.trade_count(agent_id)?,
            updated_at: now,
        };
        self.store.upsert_metrics(&metrics)?;
        debug!(
            agent = %agent_id,
            price = %metrics.current_price,
            volume_24h = %metrics.volume_24h,
            holders = metrics.holders,
            "metrics recomputed"
        );
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use ursa_core::{ManualClock, Position, Trade, TradeSide};
    use ursa_store::SqliteMarketStore;

    fn trade(tx: &str, at: DateTime<Utc>, base: i64, quote: i64) -> Trade {
        Trade {
            agent_id: "agent-a".into(),
            side: TradeSide::Buy {
                buyer: format!("wallet-{tx}"),
            },
            base_amount: Decimal::from(base),
            quote_amount: Decimal::from(quote),
            block_height: at.timestamp() as u64,
            tx_hash: tx.into(),
            timestamp: at,
        }
    }

    fn fixture() -> (Arc<SqliteMarketStore>, Arc<ManualClock>, MetricsRollup) {
        let store = Arc::new(SqliteMarketStore::new_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 5, 2, 12, 0, 0).unwrap(),
        ));
        let rollup = MetricsRollup::new(store.clone(), clock.clone(), 1_000_000_000);
        (store, clock, rollup)
    }

    #[test]
    fn recompute_covers_every_field() {
        let (store, clock, rollup) = fixture();
        let now = clock.now();
        // One trade outside the 24h window, two inside.
        store
            .insert_trade(&trade("tx-0", now - Duration::hours(30), 10, 10))
            .unwrap();
        store
            .insert_trade(&trade("tx-1", now - Duration::hours(2), 10, 20))
            .unwrap();
        store
            .insert_trade(&trade("tx-2", now - Duration::hours(1), 10, 40))
            .unwrap();
        let mut position = Position::empty("wallet-tx-1", "agent-a");
        position.balance = Decimal::from(10);
        store.upsert_position(&position).unwrap();
        store
            .upsert_position(&Position::empty("wallet-tx-2", "agent-a"))
            .unwrap();

        let metrics = rollup.recompute("agent-a").unwrap();
        assert_eq!(metrics.current_price, Decimal::from(4));
        assert_eq!(metrics.market_cap, Decimal::from(4_000_000_000i64));
        assert_eq!(metrics.volume_24h, Decimal::from(60));
        // Reference price 1 (the trade 30h ago) -> +300%.
        assert_eq!(metrics.price_change_24h, Decimal::from(300));
        assert_eq!(metrics.all_time_low, Decimal::ONE);
        assert_eq!(metrics.all_time_high, Decimal::from(4));
        // Zero-balance positions do not count as holders.
        assert_eq!(metrics.holders, 1);
        assert_eq!(metrics.total_transactions, 3);
    }

    #[test]
    fn young_agents_reference_their_first_window_trade() {
        let (store, clock, rollup) = fixture();
        let now = clock.now();
        store
            .insert_trade(&trade("tx-1", now - Duration::hours(3), 10, 20))
            .unwrap();
        store
            .insert_trade(&trade("tx-2", now - Duration::hours(1), 10, 30))
            .unwrap();

        let metrics = rollup.recompute("agent-a").unwrap();
        // (3 - 2) / 2 = +50%.
        assert_eq!(metrics.price_change_24h, Decimal::from(50));
    }

    #[test]
    fn recompute_is_stable_under_replay() {
        let (store, clock, rollup) = fixture();
        let now = clock.now();

        // Incremental path: recompute after each trade.
        let trades = [
            trade("tx-1", now - Duration::hours(5), 10, 10),
            trade("tx-2", now - Duration::hours(3), 5, 15),
            trade("tx-3", now - Duration::hours(1), 2, 10),
        ];
        let mut incremental = None;
        for t in &trades {
            store.insert_trade(t).unwrap();
            incremental = Some(rollup.recompute("agent-a").unwrap());
        }

        // From-scratch path over the same history.
        let from_scratch = rollup.recompute("agent-a").unwrap();
        assert_eq!(incremental.unwrap(), from_scratch);
    }

    #[test]
    fn agent_without_trades_yields_zeroed_metrics() {
        let (_store, _clock, rollup) = fixture();
        let metrics = rollup.recompute("agent-a").unwrap();
        assert_eq!(metrics.current_price, Decimal::ZERO);
        assert_eq!(metrics.volume_24h, Decimal::ZERO);
        assert_eq!(metrics.total_transactions, 0);
    }
}
