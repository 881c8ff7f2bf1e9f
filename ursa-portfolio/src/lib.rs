//! Per-(user, agent) position accounting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rust_decimal::Decimal;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::warn;

use ursa_core::{Position, Price, Side, Trade};
use ursa_store::{MarketStore, StoreError};

/// Fold a trade into a position.
///
/// Buys move the average cost; sells realize P&L against it and leave the
/// average untouched. A sell larger than the tracked balance is clamped
/// (`sell_ratio` capped at 1) rather than rejected, since upstream ordering
/// is only eventually consistent; the discrepancy is logged for offline
/// reconciliation.
pub fn apply_to_position(position: &mut Position, trade: &Trade) {
    let price = trade.price();
    match trade.side.side() {
        Side::Buy => {
            position.balance += trade.base_amount;
            position.total_invested += trade.quote_amount;
            // Post-buy balance is always positive.
            position.average_cost = position.total_invested / position.balance;
        }
        Side::Sell => {
            if trade.base_amount > position.balance {
                warn!(
                    user = %position.user_id,
                    agent = %position.agent_id,
                    tx = %trade.tx_hash,
                    balance = %position.balance,
                    sold = %trade.base_amount,
                    "sell exceeds tracked balance; clamping"
                );
            }
            let sell_ratio = if position.balance > Decimal::ZERO {
                (trade.base_amount / position.balance).min(Decimal::ONE)
            } else {
                Decimal::ONE
            };
            let cost_basis_sold = position.average_cost * trade.base_amount;
            position.balance = (position.balance - trade.base_amount).max(Decimal::ZERO);
            position.total_invested *= Decimal::ONE - sell_ratio;
            position.realized_pnl += trade.quote_amount - cost_basis_sold;
        }
    }
    position.current_value = position.balance * price;
    position.last_trade_at = Some(trade.timestamp);
}

/// Serializes concurrent access per `(user, agent)` key.
#[derive(Default)]
struct KeyedLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    async fn acquire(&self, key: String) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().expect("keyed lock map poisoned");
            map.entry(key).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Maintains position state from trade deltas.
///
/// Positions are mutated only through this ledger; each `(user, agent)` key
/// is updated under its own critical section so concurrent buy/sell
/// processing for one user never loses updates, while distinct users and
/// agents proceed in parallel.
pub struct PortfolioLedger {
    store: Arc<dyn MarketStore>,
    locks: KeyedLocks,
}

impl PortfolioLedger {
    pub fn new(store: Arc<dyn MarketStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::default(),
        }
    }

    /// Apply one trade to its trader's position and persist the result.
    pub async fn apply_trade(&self, trade: &Trade) -> Result<Position, StoreError> {
        let user_id = trade.side.trader().clone();
        let key = format!("{user_id}:{}", trade.agent_id);
        let _guard = self.locks.acquire(key).await;

        let mut position = self
            .store
            .position(&user_id, &trade.agent_id)?
            .unwrap_or_else(|| Position::empty(user_id.clone(), trade.agent_id.clone()));
        apply_to_position(&mut position, trade);
        self.store.upsert_position(&position)?;
        Ok(position)
    }

    /// Refresh `current_value` for every holder of an agent at the latest
    /// price. Called once per trade affecting the agent, so valuations track
    /// the market even for users who did not trade.
    pub fn revalue_agent(&self, agent_id: &str, price: Price) -> Result<usize, StoreError> {
        let mut updated = 0;
        for mut position in self.store.positions_for_agent(agent_id)? {
            let value = position.balance * price;
            if value != position.current_value {
                position.current_value = value;
                self.store.upsert_position(&position)?;
                updated += 1;
            }
        }
        Ok(updated)
    }
}
