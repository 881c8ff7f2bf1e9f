//! OHLCV aggregation across parallel timeframes.

use std::sync::Arc;

use tracing::trace;

use ursa_core::{Candle, Timeframe, Trade};
use ursa_store::{MarketStore, StoreError};

/// Fold one trade into the candle for a single timeframe.
///
/// Seeds a fresh candle when none exists for the trade's interval;
/// otherwise updates the running extrema, close, volume and trade count.
/// Volume accumulates in quote-asset units.
#[must_use]
pub fn fold_trade(existing: Option<Candle>, trade: &Trade, timeframe: Timeframe) -> Candle {
    let price = trade.price();
    let interval_start = timeframe.interval_start(trade.timestamp);
    match existing {
        Some(mut candle) => {
            candle.high = candle.high.max(price);
            candle.low = candle.low.min(price);
            candle.close = price;
            candle.volume += trade.quote_amount;
            candle.trade_count += 1;
            candle
        }
        None => Candle {
            agent_id: trade.agent_id.clone(),
            timeframe,
            interval_start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: trade.quote_amount,
            trade_count: 1,
        },
    }
}

/// Converts trades into candle updates for every supported timeframe.
///
/// Candle rows are mutated only through this component; the pipeline's
/// single-consumer drain keeps per-`(agent, timeframe, interval)` updates
/// serialized.
pub struct CandleAggregator {
    store: Arc<dyn MarketStore>,
}

impl CandleAggregator {
    pub fn new(store: Arc<dyn MarketStore>) -> Self {
        Self { store }
    }

    /// Apply a single trade across all timeframes, returning the updated
    /// candles.
    pub fn apply_trade(&self, trade: &Trade) -> Result<Vec<Candle>, StoreError> {
        let mut updated = Vec::with_capacity(Timeframe::ALL.len());
        for timeframe in Timeframe::ALL {
            let interval_start = timeframe.interval_start(trade.timestamp);
            let existing = self
                .store
                .candle(&trade.agent_id, timeframe, interval_start)?;
            let candle = fold_trade(existing, trade, timeframe);
            self.store.upsert_candle(&candle)?;
            trace!(
                agent = %trade.agent_id,
                timeframe = %timeframe,
                close = %candle.close,
                "candle updated"
            );
            updated.push(candle);
        }
        Ok(updated)
    }
}
