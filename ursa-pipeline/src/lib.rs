//! Real-time trade ingestion and aggregation pipeline.
//!
//! Converts verified on-chain trade events into consistent market state
//! (candles, positions and derived agent metrics) and fans updates out to
//! subscribers. Four bounded FIFO queues drain on independent cadences under
//! a single coordinator that owns batching, retry, backpressure signaling
//! and graceful shutdown.

use thiserror::Error;

use ursa_core::InvalidTrade;

mod coordinator;
mod queue;
pub mod telemetry;

pub use coordinator::{MarketPipeline, PipelineHandle};
pub use queue::{BoundedQueue, OverflowPolicy, PushOutcome, QueueItem};

/// Failures surfaced synchronously to ingest callers.
///
/// Everything else (transient store errors, duplicates, aggregation
/// inconsistencies) is internal and observable through logs and counters
/// only, so a slow store never stalls the upstream event source.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid trade: {0}")]
    Invalid(#[from] InvalidTrade),
    #[error("pipeline is shutting down")]
    ShuttingDown,
}
