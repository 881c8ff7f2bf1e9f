//! Tracing setup and Prometheus instrumentation for the pipeline.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use prometheus::{IntCounter, IntCounterVec, IntGaugeVec, Registry};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global tracing subscriber with optional JSON file logging.
pub fn init_tracing(filter: &str, log_path: Option<&Path>) -> Result<()> {
    if let Some(path) = log_path {
        let stdout_layer = fmt::layer()
            .with_target(false)
            .with_filter(EnvFilter::new(filter));
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {dir:?}"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        let _ = FILE_GUARD.set(guard);
        let file_layer = fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_writer(writer)
            .with_filter(EnvFilter::new(filter));
        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .try_init()?;
    } else {
        let stdout_layer = fmt::layer()
            .with_target(false)
            .with_filter(EnvFilter::new(filter));
        tracing_subscriber::registry()
            .with(stdout_layer)
            .try_init()?;
    }

    Ok(())
}

/// Counters and gauges exposed by a running pipeline.
pub struct PipelineMetrics {
    registry: Registry,
    trades_ingested: IntCounter,
    trades_rejected: IntCounter,
    duplicate_trades: IntCounter,
    items_retried: IntCounterVec,
    items_dropped: IntCounterVec,
    items_shed: IntCounterVec,
    backpressure_events: IntCounterVec,
    queue_depth: IntGaugeVec,
    candles_updated: IntCounter,
    positions_updated: IntCounter,
    metrics_refreshed: IntCounter,
    broadcast_messages: IntCounter,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let trades_ingested =
            IntCounter::new("ursa_trades_ingested_total", "Trades accepted by ingest").unwrap();
        let trades_rejected = IntCounter::new(
            "ursa_trades_rejected_total",
            "Trades rejected at the ingest boundary",
        )
        .unwrap();
        let duplicate_trades = IntCounter::new(
            "ursa_duplicate_trades_total",
            "Trades skipped because their tx hash was already recorded",
        )
        .unwrap();
        let items_retried = IntCounterVec::new(
            prometheus::Opts::new("ursa_items_retried_total", "Queue items re-enqueued"),
            &["queue"],
        )
        .unwrap();
        let items_dropped = IntCounterVec::new(
            prometheus::Opts::new(
                "ursa_items_dropped_total",
                "Queue items dropped after exhausting retries",
            ),
            &["queue"],
        )
        .unwrap();
        let items_shed = IntCounterVec::new(
            prometheus::Opts::new(
                "ursa_items_shed_total",
                "Advisory queue items evicted at capacity",
            ),
            &["queue"],
        )
        .unwrap();
        let backpressure_events = IntCounterVec::new(
            prometheus::Opts::new(
                "ursa_backpressure_events_total",
                "Occupancy threshold crossings",
            ),
            &["queue"],
        )
        .unwrap();
        let queue_depth = IntGaugeVec::new(
            prometheus::Opts::new("ursa_queue_depth", "Current queue occupancy"),
            &["queue"],
        )
        .unwrap();
        let candles_updated =
            IntCounter::new("ursa_candles_updated_total", "Candle upserts applied").unwrap();
        let positions_updated =
            IntCounter::new("ursa_positions_updated_total", "Position updates applied").unwrap();
        let metrics_refreshed = IntCounter::new(
            "ursa_metrics_refreshed_total",
            "Agent metric snapshots recomputed",
        )
        .unwrap();
        let broadcast_messages = IntCounter::new(
            "ursa_broadcast_messages_total",
            "Events handed to the fanout hub",
        )
        .unwrap();

        registry.register(Box::new(trades_ingested.clone())).unwrap();
        registry.register(Box::new(trades_rejected.clone())).unwrap();
        registry.register(Box::new(duplicate_trades.clone())).unwrap();
        registry.register(Box::new(items_retried.clone())).unwrap();
        registry.register(Box::new(items_dropped.clone())).unwrap();
        registry.register(Box::new(items_shed.clone())).unwrap();
        registry
            .register(Box::new(backpressure_events.clone()))
            .unwrap();
        registry.register(Box::new(queue_depth.clone())).unwrap();
        registry.register(Box::new(candles_updated.clone())).unwrap();
        registry
            .register(Box::new(positions_updated.clone()))
            .unwrap();
        registry
            .register(Box::new(metrics_refreshed.clone()))
            .unwrap();
        registry
            .register(Box::new(broadcast_messages.clone()))
            .unwrap();

        Self {
            registry,
            trades_ingested,
            trades_rejected,
            duplicate_trades,
            items_retried,
            items_dropped,
            items_shed,
            backpressure_events,
            queue_depth,
            candles_updated,
            positions_updated,
            metrics_refreshed,
            broadcast_messages,
        }
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    pub fn inc_ingested(&self) {
        self.trades_ingested.inc();
    }

    pub fn inc_rejected(&self) {
        self.trades_rejected.inc();
    }

    pub fn inc_duplicate(&self) {
        self.duplicate_trades.inc();
    }

    pub fn inc_retried(&self, queue: &str) {
        self.items_retried.with_label_values(&[queue]).inc();
    }

    pub fn inc_dropped(&self, queue: &str) {
        self.items_dropped.with_label_values(&[queue]).inc();
    }

    pub fn inc_shed(&self, queue: &str) {
        self.items_shed.with_label_values(&[queue]).inc();
    }

    pub fn inc_backpressure(&self, queue: &str) {
        self.backpressure_events.with_label_values(&[queue]).inc();
    }

    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        self.queue_depth
            .with_label_values(&[queue])
            .set(depth as i64);
    }

    pub fn add_candles(&self, count: usize) {
        self.candles_updated.inc_by(count as u64);
    }

    pub fn inc_position(&self) {
        self.positions_updated.inc();
    }

    pub fn inc_metrics_refreshed(&self) {
        self.metrics_refreshed.inc();
    }

    pub fn add_broadcasts(&self, count: usize) {
        self.broadcast_messages.inc_by(count as u64);
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
