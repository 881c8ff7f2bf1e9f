//! The pipeline coordinator: owns the queues and cache, drains them on
//! independent timers, and sequences aggregation, accounting, rollup and
//! fanout.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Result};
use chrono::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use ursa_broadcast::FanoutHub;
use ursa_cache::TtlCache;
use ursa_candles::CandleAggregator;
use ursa_config::{CacheConfig, MetricsConfig, PipelineConfig};
use ursa_core::{AgentId, AgentMetrics, Clock, MarketEvent, Trade};
use ursa_metrics::MetricsRollup;
use ursa_portfolio::PortfolioLedger;
use ursa_store::{MarketStore, StoreError, TradeWrite};

use crate::queue::{BoundedQueue, OverflowPolicy, PushOutcome, QueueItem};
use crate::telemetry::PipelineMetrics;
use crate::PipelineError;

const TRADE_QUEUE: &str = "trades";
const CANDLE_QUEUE: &str = "candles";
const PORTFOLIO_QUEUE: &str = "portfolio";
const METRICS_QUEUE: &str = "metrics";

/// One drain stage; each runs on its own timer with its own queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Stage {
    Trades,
    Candles,
    Portfolio,
    Metrics,
    CacheSweep,
}

/// A running pipeline instance.
///
/// Spawns one worker task per queue plus a cache-maintenance loop. All
/// state is instance-owned so tests and parallel deployments never share
/// anything through globals.
pub struct MarketPipeline {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    stop_tx: watch::Sender<bool>,
}

/// Cloneable ingress handle for upstream event sources and subscribers.
#[derive(Clone)]
pub struct PipelineHandle {
    shared: Arc<Shared>,
}

struct Shared {
    config: PipelineConfig,
    store: Arc<dyn MarketStore>,
    clock: Arc<dyn Clock>,
    cache: TtlCache<AgentMetrics>,
    aggregator: CandleAggregator,
    ledger: PortfolioLedger,
    rollup: MetricsRollup,
    fanout: FanoutHub,
    metrics: PipelineMetrics,

    trade_queue: BoundedQueue<Trade>,
    candle_queue: BoundedQueue<Trade>,
    portfolio_queue: BoundedQueue<Trade>,
    metrics_queue: BoundedQueue<AgentId>,

    /// Wakes the trade loop early for the low-latency path.
    drain_nudge: Notify,
    draining: AtomicBool,
    stopping: AtomicBool,
    aggregate_pressured: AtomicBool,
}

impl MarketPipeline {
    /// Start the pipeline workers.
    pub fn spawn(
        config: PipelineConfig,
        cache_config: &CacheConfig,
        metrics_config: &MetricsConfig,
        store: Arc<dyn MarketStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = TtlCache::new(
            StdDuration::from_millis(cache_config.ttl_ms),
            cache_config.max_entries,
            clock.clone(),
        );
        let shared = Arc::new(Shared {
            aggregator: CandleAggregator::new(store.clone()),
            ledger: PortfolioLedger::new(store.clone()),
            rollup: MetricsRollup::new(store.clone(), clock.clone(), metrics_config.total_supply),
            fanout: FanoutHub::new(config.broadcast_capacity),
            cache,
            metrics: PipelineMetrics::new(),
            trade_queue: BoundedQueue::new(TRADE_QUEUE, config.max_queue_size, OverflowPolicy::Grow),
            candle_queue: BoundedQueue::new(
                CANDLE_QUEUE,
                config.max_queue_size,
                OverflowPolicy::ShedOldest,
            ),
            portfolio_queue: BoundedQueue::new(
                PORTFOLIO_QUEUE,
                config.max_queue_size,
                OverflowPolicy::Grow,
            ),
            metrics_queue: BoundedQueue::new(
                METRICS_QUEUE,
                config.max_queue_size,
                OverflowPolicy::ShedOldest,
            ),
            drain_nudge: Notify::new(),
            draining: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            aggregate_pressured: AtomicBool::new(false),
            store,
            clock,
            config,
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let workers = vec![
            spawn_stage(
                shared.clone(),
                stop_rx.clone(),
                Stage::Trades,
                shared.config.trade_drain_interval_ms,
            ),
            spawn_stage(
                shared.clone(),
                stop_rx.clone(),
                Stage::Candles,
                shared.config.candle_drain_interval_ms,
            ),
            spawn_stage(
                shared.clone(),
                stop_rx.clone(),
                Stage::Portfolio,
                shared.config.portfolio_drain_interval_ms,
            ),
            spawn_stage(
                shared.clone(),
                stop_rx.clone(),
                Stage::Metrics,
                shared.config.metrics_update_interval_ms,
            ),
            spawn_stage(
                shared.clone(),
                stop_rx,
                Stage::CacheSweep,
                cache_config.cleanup_interval_ms,
            ),
        ];
        info!(
            batch_size = shared.config.batch_size,
            max_queue_size = shared.config.max_queue_size,
            "market pipeline started"
        );
        Self {
            shared,
            workers,
            stop_tx,
        }
    }

    /// Handle for ingesting trades and subscribing to fanout channels.
    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            shared: self.shared.clone(),
        }
    }

    /// Stop the workers and drain all four queues to completion.
    ///
    /// Fails if the backlog cannot be flushed within the configured
    /// shutdown timeout.
    pub async fn shutdown(self) -> Result<()> {
        let Self {
            shared,
            workers,
            stop_tx,
        } = self;
        shared.stopping.store(true, Ordering::SeqCst);
        let _ = stop_tx.send(true);
        shared.drain_nudge.notify_waiters();

        let deadline = StdDuration::from_millis(shared.config.shutdown_timeout_ms.max(1));
        let flush = async {
            for worker in workers {
                let _ = worker.await;
            }
            // Flush in dependency order: the trade stage feeds the others.
            while !shared.trade_queue.is_empty() {
                shared.drain_trades(true).await;
            }
            while !shared.candle_queue.is_empty() {
                shared.drain_candles(true).await;
            }
            while !shared.portfolio_queue.is_empty() {
                shared.drain_portfolio(true).await;
            }
            while !shared.metrics_queue.is_empty() {
                shared.drain_metrics(true).await;
            }
            shared.cache.clear();
        };
        timeout(deadline, flush)
            .await
            .map_err(|_| anyhow!("pipeline shutdown timed out with items still queued"))?;
        info!("market pipeline drained and stopped");
        Ok(())
    }
}

impl PipelineHandle {
    /// Accept a verified trade from the upstream event source.
    ///
    /// Never blocks: the trade is validated, stamped and queued. The only
    /// error surfaced to the caller is a malformed payload (or a pipeline
    /// already shutting down); everything downstream is handled internally.
    pub fn ingest(&self, trade: Trade) -> Result<(), PipelineError> {
        self.shared.ingest(trade)
    }

    /// Subscribe to events for one agent.
    pub fn subscribe_agent(&self, agent_id: &str) -> tokio::sync::broadcast::Receiver<MarketEvent> {
        self.shared.fanout.subscribe_agent(agent_id)
    }

    /// Subscribe to the platform-wide feed.
    pub fn subscribe_platform(&self) -> tokio::sync::broadcast::Receiver<MarketEvent> {
        self.shared.fanout.subscribe_platform()
    }

    /// Most recent cached metrics snapshot for an agent, if still fresh.
    pub fn cached_metrics(&self, agent_id: &str) -> Option<AgentMetrics> {
        self.shared.cache.get(&metrics_cache_key(agent_id))
    }

    /// Prometheus registry for scraping pipeline counters.
    pub fn metrics_registry(&self) -> prometheus::Registry {
        self.shared.metrics.registry()
    }
}

fn metrics_cache_key(agent_id: &str) -> String {
    format!("metrics:{agent_id}")
}

impl Shared {
    fn ingest(&self, trade: Trade) -> Result<(), PipelineError> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(PipelineError::ShuttingDown);
        }
        if let Err(err) = trade.validate() {
            self.metrics.inc_rejected();
            return Err(err.into());
        }

        let now = self.clock.now();
        let outcome = self.trade_queue.push(trade, now);
        self.note_push(TRADE_QUEUE, outcome);
        self.metrics.inc_ingested();
        let depth = self.trade_queue.len();
        self.metrics.set_queue_depth(TRADE_QUEUE, depth);
        self.check_aggregate_pressure();

        // Low-latency path: a short, idle queue is drained immediately
        // instead of waiting out the timer.
        if depth < self.config.batch_size && !self.draining.load(Ordering::Relaxed) {
            self.drain_nudge.notify_one();
        }
        Ok(())
    }

    fn note_push(&self, queue: &'static str, outcome: PushOutcome) {
        if outcome.warned {
            self.metrics.inc_backpressure(queue);
        }
        if outcome.shed {
            self.metrics.inc_shed(queue);
        }
    }

    fn check_aggregate_pressure(&self) {
        let total = self.trade_queue.len()
            + self.candle_queue.len()
            + self.portfolio_queue.len()
            + self.metrics_queue.len();
        let capacity = self.config.max_queue_size * 4;
        if total >= capacity * 4 / 5 {
            if !self.aggregate_pressured.swap(true, Ordering::Relaxed) {
                warn!(
                    total,
                    capacity, "aggregate queue occupancy crossed 80% of capacity"
                );
                self.metrics.inc_backpressure("aggregate");
            }
        } else {
            self.aggregate_pressured.store(false, Ordering::Relaxed);
        }
    }

    async fn run_stage(&self, stage: Stage, ignore_delay: bool) {
        match stage {
            Stage::Trades => self.drain_trades(ignore_delay).await,
            Stage::Candles => self.drain_candles(ignore_delay).await,
            Stage::Portfolio => self.drain_portfolio(ignore_delay).await,
            Stage::Metrics => self.drain_metrics(ignore_delay).await,
            Stage::CacheSweep => {
                self.cache.sweep();
            }
        }
    }

    /// Pull a batch off the trade queue: duplicate-check each item, persist
    /// it, and enqueue downstream candle/portfolio/metrics work. Fanout is
    /// invoked once per completed batch to bound outbound volume.
    async fn drain_trades(&self, ignore_delay: bool) {
        self.draining.store(true, Ordering::Relaxed);
        let eligible = (!ignore_delay).then(|| self.clock.now());
        let batch = self.trade_queue.pop_batch(self.config.batch_size, eligible);
        let mut events = Vec::new();
        for item in batch {
            match self.process_trade(&item.payload) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(err) => self.handle_failure(TRADE_QUEUE, &self.trade_queue, item, err),
            }
        }
        if !events.is_empty() {
            self.metrics.add_broadcasts(events.len());
            self.fanout.publish_batch(&events);
        }
        self.metrics
            .set_queue_depth(TRADE_QUEUE, self.trade_queue.len());
        self.draining.store(false, Ordering::Relaxed);
    }

    fn process_trade(&self, trade: &Trade) -> Result<Option<MarketEvent>, StoreError> {
        match self.store.insert_trade(trade)? {
            TradeWrite::Duplicate => {
                self.metrics.inc_duplicate();
                debug!(tx = %trade.tx_hash, "duplicate trade ignored");
                Ok(None)
            }
            TradeWrite::Inserted => {
                let now = self.clock.now();
                let outcome = self.candle_queue.push(trade.clone(), now);
                self.note_push(CANDLE_QUEUE, outcome);
                let outcome = self.portfolio_queue.push(trade.clone(), now);
                self.note_push(PORTFOLIO_QUEUE, outcome);
                let outcome = self.metrics_queue.push(trade.agent_id.clone(), now);
                self.note_push(METRICS_QUEUE, outcome);
                self.check_aggregate_pressure();
                Ok(Some(MarketEvent::trade_executed(trade.clone(), now)))
            }
        }
    }

    /// Apply queued trades to candles, oldest event first.
    ///
    /// The batch is ordered by `(timestamp, block_height)` so open/close
    /// semantics follow event time even when retries perturb arrival order.
    async fn drain_candles(&self, ignore_delay: bool) {
        let eligible = (!ignore_delay).then(|| self.clock.now());
        let mut batch = self.candle_queue.pop_batch(self.config.batch_size, eligible);
        batch.sort_by_key(|item| (item.payload.timestamp, item.payload.block_height));
        for item in batch {
            match self.aggregator.apply_trade(&item.payload) {
                Ok(candles) => self.metrics.add_candles(candles.len()),
                Err(err) => self.handle_failure(CANDLE_QUEUE, &self.candle_queue, item, err),
            }
        }
        self.metrics
            .set_queue_depth(CANDLE_QUEUE, self.candle_queue.len());
    }

    /// Apply queued trades to trader positions and refresh holder
    /// valuations at the latest price.
    async fn drain_portfolio(&self, ignore_delay: bool) {
        let eligible = (!ignore_delay).then(|| self.clock.now());
        let mut batch = self
            .portfolio_queue
            .pop_batch(self.config.batch_size, eligible);
        batch.sort_by_key(|item| (item.payload.timestamp, item.payload.block_height));
        for item in batch {
            match self.ledger.apply_trade(&item.payload).await {
                Ok(_) => {
                    self.metrics.inc_position();
                    let price = item.payload.price();
                    if let Err(err) = self.ledger.revalue_agent(&item.payload.agent_id, price) {
                        // Valuation refresh is advisory; the next trade on
                        // this agent repeats it.
                        warn!(agent = %item.payload.agent_id, error = %err, "holder revaluation failed");
                    }
                }
                Err(err) => self.handle_failure(PORTFOLIO_QUEUE, &self.portfolio_queue, item, err),
            }
        }
        self.metrics
            .set_queue_depth(PORTFOLIO_QUEUE, self.portfolio_queue.len());
    }

    /// Recompute metrics for every agent touched since the last tick.
    async fn drain_metrics(&self, ignore_delay: bool) {
        let eligible = (!ignore_delay).then(|| self.clock.now());
        let batch = self
            .metrics_queue
            .pop_batch(self.config.max_queue_size, eligible);
        if batch.is_empty() {
            return;
        }
        // Several trades for one agent collapse into a single recompute.
        let mut seen = HashSet::new();
        let mut events = Vec::new();
        for item in batch {
            if !seen.insert(item.payload.clone()) {
                continue;
            }
            match self.rollup.recompute(&item.payload) {
                Ok(metrics) => {
                    self.cache.invalidate(&format!("metrics:{}*", item.payload));
                    self.cache
                        .set(metrics_cache_key(&item.payload), metrics.clone());
                    self.metrics.inc_metrics_refreshed();
                    events.push(MarketEvent::metrics_updated(metrics, self.clock.now()));
                }
                Err(err) => self.handle_failure(METRICS_QUEUE, &self.metrics_queue, item, err),
            }
        }
        if !events.is_empty() {
            self.metrics.add_broadcasts(events.len());
            self.fanout.publish_batch(&events);
        }
        self.metrics
            .set_queue_depth(METRICS_QUEUE, self.metrics_queue.len());
    }

    /// Re-enqueue a failed item if the error is transient and retries
    /// remain; otherwise drop it with an error signal. Failures are never
    /// propagated back to the event source.
    fn handle_failure<T>(
        &self,
        queue_name: &'static str,
        queue: &BoundedQueue<T>,
        mut item: QueueItem<T>,
        err: StoreError,
    ) {
        if err.is_transient() && item.retry_count < self.config.max_retries {
            item.retry_count += 1;
            item.not_before =
                self.clock.now() + Duration::milliseconds(self.config.retry_delay_ms as i64);
            warn!(
                queue = queue_name,
                retry = item.retry_count,
                error = %err,
                "transient failure; item re-enqueued"
            );
            queue.requeue(item);
            self.metrics.inc_retried(queue_name);
        } else {
            error!(
                queue = queue_name,
                retries = item.retry_count,
                error = %err,
                "dropping item after failure"
            );
            self.metrics.inc_dropped(queue_name);
        }
    }
}

fn spawn_stage(
    shared: Arc<Shared>,
    mut stop: watch::Receiver<bool>,
    stage: Stage,
    interval_ms: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = interval(StdDuration::from_millis(interval_ms.max(1)));
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if stage == Stage::Trades {
                tokio::select! {
                    _ = timer.tick() => {}
                    _ = shared.drain_nudge.notified() => {}
                    _ = stop.changed() => break,
                }
            } else {
                tokio::select! {
                    _ = timer.tick() => {}
                    _ = stop.changed() => break,
                }
            }
            shared.run_stage(stage, false).await;
        }
        debug!(?stage, "pipeline stage stopped");
    })
}
