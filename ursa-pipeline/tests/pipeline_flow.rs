use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::time::sleep;

use ursa_config::{CacheConfig, MetricsConfig, PipelineConfig};
use ursa_core::{MarketEventKind, SystemClock, Timeframe, Trade, TradeSide};
use ursa_pipeline::{MarketPipeline, PipelineError};
use ursa_store::{MarketStore, SqliteMarketStore};

const AGENT: &str = "AgentMint1111";

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        batch_size: 50,
        max_retries: 3,
        retry_delay_ms: 10,
        max_queue_size: 1_000,
        trade_drain_interval_ms: 10,
        candle_drain_interval_ms: 10,
        portfolio_drain_interval_ms: 10,
        metrics_update_interval_ms: 50,
        shutdown_timeout_ms: 5_000,
        broadcast_capacity: 64,
    }
}

fn spawn_pipeline(store: Arc<SqliteMarketStore>) -> MarketPipeline {
    MarketPipeline::spawn(
        fast_config(),
        &CacheConfig::default(),
        &MetricsConfig::default(),
        store,
        Arc::new(SystemClock),
    )
}

/// A timestamp safely inside the current hour so both trades land in the
/// same hourly candle.
fn in_current_hour(offset_secs: i64) -> DateTime<Utc> {
    Timeframe::OneHour.interval_start(Utc::now()) + chrono::Duration::seconds(offset_secs)
}

fn buy(tx: &str, at: DateTime<Utc>, base: i64, quote: i64) -> Trade {
    Trade {
        agent_id: AGENT.into(),
        side: TradeSide::Buy {
            buyer: "Wallet1111".into(),
        },
        base_amount: Decimal::from(base),
        quote_amount: Decimal::from(quote),
        block_height: at.timestamp() as u64,
        tx_hash: tx.into(),
        timestamp: at,
    }
}

#[tokio::test]
async fn trades_flow_through_to_candles_positions_and_metrics() {
    let _ = ursa_pipeline::telemetry::init_tracing("warn", None);
    let store = Arc::new(SqliteMarketStore::new_in_memory().unwrap());
    let pipeline = spawn_pipeline(store.clone());
    let handle = pipeline.handle();
    let registry = handle.metrics_registry();
    let mut platform_rx = handle.subscribe_platform();

    let t0 = in_current_hour(1);
    handle.ingest(buy("tx-1", t0, 1, 5)).unwrap();
    handle
        .ingest(buy("tx-2", t0 + chrono::Duration::seconds(30), 1, 8))
        .unwrap();

    sleep(Duration::from_millis(300)).await;
    pipeline.shutdown().await.unwrap();

    // Candle: both trades share the hourly interval.
    let candle = store
        .candle(AGENT, Timeframe::OneHour, Timeframe::OneHour.interval_start(t0))
        .unwrap()
        .expect("hourly candle");
    assert_eq!(candle.open, Decimal::from(5));
    assert_eq!(candle.high, Decimal::from(8));
    assert_eq!(candle.low, Decimal::from(5));
    assert_eq!(candle.close, Decimal::from(8));
    assert_eq!(candle.volume, Decimal::from(13));
    assert_eq!(candle.trade_count, 2);

    // Position: two buys accumulated.
    let position = store.position("Wallet1111", AGENT).unwrap().expect("position");
    assert_eq!(position.balance, Decimal::from(2));
    assert_eq!(position.total_invested, Decimal::from(13));

    // Metrics snapshot recomputed from history.
    let metrics = store.metrics(AGENT).unwrap().expect("metrics snapshot");
    assert_eq!(metrics.total_transactions, 2);
    assert_eq!(metrics.current_price, Decimal::from(8));
    assert_eq!(metrics.volume_24h, Decimal::from(13));
    assert_eq!(metrics.holders, 1);

    // Fanout delivered trade events on the platform channel.
    let mut trade_events = 0;
    while let Ok(event) = platform_rx.try_recv() {
        if event.kind == MarketEventKind::TradeExecuted {
            trade_events += 1;
        }
        assert_eq!(event.agent_address, AGENT);
    }
    assert_eq!(trade_events, 2);

    // Operational counters tracked the flow.
    let ingested = registry
        .gather()
        .into_iter()
        .find(|family| family.get_name() == "ursa_trades_ingested_total")
        .expect("ingest counter");
    assert_eq!(ingested.get_metric()[0].get_counter().get_value() as u64, 2);
}

#[tokio::test]
async fn reingesting_the_same_tx_hash_is_a_no_op() {
    let store = Arc::new(SqliteMarketStore::new_in_memory().unwrap());
    let pipeline = spawn_pipeline(store.clone());
    let handle = pipeline.handle();

    let trade = buy("tx-dup", in_current_hour(1), 100, 100);
    handle.ingest(trade.clone()).unwrap();
    sleep(Duration::from_millis(150)).await;
    // Second delivery of the same event, long after the first committed.
    handle.ingest(trade).unwrap();
    sleep(Duration::from_millis(150)).await;
    pipeline.shutdown().await.unwrap();

    assert_eq!(store.trade_count(AGENT).unwrap(), 1);

    let candle = store
        .candle(
            AGENT,
            Timeframe::OneHour,
            Timeframe::OneHour.interval_start(in_current_hour(1)),
        )
        .unwrap()
        .expect("hourly candle");
    assert_eq!(candle.trade_count, 1);

    let position = store.position("Wallet1111", AGENT).unwrap().expect("position");
    assert_eq!(position.balance, Decimal::from(100));
}

#[tokio::test]
async fn invalid_trades_are_rejected_synchronously() {
    let store = Arc::new(SqliteMarketStore::new_in_memory().unwrap());
    let pipeline = spawn_pipeline(store.clone());
    let handle = pipeline.handle();

    let mut bad = buy("tx-bad", in_current_hour(1), 1, 1);
    bad.base_amount = Decimal::ZERO;
    assert!(matches!(
        handle.ingest(bad),
        Err(PipelineError::Invalid(_))
    ));

    let mut no_hash = buy("", in_current_hour(1), 1, 1);
    no_hash.tx_hash.clear();
    assert!(matches!(
        handle.ingest(no_hash),
        Err(PipelineError::Invalid(_))
    ));

    pipeline.shutdown().await.unwrap();
    assert_eq!(store.trade_count(AGENT).unwrap(), 0);
}

#[tokio::test]
async fn shutdown_drains_pending_work() {
    let store = Arc::new(SqliteMarketStore::new_in_memory().unwrap());
    // Timers so slow they will not fire during the test: everything must be
    // flushed by the shutdown drain itself.
    let config = PipelineConfig {
        trade_drain_interval_ms: 60_000,
        candle_drain_interval_ms: 60_000,
        portfolio_drain_interval_ms: 60_000,
        metrics_update_interval_ms: 60_000,
        ..fast_config()
    };
    let pipeline = MarketPipeline::spawn(
        config,
        &CacheConfig::default(),
        &MetricsConfig::default(),
        store.clone(),
        Arc::new(SystemClock),
    );
    let handle = pipeline.handle();

    for i in 0..10 {
        handle
            .ingest(buy(&format!("tx-{i}"), in_current_hour(i), 1, 2))
            .unwrap();
    }
    pipeline.shutdown().await.unwrap();

    assert_eq!(store.trade_count(AGENT).unwrap(), 10);
    let position = store.position("Wallet1111", AGENT).unwrap().expect("position");
    assert_eq!(position.balance, Decimal::from(10));
    assert!(store.metrics(AGENT).unwrap().is_some());
}

#[tokio::test]
async fn candle_open_close_follow_event_time_not_arrival_order() {
    let store = Arc::new(SqliteMarketStore::new_in_memory().unwrap());
    // Slow timers keep both trades in one batch, drained at shutdown.
    let config = PipelineConfig {
        trade_drain_interval_ms: 60_000,
        candle_drain_interval_ms: 60_000,
        portfolio_drain_interval_ms: 60_000,
        metrics_update_interval_ms: 60_000,
        ..fast_config()
    };
    let pipeline = MarketPipeline::spawn(
        config,
        &CacheConfig::default(),
        &MetricsConfig::default(),
        store.clone(),
        Arc::new(SystemClock),
    );
    let handle = pipeline.handle();
    // Let each stage consume its immediate first tick so nothing drains
    // between the two ingests below.
    sleep(Duration::from_millis(100)).await;

    let early = in_current_hour(1);
    let late = in_current_hour(40);
    // The later trade (price 12) arrives before the earlier one (price 10).
    handle.ingest(buy("tx-late", late, 1, 12)).unwrap();
    handle.ingest(buy("tx-early", early, 1, 10)).unwrap();
    pipeline.shutdown().await.unwrap();

    let candle = store
        .candle(
            AGENT,
            Timeframe::OneHour,
            Timeframe::OneHour.interval_start(early),
        )
        .unwrap()
        .expect("hourly candle");
    assert_eq!(candle.open, Decimal::from(10));
    assert_eq!(candle.close, Decimal::from(12));
    assert_eq!(candle.high, Decimal::from(12));
    assert_eq!(candle.low, Decimal::from(10));
}

#[tokio::test]
async fn metrics_snapshots_are_cached_for_readers() {
    let store = Arc::new(SqliteMarketStore::new_in_memory().unwrap());
    let pipeline = spawn_pipeline(store.clone());
    let handle = pipeline.handle();

    handle
        .ingest(buy("tx-1", in_current_hour(1), 10, 20))
        .unwrap();
    sleep(Duration::from_millis(300)).await;

    let cached = handle.cached_metrics(AGENT).expect("cached snapshot");
    assert_eq!(cached.current_price, Decimal::from(2));
    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn agent_subscribers_only_see_their_agent() {
    let store = Arc::new(SqliteMarketStore::new_in_memory().unwrap());
    let pipeline = spawn_pipeline(store.clone());
    let handle = pipeline.handle();
    let mut other_rx = handle.subscribe_agent("SomeOtherAgent");
    let mut agent_rx = handle.subscribe_agent(AGENT);

    handle
        .ingest(buy("tx-1", in_current_hour(1), 1, 2))
        .unwrap();
    sleep(Duration::from_millis(200)).await;
    pipeline.shutdown().await.unwrap();

    assert!(agent_rx.try_recv().is_ok());
    assert!(other_rx.try_recv().is_err());
}
