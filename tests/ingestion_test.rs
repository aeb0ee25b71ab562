//! 摄取循环测试：行情通道 -> 聚合器 -> 持久化

use kline_stream::klagg::{run_ingestion, Aggregator, IngestStats};
use kline_stream::klcommon::{AppError, Candlestick, CandlestickSink, Database, Result, Tick};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const MINUTE: i64 = 60_000;
const T0: i64 = 1_672_531_200_000;

/// 记录所有写入的内存持久化端
#[derive(Default)]
struct RecordingSink {
    stored: Mutex<Vec<Candlestick>>,
}

impl CandlestickSink for RecordingSink {
    fn store(&self, _symbol: &str, candlestick: &Candlestick) -> Result<()> {
        self.stored.lock().unwrap().push(candlestick.clone());
        Ok(())
    }
}

/// 总是失败的持久化端
#[derive(Default)]
struct FailingSink {
    attempts: AtomicU64,
}

impl CandlestickSink for FailingSink {
    fn store(&self, _symbol: &str, _candlestick: &Candlestick) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        Err(AppError::DatabaseError("disk full".to_string()))
    }
}

fn ticks() -> Vec<Tick> {
    vec![
        Tick::new("BTCUSDT", 100.0, T0),
        Tick::new("BTCUSDT", 105.0, T0 + 10_000),
        Tick::new("ETHUSDT", 10.0, T0 + 20_000),
        Tick::new("BTCUSDT", 95.0, T0 + 40_000),
        Tick::new("BTCUSDT", 102.0, T0 + 65_000),
        Tick::new("ETHUSDT", 11.0, T0 + 70_000),
        Tick::new("BTCUSDT", 103.0, T0 + 2 * MINUTE),
    ]
}

async fn run_to_completion<S: CandlestickSink + 'static>(
    aggregator: Arc<Aggregator>,
    sink: Arc<S>,
    input: Vec<Tick>,
) -> IngestStats {
    let (tick_tx, tick_rx) = mpsc::channel(16);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(run_ingestion(aggregator, tick_rx, sink, shutdown_rx));

    for tick in input {
        tick_tx.send(tick).await.unwrap();
    }
    // 关闭行情通道，循环处理完剩余成交后退出
    drop(tick_tx);

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("摄取循环没有退出")
        .unwrap()
}

#[tokio::test]
async fn test_closed_candles_are_stored_once() {
    let aggregator = Arc::new(Aggregator::new(MINUTE).unwrap());
    let sink = Arc::new(RecordingSink::default());

    let stats = run_to_completion(aggregator.clone(), sink.clone(), ticks()).await;

    assert_eq!(
        stats,
        IngestStats {
            ticks_processed: 7,
            ticks_rejected: 0,
            candles_closed: 3,
            sink_failures: 0,
        }
    );

    let stored = sink.stored.lock().unwrap().clone();
    assert_eq!(stored.len(), 3);
    assert_eq!(
        stored[0],
        Candlestick {
            symbol: "BTCUSDT".to_string(),
            open_time: T0,
            open: 100.0,
            high: 105.0,
            low: 95.0,
            close: 95.0,
        }
    );
    assert_eq!((stored[1].symbol.as_str(), stored[1].open_time), ("ETHUSDT", T0));
    assert_eq!((stored[2].symbol.as_str(), stored[2].open_time), ("BTCUSDT", T0 + MINUTE));

    // 进行中的K线不落库
    assert_eq!(aggregator.current_candle("BTCUSDT").unwrap().open_time, T0 + 2 * MINUTE);
}

#[tokio::test]
async fn test_invalid_ticks_are_rejected() {
    let aggregator = Arc::new(Aggregator::new(MINUTE).unwrap());
    let sink = Arc::new(RecordingSink::default());

    let input = vec![
        Tick::new("BTCUSDT", 100.0, T0),
        Tick::new("", 100.0, T0 + 1),
        Tick::new("BTCUSDT", f64::NAN, T0 + 2),
        Tick::new("BTCUSDT", -1.0, T0 + MINUTE),
        Tick::new("BTCUSDT", 101.0, T0 + MINUTE),
    ];
    let stats = run_to_completion(aggregator, sink.clone(), input).await;

    assert_eq!(stats.ticks_processed, 2);
    assert_eq!(stats.ticks_rejected, 3);
    assert_eq!(stats.candles_closed, 1);

    let stored = sink.stored.lock().unwrap().clone();
    assert_eq!(stored[0].low, 100.0);
    assert_eq!(stored[0].close, 100.0);
}

#[tokio::test]
async fn test_sink_failure_does_not_stop_loop_or_fanout() {
    let aggregator = Arc::new(Aggregator::new(MINUTE).unwrap());
    let mut subscription = aggregator.subscribe();
    let sink = Arc::new(FailingSink::default());

    let stats = run_to_completion(aggregator, sink.clone(), ticks()).await;

    assert_eq!(stats.candles_closed, 3);
    assert_eq!(stats.sink_failures, 3);
    assert_eq!(sink.attempts.load(Ordering::Relaxed), 3);

    // 订阅者不受持久化失败影响
    let mut received = 0;
    while subscription.receiver.try_recv().is_ok() {
        received += 1;
    }
    assert_eq!(received, 3);
}

#[tokio::test]
async fn test_shutdown_signal_stops_loop() {
    let aggregator = Arc::new(Aggregator::new(MINUTE).unwrap());
    let sink = Arc::new(RecordingSink::default());
    let (tick_tx, tick_rx) = mpsc::channel::<Tick>(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(run_ingestion(aggregator, tick_rx, sink, shutdown_rx));
    tick_tx.send(Tick::new("BTCUSDT", 100.0, T0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    shutdown_tx.send(true).unwrap();
    let stats = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("关闭信号后摄取循环没有退出")
        .unwrap();

    assert_eq!(stats.ticks_processed, 1);
    assert_eq!(stats.candles_closed, 0);
    // 行情发送端此时仍然存活，循环是被关闭信号终止的
    drop(tick_tx);
}

#[tokio::test]
async fn test_ingestion_into_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::new(dir.path().join("klines.db")).unwrap());
    let aggregator = Arc::new(Aggregator::new(MINUTE).unwrap());

    let stats = run_to_completion(aggregator, db.clone(), ticks()).await;

    assert_eq!(stats.sink_failures, 0);
    assert_eq!(db.count_candlesticks("BTCUSDT").unwrap(), 2);
    assert_eq!(db.count_candlesticks("ETHUSDT").unwrap(), 1);

    let latest = db.latest_candlesticks("BTCUSDT", 1).unwrap();
    assert_eq!(latest[0].open_time, T0 + MINUTE);
    assert_eq!(latest[0].open, 102.0);
}

#[tokio::test]
async fn test_extreme_event_time_is_rejected_and_symbol_keeps_closing() {
    let aggregator = Arc::new(Aggregator::new(MINUTE).unwrap());
    let sink = Arc::new(RecordingSink::default());

    let input = vec![
        Tick::new("BTCUSDT", 100.0, T0),
        Tick::new("BTCUSDT", 1.0, i64::MIN),
        Tick::new("BTCUSDT", 1.0, i64::MAX),
        Tick::new("BTCUSDT", 101.0, T0 + MINUTE),
        Tick::new("BTCUSDT", 102.0, T0 + 2 * MINUTE),
    ];
    let stats = run_to_completion(aggregator.clone(), sink.clone(), input).await;

    assert_eq!(stats.ticks_rejected, 2);
    assert_eq!(stats.ticks_processed, 3);
    assert_eq!(stats.candles_closed, 2);

    let stored = sink.stored.lock().unwrap().clone();
    let open_times: Vec<i64> = stored.iter().map(|c| c.open_time).collect();
    assert_eq!(open_times, vec![T0, T0 + MINUTE]);
    assert_eq!(stored[0].low, 100.0);
    assert_eq!(aggregator.current_candle("BTCUSDT").unwrap().open_time, T0 + 2 * MINUTE);
}
