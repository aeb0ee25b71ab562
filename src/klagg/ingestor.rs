//! 行情摄取循环
//!
//! 单一消费者: 从行情通道取出成交 -> `Aggregator::process_tick` ->
//! 收线时把K线交给持久化端。持久化失败只记日志和计数，不重试，也不停止循环。

use crate::klagg::aggregator::Aggregator;
use crate::klcommon::db::CandlestickSink;
use crate::klcommon::models::{Candlestick, Tick};
use crate::klcommon::{AppError, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, instrument, warn};

/// 摄取循环日志目标
pub const INGESTOR_TARGET: &str = "行情摄取";

/// 摄取循环退出时的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub ticks_processed: u64,
    pub ticks_rejected: u64,
    pub candles_closed: u64,
    pub sink_failures: u64,
}

#[instrument(target = "行情摄取", name = "ingestion_loop", skip_all)]
pub async fn run_ingestion<S>(
    aggregator: Arc<Aggregator>,
    mut tick_rx: mpsc::Receiver<Tick>,
    sink: Arc<S>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> IngestStats
where
    S: CandlestickSink + 'static,
{
    info!(target: INGESTOR_TARGET, event_name = "IngestionLoopStarted", interval_ms = aggregator.interval_ms());
    let mut stats = IngestStats::default();

    loop {
        tokio::select! {
            maybe_tick = tick_rx.recv() => {
                let Some(tick) = maybe_tick else {
                    info!(target: INGESTOR_TARGET, event_name = "TickChannelClosed");
                    break;
                };

                if let Err(e) = tick.validate() {
                    stats.ticks_rejected += 1;
                    warn!(target: INGESTOR_TARGET, event_name = "TickRejected", error.summary = e.get_error_type_summary(), error.details = %e);
                    continue;
                }
                stats.ticks_processed += 1;

                if let Some(closed) = aggregator.process_tick(&tick) {
                    stats.candles_closed += 1;
                    if let Err(e) = store_closed(sink.clone(), closed).await {
                        stats.sink_failures += 1;
                        error!(
                            target: INGESTOR_TARGET,
                            event_name = "CandlestickStoreFailed",
                            symbol = %tick.symbol,
                            error.summary = e.get_error_type_summary(),
                            error.details = %e,
                        );
                    }
                }
            },
            changed = shutdown_rx.changed() => {
                // 发送端被丢弃同样视为关闭
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!(target: INGESTOR_TARGET, event_name = "IngestionShutdownRequested");
                    break;
                }
            }
        }
    }

    info!(
        target: INGESTOR_TARGET,
        event_name = "IngestionLoopStopped",
        ticks_processed = stats.ticks_processed,
        ticks_rejected = stats.ticks_rejected,
        candles_closed = stats.candles_closed,
        sink_failures = stats.sink_failures,
    );
    stats
}

/// 持久化端是同步的 rusqlite 调用，放到阻塞线程上执行
async fn store_closed<S>(sink: Arc<S>, candlestick: Candlestick) -> Result<()>
where
    S: CandlestickSink + 'static,
{
    let parent_span = tracing::Span::current();
    tokio::task::spawn_blocking(move || {
        parent_span.in_scope(|| sink.store(&candlestick.symbol, &candlestick))
    })
    .await
    .map_err(|join_error| AppError::DatabaseError(format!("K线写入任务 panic: {:?}", join_error)))?
}
