//! 启动实时K线聚合推送服务。
//!
//! ## 任务结构
//! - 行情任务: 币安归集交易流 -> 行情通道
//! - 摄取任务: 行情通道 -> 聚合器 -> SQLite
//! - 推送任务: 聚合器订阅 -> WebSocket客户端
//!
//! Ctrl+C 触发 watch 关闭信号，三个任务各自退出后 main 汇总统计。

use anyhow::{Context, Result};
use clap::Parser;
use kline_stream::klagg::{run_ingestion, Aggregator};
use kline_stream::klcommon::{
    config::constants::DEFAULT_CONFIG_PATH, init_logging, AggTradeFeed, Database, ServiceConfig,
};
use kline_stream::klserver::run_stream_server;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const APP_TARGET: &str = "应用生命周期";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Real-time candlestick aggregation and streaming service.", long_about = None)]
struct Args {
    /// Path to the TOML config file. Missing file falls back to built-in defaults.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Override the candle interval (e.g. "1m", "5m", "1h").
    #[arg(short, long)]
    interval: Option<String>,

    /// Override the subscribed symbols (e.g. "btcusdt,ethusdt").
    #[arg(short, long, value_delimiter = ',')]
    symbols: Option<Vec<String>>,

    /// Write the effective config (file + overrides) to this path and exit.
    #[arg(long)]
    dump_config: Option<String>,
}

/// 读取配置；文件不存在时使用默认值。返回配置以及是否使用了默认值。
fn load_config(args: &Args) -> Result<(ServiceConfig, bool)> {
    let (mut config, used_defaults) = if Path::new(&args.config).exists() {
        let config = ServiceConfig::from_file(&args.config)
            .with_context(|| format!("加载配置文件失败: {}", args.config))?;
        (config, false)
    } else {
        (ServiceConfig::default(), true)
    };

    config.apply_overrides(args.interval.as_deref(), args.symbols.as_deref());
    config.validate().context("配置校验失败")?;

    Ok((config, used_defaults))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (config, used_defaults) = load_config(&args)?;

    if let Some(path) = &args.dump_config {
        config
            .save_to_file(path)
            .with_context(|| format!("写出配置文件失败: {}", path))?;
        println!("配置已写入 {}", path);
        return Ok(());
    }

    // guard 必须活到 main 结束
    let _guard = init_logging(&config.logging).context("初始化日志失败")?;

    if used_defaults {
        warn!(target: APP_TARGET, path = %args.config, "配置文件不存在，使用默认配置");
    }

    let interval_ms = config.interval_ms()?;
    info!(
        target: APP_TARGET,
        log_type = "low_freq",
        interval = %config.aggregator.interval,
        interval_ms,
        symbols = ?config.feed.symbols,
        bind_addr = %config.server.bind_addr,
        "K线推送服务启动"
    );

    let db = Arc::new(Database::with_config(&config.database).context("打开数据库失败")?);
    let aggregator = Arc::new(Aggregator::with_channel_capacity(
        interval_ms,
        config.aggregator.subscriber_channel_capacity,
    )?);

    let (tick_tx, tick_rx) = mpsc::channel(config.feed.tick_channel_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let feed = AggTradeFeed::new(config.feed.clone());
    let feed_handle = tokio::spawn(feed.run(tick_tx, shutdown_rx.clone()));

    let ingest_handle = tokio::spawn(run_ingestion(
        aggregator.clone(),
        tick_rx,
        db.clone(),
        shutdown_rx.clone(),
    ));

    let server_aggregator = aggregator.clone();
    let bind_addr = config.server.bind_addr.clone();
    let server_shutdown = shutdown_rx.clone();
    let mut server_handle = tokio::spawn(async move {
        run_stream_server(server_aggregator, &bind_addr, server_shutdown).await
    });

    // 推送服务器提前退出（例如端口被占用）同样触发关闭
    let mut server_finished = false;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!(target: APP_TARGET, error = %e, "监听Ctrl+C失败");
            }
            info!(target: APP_TARGET, log_type = "low_freq", "收到关闭信号，开始关闭");
        }
        res = &mut server_handle => {
            server_finished = true;
            match res {
                Ok(Ok(())) => warn!(target: APP_TARGET, "推送服务器意外退出"),
                Ok(Err(e)) => error!(target: APP_TARGET, { error.summary = e.get_error_type_summary(), error.details = %e }, "推送服务器失败"),
                Err(e) => error!(target: APP_TARGET, error = ?e, "推送服务器任务 panic"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    if let Err(e) = feed_handle.await {
        error!(target: APP_TARGET, error = ?e, "行情任务 panic");
    }
    match ingest_handle.await {
        Ok(stats) => info!(
            target: APP_TARGET,
            log_type = "low_freq",
            ticks_processed = stats.ticks_processed,
            ticks_rejected = stats.ticks_rejected,
            candles_closed = stats.candles_closed,
            sink_failures = stats.sink_failures,
            "摄取任务已退出"
        ),
        Err(e) => error!(target: APP_TARGET, error = ?e, "摄取任务 panic"),
    }
    if !server_finished {
        match server_handle.await {
            Ok(Err(e)) => error!(target: APP_TARGET, { error.details = %e }, "推送服务器关闭时出错"),
            Err(e) => error!(target: APP_TARGET, error = ?e, "推送服务器任务 panic"),
            Ok(Ok(())) => {}
        }
    }

    info!(
        target: APP_TARGET,
        log_type = "low_freq",
        candles_stored = db.inserted_count(),
        delivered = aggregator.delivered_count(),
        dropped = aggregator.dropped_count(),
        "K线推送服务已关闭"
    );
    Ok(())
}
