// 文件: src/klcommon/websocket.rs
// 币安归集交易行情接入 (使用 tokio-tungstenite 实现)
use crate::klcommon::config::FeedConfig;
use crate::klcommon::models::{BinanceRawAggTrade, CombinedStreamEnvelope, Tick};
use crate::klcommon::{AppError, Result};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, instrument, trace, warn};
use url::Url;

/// 连接超时
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// WebSocket连接日志目标
pub const WEBSOCKET_CONNECTION_TARGET: &str = "websocket连接";

/// 归集交易日志目标
pub const AGG_TRADE_TARGET: &str = "归集交易";

/// 构建组合流地址: <base>?streams=btcusdt@aggTrade/ethusdt@aggTrade
pub fn build_stream_url(base_url: &str, symbols: &[String]) -> String {
    let streams: Vec<String> = symbols
        .iter()
        .map(|symbol| format!("{}@aggTrade", symbol.trim().to_lowercase()))
        .collect();
    format!("{}?streams={}", base_url, streams.join("/"))
}

/// 解析一条组合流消息。
///
/// 非 aggTrade 事件（例如订阅回执）返回 `Ok(None)`。
pub fn parse_agg_trade_message(text: &str) -> Result<Option<Tick>> {
    let envelope: CombinedStreamEnvelope = serde_json::from_str(text)?;
    if envelope.data.get("e").and_then(|e| e.as_str()) != Some("aggTrade") {
        trace!(target: AGG_TRADE_TARGET, stream = %envelope.stream, "忽略非归集交易消息");
        return Ok(None);
    }
    let raw: BinanceRawAggTrade = serde_json::from_value(envelope.data)?;
    raw.to_tick().map(Some)
}

/// 第 attempt 次重连前的等待时间（attempt 从1开始），指数退避并封顶
pub fn reconnect_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    initial.saturating_mul(factor).min(max)
}

/// 单个连接的结束原因
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    /// 收到关闭信号或下游已关闭，整个行情任务应退出
    Stop,
    /// 连接到期，立即重连
    Recycle,
    /// 对端关闭或读错误，退避后重连
    Disconnected,
}

/// 币安归集交易行情客户端
pub struct AggTradeFeed {
    config: FeedConfig,
}

impl AggTradeFeed {
    pub fn new(config: FeedConfig) -> Self {
        Self { config }
    }

    pub fn stream_url(&self) -> String {
        build_stream_url(&self.config.websocket_url, &self.config.symbols)
    }

    /// 运行行情接入，直到收到关闭信号或下游通道关闭
    #[instrument(target = "websocket连接", name = "agg_trade_feed", skip_all)]
    pub async fn run(self, tick_tx: mpsc::Sender<Tick>, mut shutdown_rx: watch::Receiver<bool>) {
        let url = self.stream_url();
        let initial_delay = Duration::from_secs(self.config.reconnect_interval_secs);
        let max_delay = Duration::from_secs(self.config.max_reconnect_delay_secs);
        let lifetime = Duration::from_secs(self.config.connection_lifetime_secs);
        let mut attempt: u32 = 0;

        info!(target: WEBSOCKET_CONNECTION_TARGET, log_type = "low_freq", url = %url, "行情任务启动");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let connected = tokio::select! {
                res = tokio::time::timeout(CONNECT_TIMEOUT, self.connect(&url)) => match res {
                    Ok(res) => res,
                    Err(_) => Err(AppError::WebSocketError(format!(
                        "连接尝试超过 {} 秒未响应，已超时", CONNECT_TIMEOUT.as_secs()
                    ))),
                },
                _ = shutdown_rx.changed() => break,
            };

            let end = match connected {
                Ok(ws) => {
                    attempt = 0;
                    self.read_session(ws, &tick_tx, &mut shutdown_rx, lifetime).await
                }
                Err(e) => {
                    error!(
                        target: WEBSOCKET_CONNECTION_TARGET,
                        log_type = "low_freq",
                        error.summary = e.get_error_type_summary(),
                        error.details = %e,
                        retryable = e.is_retryable(),
                        "❌ WebSocket连接失败"
                    );
                    if !e.is_retryable() {
                        break;
                    }
                    SessionEnd::Disconnected
                }
            };

            match end {
                SessionEnd::Stop => break,
                SessionEnd::Recycle => continue,
                SessionEnd::Disconnected => {
                    attempt = attempt.saturating_add(1);
                    let delay = reconnect_delay(attempt, initial_delay, max_delay);
                    warn!(target: WEBSOCKET_CONNECTION_TARGET, attempt, delay_ms = delay.as_millis() as u64, "🔄 准备重连");
                    tokio::select! {
                        _ = sleep(delay) => {},
                        _ = shutdown_rx.changed() => break,
                    }
                }
            }
        }

        info!(target: WEBSOCKET_CONNECTION_TARGET, log_type = "low_freq", "行情任务已退出");
    }

    async fn connect(
        &self,
        url: &str,
    ) -> Result<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>> {
        let url = Url::parse(url)?;
        info!(target: WEBSOCKET_CONNECTION_TARGET, log_type = "low_freq", "连接到WebSocket: {}", url);
        let (ws_stream, _) = connect_async(url).await?;
        info!(target: WEBSOCKET_CONNECTION_TARGET, log_type = "low_freq", "✅ WebSocket连接已建立");
        Ok(ws_stream)
    }

    /// 读取一个连接上的消息，直到连接结束、到期或收到关闭信号
    async fn read_session(
        &self,
        mut ws_stream: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        tick_tx: &mpsc::Sender<Tick>,
        shutdown_rx: &mut watch::Receiver<bool>,
        lifetime: Duration,
    ) -> SessionEnd {
        let deadline = Instant::now() + lifetime;

        let end = loop {
            let msg = tokio::select! {
                msg = ws_stream.next() => msg,
                _ = tokio::time::sleep_until(deadline) => {
                    info!(target: WEBSOCKET_CONNECTION_TARGET, log_type = "low_freq", "连接到期，主动重连");
                    break SessionEnd::Recycle;
                },
                _ = shutdown_rx.changed() => break SessionEnd::Stop,
            };

            match msg {
                Some(Ok(Message::Text(text))) => match parse_agg_trade_message(&text) {
                    Ok(Some(tick)) => {
                        if tick_tx.send(tick).await.is_err() {
                            warn!(target: AGG_TRADE_TARGET, "下游通道已关闭，停止行情接入");
                            break SessionEnd::Stop;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            target: AGG_TRADE_TARGET,
                            { error.summary = e.get_error_type_summary(), error.details = %e, raw = %text },
                            "解析消息失败"
                        );
                    }
                },
                Some(Ok(Message::Ping(data))) => {
                    debug!(target: WEBSOCKET_CONNECTION_TARGET, "收到Ping，发送Pong");
                    if let Err(e) = ws_stream.send(Message::Pong(data)).await {
                        error!(target: WEBSOCKET_CONNECTION_TARGET, "发送Pong失败: {}", e);
                        break SessionEnd::Disconnected;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(target: WEBSOCKET_CONNECTION_TARGET, "收到关闭消息: {:?}", frame);
                    break SessionEnd::Disconnected;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(target: WEBSOCKET_CONNECTION_TARGET, "WebSocket错误: {}", e);
                    break SessionEnd::Disconnected;
                }
                None => break SessionEnd::Disconnected,
            }
        };

        let _ = ws_stream.close(None).await;
        end
    }
}
