//! K线推送服务器模块
//!
//! 基于Axum的WebSocket服务器。每个客户端会话向聚合器订阅一次，
//! 把收到的每根完成K线以JSON推送出去；会话结束时取消订阅。
//!
//! 客户端可以发送 `{"subscribe": "BTCUSDT"}` 只接收某个交易对，
//! `{"subscribe": "*"}` 恢复为接收全部。

use crate::klagg::aggregator::Aggregator;
use crate::klagg::bucket::bucket_close_time;
use crate::klcommon::models::Candlestick;
use crate::klcommon::{AppError, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};

/// 推送服务日志目标
pub const WEB_SERVER_TARGET: &str = "WebServer";

/// 用于WebSocket推送的K线结构体
#[derive(Debug, Clone, Serialize)]
pub struct ApiCandlestick {
    pub symbol: String,
    /// 周期起始时间（秒），与历史gRPC接口保持一致；超出可表示范围时为 null
    pub timestamp: Option<i64>,
    pub open_time: i64,
    /// 周期内最后一毫秒
    pub close_time: Option<i64>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl ApiCandlestick {
    pub fn from_candle(c: &Candlestick, interval_ms: i64) -> Self {
        Self {
            symbol: c.symbol.clone(),
            timestamp: c.bucket_start().map(|t| t.timestamp()),
            open_time: c.open_time,
            close_time: bucket_close_time(c.open_time, interval_ms),
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
        }
    }
}

/// 健康检查响应
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub interval_ms: i64,
    pub tracked_symbols: Vec<String>,
    pub subscriber_count: usize,
    pub delivered_count: u64,
    pub dropped_count: u64,
}

/// Web服务器的共享状态
#[derive(Clone)]
struct AppState {
    aggregator: Arc<Aggregator>,
    shutdown_rx: watch::Receiver<bool>,
}

/// 构建路由，测试里可以直接挂到任意监听器上
pub fn build_router(aggregator: Arc<Aggregator>, shutdown_rx: watch::Receiver<bool>) -> Router {
    let state = Arc::new(AppState { aggregator, shutdown_rx });
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 启动推送服务器，直到关闭信号到来
#[instrument(target = "WebServer", skip_all, fields(bind_addr = %bind_addr), err)]
pub async fn run_stream_server(
    aggregator: Arc<Aggregator>,
    bind_addr: &str,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let addr: SocketAddr = bind_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(target: WEB_SERVER_TARGET, error = ?e, "无法绑定到 {}", addr);
        AppError::WebServerError(format!("无法绑定到 {}: {}", addr, e))
    })?;
    serve(listener, aggregator, shutdown_rx).await
}

/// 在已绑定的监听器上提供服务
pub async fn serve(
    listener: tokio::net::TcpListener,
    aggregator: Arc<Aggregator>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    let app = build_router(aggregator, shutdown_rx.clone());

    info!(target: WEB_SERVER_TARGET, log_type = "low_freq", addr = %local_addr, "K线推送服务器已启动");

    let mut shutdown_signal = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown_signal.borrow() {
                if shutdown_signal.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .map_err(|e| AppError::WebServerError(format!("Web服务器遇到致命错误: {}", e)))?;

    info!(target: WEB_SERVER_TARGET, log_type = "low_freq", "K线推送服务器已停止");
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let aggregator = &state.aggregator;
    Json(HealthResponse {
        status: "ok",
        interval_ms: aggregator.interval_ms(),
        tracked_symbols: aggregator.tracked_symbols(),
        subscriber_count: aggregator.subscriber_count(),
        delivered_count: aggregator.delivered_count(),
        dropped_count: aggregator.dropped_count(),
    })
}

/// WebSocket升级处理器
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// 解析客户端的订阅请求。"*" 表示全部交易对。
fn parse_symbol_filter(text: &str) -> Option<Option<String>> {
    let val = serde_json::from_str::<serde_json::Value>(text).ok()?;
    let symbol = val.get("subscribe")?.as_str()?.trim().to_uppercase();
    if symbol.is_empty() || symbol == "*" {
        Some(None)
    } else {
        Some(Some(symbol))
    }
}

/// 处理单个WebSocket连接的生命周期
async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut subscription = state.aggregator.subscribe();
    let subscription_id = subscription.id;
    let mut shutdown_rx = state.shutdown_rx.clone();
    let mut symbol_filter: Option<String> = None;
    let interval_ms = state.aggregator.interval_ms();

    info!(target: WEB_SERVER_TARGET, subscription_id, "客户端已连接");

    loop {
        tokio::select! {
            maybe_candle = subscription.recv() => {
                let Some(candle) = maybe_candle else { break };
                if symbol_filter.as_deref().is_some_and(|s| s != candle.symbol) {
                    continue;
                }
                let payload = match serde_json::to_string(&ApiCandlestick::from_candle(&candle, interval_ms)) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(target: WEB_SERVER_TARGET, error = %e, "K线序列化失败");
                        continue;
                    }
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            },
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(filter) = parse_symbol_filter(&text) {
                            info!(target: WEB_SERVER_TARGET, subscription_id, symbol = ?filter, "请求订阅");
                            symbol_filter = filter;
                        } else {
                            debug!(target: WEB_SERVER_TARGET, subscription_id, "忽略无法识别的客户端消息");
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            },
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    state.aggregator.unsubscribe(subscription_id);
    info!(target: WEB_SERVER_TARGET, subscription_id, "客户端断开，已清理订阅");
}
