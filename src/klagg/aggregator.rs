//! Aggregator - 成交 -> K线 的归约器，以及完成K线的扇出
//!
//! 每个交易对只保留一根进行中的K线。某个交易对到来一笔周期严格更晚的成交时，
//! 旧K线结束：拷贝一份推送给所有订阅者，然后用这笔成交开新K线。
//!
//! 周期相等或更早（迟到）的成交一律并入当前K线，只有"严格更晚"才触发收线。
//!
//! 推送对每个订阅者都是 `try_send`：通道满了这个订阅者就错过这根K线，
//! 归约器的热路径永远不会被慢消费者拖住。

use crate::klagg::bucket::truncate_to_interval;
use crate::klcommon::models::{Candlestick, Tick};
use crate::klcommon::{AppError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, instrument, trace, warn};

/// 聚合器日志目标
pub const AGGREGATOR_TARGET: &str = "聚合器";

/// 订阅者通道的默认容量
pub const DEFAULT_CHANNEL_CAPACITY: usize = 32;

/// `subscribe` 返回的注册凭证，用于 `unsubscribe`
pub type SubscriptionId = u64;

/// 一个订阅: 凭证 + 接收端
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub receiver: mpsc::Receiver<Candlestick>,
}

impl Subscription {
    /// 等待下一根完成的K线；聚合器被丢弃或取消订阅后返回 None
    pub async fn recv(&mut self) -> Option<Candlestick> {
        self.receiver.recv().await
    }
}

struct Subscriber {
    id: SubscriptionId,
    sender: mpsc::Sender<Candlestick>,
}

pub struct Aggregator {
    interval_ms: i64,
    channel_capacity: usize,

    // 两把锁: 热路径只碰 candlesticks，注册只碰 subscribers。
    // 收线时持有 candlesticks 再拿 subscribers，反方向从不发生。
    candlesticks: Mutex<HashMap<String, Candlestick>>,
    subscribers: Mutex<Vec<Subscriber>>,

    next_subscription_id: AtomicU64,
    delivered_count: AtomicU64,
    dropped_count: AtomicU64,
}

/// 锁中毒时直接取回数据。两把锁保护的状态在语句之间总是一致的。
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Aggregator {
    pub fn new(interval_ms: i64) -> Result<Self> {
        Self::with_channel_capacity(interval_ms, DEFAULT_CHANNEL_CAPACITY)
    }

    /// `interval_ms` 必须大于0；容量为0时按1处理
    #[instrument(target = "聚合器", name = "aggregator_init", err)]
    pub fn with_channel_capacity(interval_ms: i64, channel_capacity: usize) -> Result<Self> {
        if interval_ms <= 0 {
            return Err(AppError::ConfigError(format!(
                "K线周期必须大于0, 实际为 {}",
                interval_ms
            )));
        }
        info!(target: AGGREGATOR_TARGET, event_name = "AggregatorCreated", interval_ms, channel_capacity);
        Ok(Self {
            interval_ms,
            channel_capacity: channel_capacity.max(1),
            candlesticks: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            next_subscription_id: AtomicU64::new(1),
            delivered_count: AtomicU64::new(0),
            dropped_count: AtomicU64::new(0),
        })
    }

    /// 处理一笔成交。
    ///
    /// 若这笔成交让该交易对的上一根K线结束，返回那根K线（已推送给订阅者）。
    /// 整个读-改-写以及收线推送都在 candlesticks 锁内完成，
    /// 同一交易对的下一笔成交不可能插在收线中间。
    ///
    /// 事件时间超出可表示范围的成交直接丢弃，不触碰任何K线。
    pub fn process_tick(&self, tick: &Tick) -> Option<Candlestick> {
        let bucket_start = tick
            .event_time()
            .and_then(|_| truncate_to_interval(tick.event_time_ms, self.interval_ms));
        let Some(bucket_start) = bucket_start else {
            warn!(
                target: AGGREGATOR_TARGET,
                event_name = "OutOfRangeTickDropped",
                symbol = %tick.symbol,
                event_time_ms = tick.event_time_ms,
            );
            return None;
        };
        let mut candlesticks = lock(&self.candlesticks);

        match candlesticks.get_mut(&tick.symbol) {
            Some(current) if bucket_start > current.open_time => {
                let fresh = Candlestick::open_with(&tick.symbol, bucket_start, tick.price);
                let completed = std::mem::replace(current, fresh);
                debug!(
                    target: AGGREGATOR_TARGET,
                    event_name = "CandlestickClosed",
                    symbol = %completed.symbol,
                    open_time = completed.open_time,
                    open = completed.open,
                    high = completed.high,
                    low = completed.low,
                    close = completed.close,
                );
                self.broadcast(&completed);
                Some(completed)
            }
            Some(current) => {
                if bucket_start < current.open_time {
                    trace!(
                        target: AGGREGATOR_TARGET,
                        event_name = "LateTickFolded",
                        symbol = %tick.symbol,
                        tick_bucket = bucket_start,
                        open_bucket = current.open_time,
                    );
                }
                current.apply_price(tick.price);
                None
            }
            None => {
                candlesticks.insert(
                    tick.symbol.clone(),
                    Candlestick::open_with(&tick.symbol, bucket_start, tick.price),
                );
                None
            }
        }
    }

    /// 注册一个新的订阅者。只会收到注册之后结束的K线，不回放历史。
    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.channel_capacity);
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = lock(&self.subscribers);
        subscribers.push(Subscriber { id, sender });
        info!(target: AGGREGATOR_TARGET, event_name = "SubscriberAdded", subscription_id = id, subscriber_count = subscribers.len());

        Subscription { id, receiver }
    }

    /// 取消订阅。返回该凭证此前是否仍在注册表中。
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        let removed = subscribers.len() != before;
        if removed {
            info!(target: AGGREGATOR_TARGET, event_name = "SubscriberRemoved", subscription_id = id, subscriber_count = subscribers.len());
        }
        removed
    }

    /// 非阻塞扇出。通道满: 跳过该订阅者；通道已关闭: 顺便清出注册表。
    fn broadcast(&self, candlestick: &Candlestick) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|subscriber| {
            match subscriber.sender.try_send(candlestick.clone()) {
                Ok(()) => {
                    self.delivered_count.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(TrySendError::Full(_)) => {
                    self.dropped_count.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        target: AGGREGATOR_TARGET,
                        event_name = "SlowSubscriberSkipped",
                        subscription_id = subscriber.id,
                        symbol = %candlestick.symbol,
                        open_time = candlestick.open_time,
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(target: AGGREGATOR_TARGET, event_name = "ClosedSubscriberPruned", subscription_id = subscriber.id);
                    false
                }
            }
        });
    }

    /// 某交易对当前进行中K线的拷贝
    pub fn current_candle(&self, symbol: &str) -> Option<Candlestick> {
        lock(&self.candlesticks).get(symbol).cloned()
    }

    /// 已经见过成交的交易对，按字母序
    pub fn tracked_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = lock(&self.candlesticks).keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    /// 成功交给订阅者的K线份数
    pub fn delivered_count(&self) -> u64 {
        self.delivered_count.load(Ordering::Relaxed)
    }

    /// 因通道已满而跳过的K线份数
    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("interval_ms", &self.interval_ms)
            .field("channel_capacity", &self.channel_capacity)
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
