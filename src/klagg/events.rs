//! 聚合器对外事件与广播总线

use crate::klcommon::{Bar, ExchangeId};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// 聚合器发布的事件，序列化为 `{"kind": ..., "payload": ...}`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum AggrEvent {
    Connected { exchange: ExchangeId, pair: String },
    Disconnected { exchange: ExchangeId, pair: String },
    TimeframeChanged { timeframe: u32 },
    Error { message: String },
    /// 进行中的K线
    Tick(Bar),
    /// 已完结的K线
    Bar(Bar),
}

impl AggrEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AggrEvent::Connected { .. } => "connected",
            AggrEvent::Disconnected { .. } => "disconnected",
            AggrEvent::TimeframeChanged { .. } => "timeframeChanged",
            AggrEvent::Error { .. } => "error",
            AggrEvent::Tick(_) => "tick",
            AggrEvent::Bar(_) => "bar",
        }
    }
}

/// 事件总线：每个订阅者一条独立队列
///
/// 完结K线与控制事件总是投递；订阅者积压达到 `tick_capacity` 时新的 tick 被丢弃，
/// 下一次 tick 仍携带最新的活动K线。
#[derive(Debug, Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    tick_capacity: usize,
}

#[derive(Debug)]
struct Subscriber {
    tx: mpsc::UnboundedSender<AggrEvent>,
    pending: Arc<AtomicUsize>,
    dropped_ticks: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(tick_capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            tick_capacity: tick_capacity.max(1),
        }
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|sub| !sub.tx.is_closed());
        subscribers
    }

    pub fn publish(&self, event: AggrEvent) {
        let subscribers = self.lock_subscribers();
        if subscribers.is_empty() {
            trace!(target: "计算核心", kind = event.kind(), "当前没有事件订阅者");
            return;
        }

        let is_tick = matches!(event, AggrEvent::Tick(_));
        for sub in subscribers.iter() {
            if is_tick && sub.pending.load(Ordering::Relaxed) >= self.tick_capacity {
                sub.dropped_ticks.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            sub.pending.fetch_add(1, Ordering::Relaxed);
            if sub.tx.send(event.clone()).is_err() {
                sub.pending.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let dropped_ticks = Arc::new(AtomicU64::new(0));
        self.lock_subscribers().push(Subscriber {
            tx,
            pending: pending.clone(),
            dropped_ticks: dropped_ticks.clone(),
        });
        EventSubscription { rx, pending, dropped_ticks }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }
}

/// 事件订阅，drop 即取消订阅
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<AggrEvent>,
    pending: Arc<AtomicUsize>,
    dropped_ticks: Arc<AtomicU64>,
}

impl EventSubscription {
    /// 接收下一个事件；总线关闭返回 None
    pub async fn recv(&mut self) -> Option<AggrEvent> {
        let event = self.rx.recv().await?;
        Some(self.delivered(event))
    }

    /// 非阻塞地取出一个已到达的事件
    pub fn try_recv(&mut self) -> Option<AggrEvent> {
        let event = self.rx.try_recv().ok()?;
        Some(self.delivered(event))
    }

    fn delivered(&self, event: AggrEvent) -> AggrEvent {
        self.pending.fetch_sub(1, Ordering::Relaxed);
        let dropped = self.dropped_ticks.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            warn!(target: "计算核心", dropped, "事件订阅者处理过慢，部分 tick 已丢弃");
        }
        event
    }

    pub fn unsubscribe(self) {}
}
