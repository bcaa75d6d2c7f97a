//! WebSocket 连接生命周期
//!
//! 每个 `WsConnection` 在独立任务中持有一条 tokio-tungstenite 连接：
//! 握手完成后才开始读写，入站文本帧按 `(connection_id, payload)` 转发到帧通道，
//! 由 `process_frames` 交给 `MessageHandler` 处理。

use crate::klcommon::{AppError, Result};
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, trace, warn};

pub const WEBSOCKET_CONNECTION_TARGET: &str = "websocket连接";

/// 帧通道容量
const FRAME_CHANNEL_CAPACITY: usize = 4096;

static CONNECTION_SEQ: AtomicU64 = AtomicU64::new(0);

/// 连接状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Closed,
    Failed(String),
}

impl ConnectionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionStatus::Closed | ConnectionStatus::Failed(_))
    }
}

/// 应用层心跳
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub interval: Duration,
    pub payload: String,
}

/// 消息处理接口
pub trait MessageHandler: Send + Sync + 'static {
    fn handle_message(
        &self,
        connection_id: &str,
        payload: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// 处理帧通道中的消息，单条失败只记录日志
#[instrument(target = "websocket连接", skip_all)]
pub async fn process_frames<H: MessageHandler>(
    mut rx: mpsc::Receiver<(String, String)>,
    handler: Arc<H>,
) {
    debug!(target: WEBSOCKET_CONNECTION_TARGET, "消息处理器启动");
    while let Some((connection_id, payload)) = rx.recv().await {
        if let Err(e) = handler.handle_message(&connection_id, &payload).await {
            warn!(
                target: WEBSOCKET_CONNECTION_TARGET,
                connection_id = %connection_id,
                error_type = e.get_error_type_summary(),
                error = %e,
                "处理消息失败，已丢弃该帧"
            );
        }
    }
    debug!(target: WEBSOCKET_CONNECTION_TARGET, "消息处理器已停止");
}

/// 生成连接ID：`<EXCHANGE>-<毫秒时间戳>-<序号>`
pub fn next_connection_id(prefix: &str) -> String {
    let seq = CONNECTION_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}", prefix, chrono::Utc::now().timestamp_millis(), seq)
}

/// 单条 WebSocket 连接
pub struct WsConnection {
    id: String,
    status_rx: watch::Receiver<ConnectionStatus>,
    outbound_tx: mpsc::UnboundedSender<Message>,
    socket_task: JoinHandle<()>,
    frame_task: JoinHandle<()>,
}

impl WsConnection {
    /// 启动连接任务，不等待握手完成
    pub fn spawn<H: MessageHandler>(
        id: String,
        url: String,
        handler: Arc<H>,
        heartbeat: Option<Heartbeat>,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);

        let frame_task = tokio::spawn(process_frames(frame_rx, handler));
        let socket_task = tokio::spawn(run_socket(
            id.clone(),
            url,
            status_tx,
            outbound_rx,
            frame_tx,
            heartbeat,
        ));

        Self { id, status_rx, outbound_tx, socket_task, frame_task }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        self.status() == ConnectionStatus::Open
    }

    /// 等待连接打开，超时返回 `ConnectionTimeout`
    pub async fn wait_open(&self, exchange: &str, timeout: Duration) -> Result<()> {
        let mut status_rx = self.status_rx.clone();
        let opened = async move {
            loop {
                let status = status_rx.borrow_and_update().clone();
                match status {
                    ConnectionStatus::Open => return Ok(()),
                    ConnectionStatus::Failed(reason) => {
                        return Err(AppError::ConnectionError(format!("{}: {}", exchange, reason)))
                    }
                    ConnectionStatus::Closed => {
                        return Err(AppError::ConnectionError(format!("{}: 连接在打开前关闭", exchange)))
                    }
                    ConnectionStatus::Connecting => {}
                }
                if status_rx.changed().await.is_err() {
                    return Err(AppError::ConnectionError(format!("{}: 连接任务已退出", exchange)));
                }
            }
        };

        match tokio::time::timeout(timeout, opened).await {
            Ok(result) => result,
            Err(_) => Err(AppError::ConnectionTimeout {
                exchange: exchange.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    /// 立即发送文本帧，连接必须已打开
    pub fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(AppError::ConnectionError(format!("连接 {} 未打开", self.id)));
        }
        self.outbound_tx
            .send(Message::Text(text))
            .map_err(|_| AppError::ConnectionError(format!("连接 {} 的发送通道已关闭", self.id)))
    }

    /// 连接仍在建立时按固定间隔轮询，打开后再发送
    pub async fn send_when_open(&self, text: String, poll_interval: Duration) -> Result<()> {
        let mut waited_polls = 0u32;
        loop {
            match self.status() {
                ConnectionStatus::Open => return self.send_text(text),
                ConnectionStatus::Connecting => {
                    if waited_polls == 0 {
                        debug!(target: WEBSOCKET_CONNECTION_TARGET, connection_id = %self.id, "连接尚未打开，等待后发送");
                    }
                    waited_polls += 1;
                    tokio::time::sleep(poll_interval).await;
                }
                status => {
                    return Err(AppError::ConnectionError(format!(
                        "连接 {} 已结束 ({:?})，无法发送",
                        self.id, status
                    )))
                }
            }
        }
    }

    /// 立即关闭，不等待在途消息
    pub fn close(self) {
        info!(target: WEBSOCKET_CONNECTION_TARGET, connection_id = %self.id, "关闭连接");
        self.socket_task.abort();
        self.frame_task.abort();
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.socket_task.abort();
        self.frame_task.abort();
    }
}

#[instrument(target = "websocket连接", skip_all, fields(connection_id = %id))]
async fn run_socket(
    id: String,
    url: String,
    status_tx: watch::Sender<ConnectionStatus>,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    frame_tx: mpsc::Sender<(String, String)>,
    heartbeat: Option<Heartbeat>,
) {
    info!(target: WEBSOCKET_CONNECTION_TARGET, %url, "开始建立连接");
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            let err = AppError::from(e);
            error!(
                target: WEBSOCKET_CONNECTION_TARGET,
                %url,
                error_type = err.get_error_type_summary(),
                error = %err,
                "建立连接失败"
            );
            let _ = status_tx.send(ConnectionStatus::Failed(err.to_string()));
            return;
        }
    };

    // 握手完成后才开始读写
    let _ = status_tx.send(ConnectionStatus::Open);
    info!(target: WEBSOCKET_CONNECTION_TARGET, log_type = "low_freq", %url, "连接已打开");

    let (mut write, mut read) = ws_stream.split();
    let mut heartbeat_timer = heartbeat.as_ref().map(|hb| {
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + hb.interval, hb.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer
    });
    let has_heartbeat = heartbeat_timer.is_some();
    let mut message_count = 0u64;
    let opened_at = Instant::now();

    loop {
        tokio::select! {
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        message_count += 1;
                        let send_start = Instant::now();
                        if frame_tx.send((id.clone(), text)).await.is_err() {
                            warn!(target: WEBSOCKET_CONNECTION_TARGET, "消息处理器已关闭");
                            break;
                        }
                        let wait_micros = send_start.elapsed().as_micros();
                        if wait_micros > 500 {
                            trace!(target: WEBSOCKET_CONNECTION_TARGET, wait_micros, "帧通道出现等待");
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        trace!(target: WEBSOCKET_CONNECTION_TARGET, "收到Ping，发送Pong");
                        if let Err(e) = write.send(Message::Pong(payload)).await {
                            error!(target: WEBSOCKET_CONNECTION_TARGET, error = %e, "发送Pong失败");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(close_frame))) => {
                        info!(target: WEBSOCKET_CONNECTION_TARGET, ?close_frame, "收到关闭消息，连接将关闭");
                        break;
                    }
                    Some(Ok(other)) => {
                        trace!(target: WEBSOCKET_CONNECTION_TARGET, len = other.len(), "忽略非文本消息");
                    }
                    Some(Err(e)) => {
                        error!(target: WEBSOCKET_CONNECTION_TARGET, error = %e, "WebSocket错误");
                        break;
                    }
                    None => {
                        info!(target: WEBSOCKET_CONNECTION_TARGET, "连接被对端关闭");
                        break;
                    }
                }
            },
            Some(msg) = outbound_rx.recv() => {
                trace!(target: WEBSOCKET_CONNECTION_TARGET, ?msg, "发送控制帧");
                if let Err(e) = write.send(msg).await {
                    error!(target: WEBSOCKET_CONNECTION_TARGET, error = %e, "发送消息失败");
                    break;
                }
            },
            _ = async {
                match heartbeat_timer.as_mut() {
                    Some(timer) => { timer.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            }, if has_heartbeat => {
                if let Some(hb) = heartbeat.as_ref() {
                    trace!(target: WEBSOCKET_CONNECTION_TARGET, payload = %hb.payload, "发送心跳");
                    if let Err(e) = write.send(Message::Text(hb.payload.clone())).await {
                        error!(target: WEBSOCKET_CONNECTION_TARGET, error = %e, "发送心跳失败");
                        break;
                    }
                }
            },
        }
    }

    let _ = status_tx.send(ConnectionStatus::Closed);
    info!(
        target: WEBSOCKET_CONNECTION_TARGET,
        log_type = "low_freq",
        message_count,
        alive_secs = opened_at.elapsed().as_secs(),
        "连接已关闭"
    );
}

//=============================================================================
// 订阅簿记
//=============================================================================

/// 按连接记录已订阅的交易对，以及每个交易对使用的请求ID
#[derive(Debug, Default)]
pub struct SubscriptionBook {
    pairs: HashMap<String, HashSet<String>>,
    request_ids: HashMap<String, u64>,
    last_request_id: u64,
}

impl SubscriptionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记订阅，已存在时返回 false
    pub fn add(&mut self, connection_id: &str, pair: &str) -> bool {
        let inserted = self
            .pairs
            .entry(connection_id.to_string())
            .or_default()
            .insert(pair.to_string());
        if inserted {
            self.last_request_id += 1;
            self.request_ids.insert(pair.to_string(), self.last_request_id);
        }
        inserted
    }

    /// 移除订阅，不存在时返回 false
    pub fn remove(&mut self, connection_id: &str, pair: &str) -> bool {
        let removed = match self.pairs.get_mut(connection_id) {
            Some(set) => set.remove(pair),
            None => false,
        };
        if removed {
            if self.pairs.get(connection_id).is_some_and(|set| set.is_empty()) {
                self.pairs.remove(connection_id);
            }
            if !self.pairs.values().any(|set| set.contains(pair)) {
                self.request_ids.remove(pair);
            }
        }
        removed
    }

    pub fn contains(&self, connection_id: &str, pair: &str) -> bool {
        self.pairs.get(connection_id).is_some_and(|set| set.contains(pair))
    }

    /// 订阅时分配的请求ID
    pub fn request_id(&self, pair: &str) -> Option<u64> {
        self.request_ids.get(pair).copied()
    }

    /// 丢弃某条连接上的全部订阅
    pub fn forget_connection(&mut self, connection_id: &str) {
        if let Some(pairs) = self.pairs.remove(connection_id) {
            for pair in pairs {
                if !self.pairs.values().any(|set| set.contains(&pair)) {
                    self.request_ids.remove(&pair);
                }
            }
        }
    }

    pub fn pairs(&self) -> Vec<String> {
        let mut all: Vec<String> = self.pairs.values().flatten().cloned().collect();
        all.sort();
        all.dedup();
        all
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
        self.request_ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_is_idempotent() {
        let mut book = SubscriptionBook::new();
        assert!(book.add("c1", "btcusdt"));
        assert!(!book.add("c1", "btcusdt"));
        assert!(book.add("c1", "ethusdt"));
        assert_eq!(book.request_id("btcusdt"), Some(1));
        assert_eq!(book.request_id("ethusdt"), Some(2));
        assert_eq!(book.pairs(), vec!["btcusdt".to_string(), "ethusdt".to_string()]);
    }

    #[test]
    fn test_unsubscribe_missing_is_noop() {
        let mut book = SubscriptionBook::new();
        assert!(!book.remove("c1", "btcusdt"));
        book.add("c1", "btcusdt");
        assert!(book.remove("c1", "btcusdt"));
        assert!(!book.remove("c1", "btcusdt"));
        assert!(book.is_empty());
        assert_eq!(book.request_id("btcusdt"), None);
    }

    #[test]
    fn test_forget_connection_and_clear() {
        let mut book = SubscriptionBook::new();
        book.add("c1", "btcusdt");
        book.add("c2", "ethusdt");
        book.forget_connection("c1");
        assert!(!book.contains("c1", "btcusdt"));
        assert!(book.contains("c2", "ethusdt"));
        book.clear();
        assert!(book.is_empty());
        // 请求ID在清空后继续递增
        assert!(book.add("c3", "solusdt"));
        assert_eq!(book.request_id("solusdt"), Some(3));
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = next_connection_id("OKX");
        let b = next_connection_id("OKX");
        assert!(a.starts_with("OKX-"));
        assert_ne!(a, b);
    }
}
