//! 交易所适配层
//!
//! `ExchangeProtocol` 描述单个交易所的线协议（控制帧格式、成交帧解析、产品列表），
//! `FeedAdapter` 在其上复用统一的连接生命周期并实现 `ExchangeAdapter`。

pub mod binance;
pub mod bybit;
pub mod okx;

pub use binance::{BinanceFutures, BinanceSpot};
pub use bybit::Bybit;
pub use okx::Okx;

use crate::klcommon::{
    api,
    config::WebSocketConfig,
    models::normalize_pair,
    websocket::{next_connection_id, ConnectionStatus, Heartbeat, MessageHandler, SubscriptionBook, WsConnection},
    AggrConfig, AppError, ExchangeId, Result, Trade,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, trace, warn};

pub const EXCHANGE_ADAPTER_TARGET: &str = "交易所适配器";

/// 单个交易所的线协议
pub trait ExchangeProtocol: Send + Sync + 'static {
    fn id(&self) -> ExchangeId;

    fn default_ws_url(&self) -> &'static str;

    fn default_products_url(&self) -> &'static str;

    /// 订阅控制帧，`pair` 为归一化小写形式
    fn subscribe_frame(&self, pair: &str, request_id: u64) -> String;

    fn unsubscribe_frame(&self, pair: &str, request_id: u64) -> String;

    /// 解析一帧入站消息。确认帧/心跳返回空列表，无法解析返回错误
    fn parse_message(&self, text: &str) -> Result<Vec<Trade>>;

    /// 从产品列表响应中提取可交易的归一化交易对
    fn format_products(&self, body: &Value) -> Result<Vec<String>>;

    fn heartbeat(&self) -> Option<Heartbeat> {
        None
    }
}

/// 交易所适配器能力集
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn id(&self) -> ExchangeId;

    /// 建立一条新连接，返回连接ID
    async fn connect(&mut self) -> Result<String>;

    /// 订阅交易对，已订阅时返回 false
    async fn subscribe(&mut self, connection_id: &str, pair: &str) -> Result<bool>;

    /// 取消订阅，未订阅时返回 false
    async fn unsubscribe(&mut self, connection_id: &str, pair: &str) -> Result<bool>;

    fn parse_message(&self, text: &str) -> Result<Vec<Trade>>;

    /// 立即关闭全部连接并清空订阅
    fn disconnect(&mut self);

    /// 仍在建立或已打开的连接
    fn connection_ids(&self) -> Vec<String>;

    fn subscribed_pairs(&self) -> Vec<String>;

    async fn fetch_products(&self) -> Result<Vec<String>>;
}

//=============================================================================
// JSON 字段提取
//=============================================================================

pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> Result<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::ParseError(format!("缺少字符串字段 `{}`", key)))
}

/// 数字或数字字符串形式的毫秒时间戳
pub(crate) fn timestamp_field(value: &Value, key: &str) -> Result<i64> {
    match value.get(key) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| AppError::ParseError(format!("字段 `{}` 不是整数", key))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| AppError::ParseError(format!("字段 `{}` 不是整数: {}", key, s))),
        _ => Err(AppError::ParseError(format!("缺少时间戳字段 `{}`", key))),
    }
}

/// 日志中截断过长的原始消息
pub(crate) fn truncate(text: &str) -> String {
    text.chars().take(120).collect()
}

/// 价格/数量字符串。无法解析的值记为 NaN，由成交校验统一丢弃
pub(crate) fn decimal_field(value: &Value, key: &str) -> Result<f64> {
    match value.get(key) {
        Some(Value::String(s)) => Ok(s.trim().parse::<f64>().unwrap_or(f64::NAN)),
        Some(Value::Number(n)) => Ok(n.as_f64().unwrap_or(f64::NAN)),
        _ => Err(AppError::ParseError(format!("缺少数值字段 `{}`", key))),
    }
}

//=============================================================================
// 成交帧处理器
//=============================================================================

/// 解析入站帧、丢弃非法成交，并把有效成交批量送往计算核心
pub struct TradeMessageHandler<P: ExchangeProtocol> {
    protocol: Arc<P>,
    trade_tx: mpsc::Sender<Vec<Trade>>,
    error_count: AtomicUsize,
}

impl<P: ExchangeProtocol> TradeMessageHandler<P> {
    pub fn new(protocol: Arc<P>, trade_tx: mpsc::Sender<Vec<Trade>>) -> Self {
        Self { protocol, trade_tx, error_count: AtomicUsize::new(0) }
    }

    pub fn error_count(&self) -> usize {
        self.error_count.load(Ordering::Relaxed)
    }
}

impl<P: ExchangeProtocol> MessageHandler for TradeMessageHandler<P> {
    fn handle_message(
        &self,
        connection_id: &str,
        payload: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        let parsed = self.protocol.parse_message(payload);
        let connection_id = connection_id.to_string();
        async move {
            let trades = match parsed {
                Ok(trades) => trades,
                Err(e) => {
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            };

            let mut valid = Vec::with_capacity(trades.len());
            for trade in trades {
                if trade.is_valid() {
                    valid.push(trade);
                } else {
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    let err = AppError::InvalidTrade(format!(
                        "{} {} price={} size={}",
                        trade.exchange, trade.pair, trade.price, trade.size
                    ));
                    warn!(
                        target: EXCHANGE_ADAPTER_TARGET,
                        connection_id = %connection_id,
                        error_type = err.get_error_type_summary(),
                        error = %err,
                        "丢弃非法成交"
                    );
                }
            }
            if valid.is_empty() {
                return Ok(());
            }

            let send_start = Instant::now();
            self.trade_tx
                .send(valid)
                .await
                .map_err(|_| AppError::ChannelClosed("trade channel".to_string()))?;

            let wait_micros = send_start.elapsed().as_micros();
            if wait_micros > 500 {
                warn!(
                    target: EXCHANGE_ADAPTER_TARGET,
                    log_type = "performance_alert",
                    wait_micros,
                    "发送成交到计算核心的通道出现等待，可能存在背压"
                );
            }
            Ok(())
        }
    }
}

//=============================================================================
// 通用适配器
//=============================================================================

/// 端点地址
#[derive(Debug, Clone)]
pub struct ExchangeEndpoint {
    pub ws_url: String,
    pub products_url: String,
}

impl ExchangeEndpoint {
    pub fn defaults_for<P: ExchangeProtocol>(protocol: &P) -> Self {
        Self {
            ws_url: protocol.default_ws_url().to_string(),
            products_url: protocol.default_products_url().to_string(),
        }
    }
}

/// 基于 `ExchangeProtocol` 的适配器实现，持有自身的连接与订阅
pub struct FeedAdapter<P: ExchangeProtocol> {
    protocol: Arc<P>,
    endpoint: ExchangeEndpoint,
    connect_timeout: Duration,
    subscribe_poll_interval: Duration,
    handler: Arc<TradeMessageHandler<P>>,
    connections: Vec<WsConnection>,
    subscriptions: SubscriptionBook,
    http: Option<reqwest::Client>,
}

impl<P: ExchangeProtocol> FeedAdapter<P> {
    pub fn new(
        protocol: P,
        endpoint: ExchangeEndpoint,
        ws_config: &WebSocketConfig,
        trade_tx: mpsc::Sender<Vec<Trade>>,
    ) -> Self {
        let protocol = Arc::new(protocol);
        let handler = Arc::new(TradeMessageHandler::new(protocol.clone(), trade_tx));
        let http = match api::build_http_client() {
            Ok(client) => Some(client),
            Err(e) => {
                warn!(target: EXCHANGE_ADAPTER_TARGET, error = %e, "HTTP 客户端创建失败，产品列表不可用");
                None
            }
        };
        Self {
            protocol,
            endpoint,
            connect_timeout: ws_config.connect_timeout(),
            subscribe_poll_interval: ws_config.subscribe_poll_interval(),
            handler,
            connections: Vec::new(),
            subscriptions: SubscriptionBook::new(),
            http,
        }
    }

    /// 使用协议默认端点
    pub fn with_defaults(protocol: P, ws_config: &WebSocketConfig, trade_tx: mpsc::Sender<Vec<Trade>>) -> Self {
        let endpoint = ExchangeEndpoint::defaults_for(&protocol);
        Self::new(protocol, endpoint, ws_config, trade_tx)
    }

    /// 解析失败和非法成交的累计次数
    pub fn error_count(&self) -> usize {
        self.handler.error_count()
    }

    fn connection(&self, connection_id: &str) -> Result<&WsConnection> {
        self.connections
            .iter()
            .find(|c| c.id() == connection_id)
            .ok_or_else(|| AppError::UnknownConnection(connection_id.to_string()))
    }

    /// 清理已结束的连接及其订阅
    fn prune_closed(&mut self) {
        let (alive, dead): (Vec<_>, Vec<_>) = std::mem::take(&mut self.connections)
            .into_iter()
            .partition(|c| !c.status().is_terminal());
        for conn in dead {
            warn!(target: EXCHANGE_ADAPTER_TARGET, exchange = %self.protocol.id(), connection_id = conn.id(), "清理已关闭的连接");
            self.subscriptions.forget_connection(conn.id());
            conn.close();
        }
        self.connections = alive;
    }
}

#[async_trait]
impl<P: ExchangeProtocol> ExchangeAdapter for FeedAdapter<P> {
    fn id(&self) -> ExchangeId {
        self.protocol.id()
    }

    #[instrument(target = "交易所适配器", skip_all)]
    async fn connect(&mut self) -> Result<String> {
        self.prune_closed();

        let exchange = self.protocol.id();
        let connection = WsConnection::spawn(
            next_connection_id(exchange.as_str()),
            self.endpoint.ws_url.clone(),
            self.handler.clone(),
            self.protocol.heartbeat(),
        );

        if let Err(e) = connection.wait_open(exchange.as_str(), self.connect_timeout).await {
            error!(
                target: EXCHANGE_ADAPTER_TARGET,
                error_type = e.get_error_type_summary(),
                error = %e,
                url = %self.endpoint.ws_url,
                "连接交易所失败"
            );
            connection.close();
            return Err(e);
        }

        let connection_id = connection.id().to_string();
        info!(target: EXCHANGE_ADAPTER_TARGET, log_type = "low_freq", %connection_id, "交易所连接已建立");
        self.connections.push(connection);
        Ok(connection_id)
    }

    async fn subscribe(&mut self, connection_id: &str, pair: &str) -> Result<bool> {
        let pair = normalize_pair(pair);
        self.connection(connection_id)?;

        if !self.subscriptions.add(connection_id, &pair) {
            debug!(target: EXCHANGE_ADAPTER_TARGET, exchange = %self.protocol.id(), %pair, "交易对已订阅，忽略");
            return Ok(false);
        }

        let request_id = self.subscriptions.request_id(&pair).unwrap_or_default();
        let frame = self.protocol.subscribe_frame(&pair, request_id);
        let conn = self.connection(connection_id)?;
        if let Err(e) = conn.send_when_open(frame, self.subscribe_poll_interval).await {
            self.subscriptions.remove(connection_id, &pair);
            return Err(e);
        }

        info!(target: EXCHANGE_ADAPTER_TARGET, exchange = %self.protocol.id(), %pair, request_id, "已发送订阅");
        Ok(true)
    }

    async fn unsubscribe(&mut self, connection_id: &str, pair: &str) -> Result<bool> {
        let pair = normalize_pair(pair);
        if !self.subscriptions.contains(connection_id, &pair) {
            debug!(target: EXCHANGE_ADAPTER_TARGET, exchange = %self.protocol.id(), %pair, "交易对未订阅，忽略");
            return Ok(false);
        }

        let request_id = self.subscriptions.request_id(&pair).unwrap_or_default();
        self.subscriptions.remove(connection_id, &pair);

        let frame = self.protocol.unsubscribe_frame(&pair, request_id);
        let conn = self.connection(connection_id)?;
        conn.send_when_open(frame, self.subscribe_poll_interval).await?;

        info!(target: EXCHANGE_ADAPTER_TARGET, exchange = %self.protocol.id(), %pair, "已发送取消订阅");
        Ok(true)
    }

    fn parse_message(&self, text: &str) -> Result<Vec<Trade>> {
        self.protocol.parse_message(text)
    }

    fn disconnect(&mut self) {
        let closed = self.connections.len();
        for conn in self.connections.drain(..) {
            conn.close();
        }
        self.subscriptions.clear();
        info!(target: EXCHANGE_ADAPTER_TARGET, exchange = %self.protocol.id(), closed, "已断开全部连接");
    }

    fn connection_ids(&self) -> Vec<String> {
        self.connections
            .iter()
            .filter(|c| matches!(c.status(), ConnectionStatus::Connecting | ConnectionStatus::Open))
            .map(|c| c.id().to_string())
            .collect()
    }

    fn subscribed_pairs(&self) -> Vec<String> {
        self.subscriptions.pairs()
    }

    async fn fetch_products(&self) -> Result<Vec<String>> {
        let client = self
            .http
            .as_ref()
            .ok_or_else(|| AppError::ConfigError("HTTP 客户端不可用".to_string()))?;
        let body = api::get_json(client, &self.endpoint.products_url).await?;
        let products = self.protocol.format_products(&body)?;
        trace!(target: EXCHANGE_ADAPTER_TARGET, exchange = %self.protocol.id(), count = products.len(), "产品列表已获取");
        Ok(products)
    }
}

//=============================================================================
// 注册表
//=============================================================================

/// 按交易所标识索引的适配器注册表
#[derive(Default)]
pub struct ExchangeRegistry {
    adapters: HashMap<ExchangeId, Box<dyn ExchangeAdapter>>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册内置的四个交易所，遵循配置中的启用开关与端点覆盖
    pub fn with_defaults(config: &AggrConfig, trade_tx: mpsc::Sender<Vec<Trade>>) -> Self {
        let mut registry = Self::new();
        registry.register_protocol(BinanceSpot, config, &trade_tx);
        registry.register_protocol(BinanceFutures, config, &trade_tx);
        registry.register_protocol(Bybit, config, &trade_tx);
        registry.register_protocol(Okx, config, &trade_tx);
        registry
    }

    fn register_protocol<P: ExchangeProtocol>(
        &mut self,
        protocol: P,
        config: &AggrConfig,
        trade_tx: &mpsc::Sender<Vec<Trade>>,
    ) {
        let id = protocol.id();
        let mut endpoint = ExchangeEndpoint::defaults_for(&protocol);
        if let Some(overrides) = config.endpoint_for(id.as_str()) {
            if !overrides.enabled {
                info!(target: EXCHANGE_ADAPTER_TARGET, exchange = %id, "交易所已在配置中禁用");
                return;
            }
            if let Some(url) = &overrides.ws_url {
                endpoint.ws_url = url.clone();
            }
            if let Some(url) = &overrides.products_url {
                endpoint.products_url = url.clone();
            }
        }
        self.register(Box::new(FeedAdapter::new(protocol, endpoint, &config.websocket, trade_tx.clone())));
    }

    /// 注册适配器，同一标识的旧适配器会被替换并断开
    pub fn register(&mut self, adapter: Box<dyn ExchangeAdapter>) {
        if let Some(mut previous) = self.adapters.insert(adapter.id(), adapter) {
            previous.disconnect();
        }
    }

    pub fn get_mut(&mut self, id: &ExchangeId) -> Option<&mut (dyn ExchangeAdapter + 'static)> {
        self.adapters.get_mut(id).map(|adapter| adapter.as_mut())
    }

    pub fn contains(&self, id: &ExchangeId) -> bool {
        self.adapters.contains_key(id)
    }

    pub fn ids(&self) -> Vec<ExchangeId> {
        let mut ids: Vec<ExchangeId> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn disconnect_all(&mut self) {
        for adapter in self.adapters.values_mut() {
            adapter.disconnect();
        }
    }
}
