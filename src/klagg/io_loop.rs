//! I/O 循环：串行处理连接/断开指令

use super::events::{AggrEvent, EventBus};
use crate::exchanges::ExchangeRegistry;
use crate::klcommon::{models::normalize_pair, AppError, ExchangeId, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug)]
pub enum IoCmd {
    Connect {
        exchange: ExchangeId,
        pair: String,
        ack: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        exchange: ExchangeId,
        pair: String,
        ack: oneshot::Sender<Result<()>>,
    },
    ListProducts {
        exchange: ExchangeId,
        ack: oneshot::Sender<Result<Vec<String>>>,
    },
}

#[instrument(target = "I/O核心", skip_all, name = "run_io_loop")]
pub async fn run_io_loop(
    mut registry: ExchangeRegistry,
    mut io_cmd_rx: mpsc::Receiver<IoCmd>,
    events: EventBus,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(target: "I/O核心", log_type = "low_freq", exchanges = ?registry.ids(), "I/O 循环启动");

    loop {
        tokio::select! {
            biased;
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() { break; }
            },
            cmd = io_cmd_rx.recv() => {
                let Some(cmd) = cmd else { break; };
                match cmd {
                    IoCmd::Connect { exchange, pair, ack } => {
                        let pair = normalize_pair(&pair);
                        let result = connect_pair(&mut registry, &exchange, &pair).await;
                        match &result {
                            Ok(()) => events.publish(AggrEvent::Connected { exchange, pair }),
                            Err(e) => {
                                error!(
                                    target: "I/O核心",
                                    %exchange,
                                    %pair,
                                    error_type = e.get_error_type_summary(),
                                    error = %e,
                                    "连接失败"
                                );
                                events.publish(AggrEvent::Error { message: e.to_string() });
                            }
                        }
                        let _ = ack.send(result);
                    }
                    IoCmd::Disconnect { exchange, pair, ack } => {
                        let pair = normalize_pair(&pair);
                        let result = disconnect_pair(&mut registry, &exchange, &pair).await;
                        match &result {
                            Ok(true) => events.publish(AggrEvent::Disconnected { exchange, pair }),
                            Ok(false) => {}
                            Err(e) => {
                                warn!(target: "I/O核心", %exchange, %pair, error = %e, "取消订阅失败");
                                events.publish(AggrEvent::Error { message: e.to_string() });
                            }
                        }
                        let _ = ack.send(result.map(|_| ()));
                    }
                    IoCmd::ListProducts { exchange, ack } => {
                        let result = match registry.get_mut(&exchange) {
                            Some(adapter) => adapter.fetch_products().await,
                            None => Err(AppError::UnknownExchange(exchange.to_string())),
                        };
                        let _ = ack.send(result);
                    }
                }
            }
        }
    }

    registry.disconnect_all();
    warn!(target: "I/O核心", "I/O 循环任务已退出");
}

/// 复用已有连接或新建连接，然后订阅
async fn connect_pair(registry: &mut ExchangeRegistry, exchange: &ExchangeId, pair: &str) -> Result<()> {
    let adapter = registry
        .get_mut(exchange)
        .ok_or_else(|| AppError::UnknownExchange(exchange.to_string()))?;

    let connection_id = match adapter.connection_ids().into_iter().next() {
        Some(id) => id,
        None => adapter.connect().await?,
    };

    if !adapter.subscribe(&connection_id, pair).await? {
        debug!(target: "I/O核心", %exchange, %pair, "交易对已在订阅中");
    }
    Ok(())
}

/// 取消订阅；交易所没有剩余订阅时关闭连接。返回是否真正执行了断开
async fn disconnect_pair(registry: &mut ExchangeRegistry, exchange: &ExchangeId, pair: &str) -> Result<bool> {
    let Some(adapter) = registry.get_mut(exchange) else {
        debug!(target: "I/O核心", %exchange, "未知交易所，忽略断开请求");
        return Ok(false);
    };

    // 单条连接失败不影响其余连接，返回第一个错误
    let mut first_error = None;
    for connection_id in adapter.connection_ids() {
        if let Err(e) = adapter.unsubscribe(&connection_id, pair).await {
            warn!(target: "I/O核心", %exchange, %pair, %connection_id, error = %e, "连接取消订阅失败");
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }

    if adapter.subscribed_pairs().is_empty() {
        adapter.disconnect();
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(true),
    }
}
