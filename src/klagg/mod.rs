//! 实时K线聚合器
//!
//! 三个任务协作：
//! - 计算核心：独占 `BarEngine`，串行处理成交、时钟节拍和引擎指令；
//! - I/O 循环：持有交易所注册表，串行处理连接与订阅；
//! - 节拍时钟：按固定间隔推送当前时间。
//!
//! 调用方通过 `AggregatorHandle` 发送指令并订阅事件。

pub mod clock;
pub mod engine;
pub mod events;
pub mod io_loop;


pub use engine::{BarEngine, RolloverTrigger};
pub use events::{AggrEvent, EventBus, EventSubscription};
pub use io_loop::IoCmd;

use crate::exchanges::ExchangeRegistry;
use crate::klcommon::{AggrConfig, AppError, Bar, ExchangeId, Result, Trade};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// 计算核心指令
#[derive(Debug)]
pub enum EngineCmd {
    SetTimeframe(u32),
    InitActiveBar(Option<Bar>),
}

/// 计算核心：独占活动K线
pub struct KlineAggregator {
    engine: BarEngine,
    events: EventBus,
    cmd_rx: mpsc::Receiver<EngineCmd>,
    clock_rx: watch::Receiver<i64>,
    out: Vec<AggrEvent>,
}

impl KlineAggregator {
    /// 使用内置交易所启动聚合器
    pub fn spawn(config: &AggrConfig) -> Result<(AggregatorHandle, AggregatorTasks)> {
        Self::spawn_with_registry(config, |trade_tx| ExchangeRegistry::with_defaults(config, trade_tx))
    }

    /// 使用自定义注册表启动聚合器；`build_registry` 收到成交通道的发送端
    pub fn spawn_with_registry<F>(config: &AggrConfig, build_registry: F) -> Result<(AggregatorHandle, AggregatorTasks)>
    where
        F: FnOnce(mpsc::Sender<Vec<Trade>>) -> ExchangeRegistry,
    {
        config.validate()?;
        let engine = BarEngine::new(config.default_timeframe_secs, config.fill_gaps)?
            .with_max_gap_fill_bars(config.max_gap_fill_bars)
            .with_max_trade_lead_ms(config.max_trade_lead_ms);

        let (trade_tx, trade_rx) = mpsc::channel(config.channels.trade_capacity);
        let (engine_cmd_tx, engine_cmd_rx) = mpsc::channel(config.channels.command_capacity);
        let (io_cmd_tx, io_cmd_rx) = mpsc::channel(config.channels.command_capacity);
        let (clock_tx, clock_rx) = watch::channel(0i64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let events = EventBus::new(config.channels.event_capacity);

        let registry = build_registry(trade_tx.clone());

        let aggregator = KlineAggregator {
            engine,
            events: events.clone(),
            cmd_rx: engine_cmd_rx,
            clock_rx,
            out: Vec::with_capacity(8),
        };

        let computation = tokio::spawn(aggregator.run_aggregation_loop(shutdown_rx.clone(), trade_rx));
        let io = tokio::spawn(io_loop::run_io_loop(registry, io_cmd_rx, events.clone(), shutdown_rx.clone()));
        let clock = tokio::spawn(clock::run_tick_scheduler(config.tick_interval(), clock_tx, shutdown_rx));

        info!(
            target: "计算核心",
            log_type = "low_freq",
            timeframe = config.default_timeframe_secs,
            tick_interval_ms = config.tick_interval_ms,
            fill_gaps = config.fill_gaps,
            "聚合器已启动"
        );

        let handle = AggregatorHandle {
            engine_cmd_tx,
            io_cmd_tx,
            trade_tx,
            events,
            shutdown_tx: Arc::new(shutdown_tx),
        };
        Ok((handle, AggregatorTasks { computation, io, clock }))
    }

    #[instrument(target = "计算核心", skip_all, name = "run_aggregation_loop")]
    pub async fn run_aggregation_loop(
        mut self,
        mut shutdown_rx: watch::Receiver<bool>,
        mut trade_rx: mpsc::Receiver<Vec<Trade>>,
    ) {
        info!(target: "计算核心", log_type = "low_freq", "聚合循环开始");
        let mut trades_count = 0u64;

        loop {
            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() { break; }
                },
                Some(cmd) = self.cmd_rx.recv() => {
                    debug!(target: "计算核心", ?cmd, "收到聚合器指令");
                    self.process_command(cmd);
                },
                Some(batch) = trade_rx.recv() => {
                    trades_count += batch.len() as u64;
                    for trade in &batch {
                        self.engine.on_trade(trade, &mut self.out);
                    }
                    self.flush();
                },
                Ok(_) = self.clock_rx.changed() => {
                    let now = *self.clock_rx.borrow_and_update();
                    if now > 0 {
                        self.engine.on_clock(now, &mut self.out);
                        self.flush();
                    }
                },
                else => break,
            }
        }
        warn!(
            target: "计算核心",
            trades_count,
            stale_trades = self.engine.stale_trades(),
            rejected_trades = self.engine.rejected_trades(),
            "聚合循环退出"
        );
    }

    fn process_command(&mut self, cmd: EngineCmd) {
        let result = match cmd {
            EngineCmd::SetTimeframe(timeframe) => self.engine.set_timeframe(timeframe, &mut self.out),
            EngineCmd::InitActiveBar(bar) => self.engine.init_active_bar(bar, &mut self.out),
        };
        if let Err(e) = result {
            warn!(target: "计算核心", error_type = e.get_error_type_summary(), error = %e, "聚合器指令被拒绝");
            self.out.push(AggrEvent::Error { message: e.to_string() });
        }
        self.flush();
    }

    fn flush(&mut self) {
        for event in self.out.drain(..) {
            self.events.publish(event);
        }
    }
}

/// 聚合器后台任务句柄
pub struct AggregatorTasks {
    pub computation: JoinHandle<()>,
    pub io: JoinHandle<()>,
    pub clock: JoinHandle<()>,
}

impl AggregatorTasks {
    /// 等待全部任务退出
    pub async fn join(self) {
        for (name, task) in [("computation", self.computation), ("io", self.io), ("clock", self.clock)] {
            if let Err(e) = task.await {
                warn!(target: "计算核心", task = name, error = %e, "后台任务异常退出");
            }
        }
    }
}

/// 聚合器的调用入口，可克隆
#[derive(Clone)]
pub struct AggregatorHandle {
    engine_cmd_tx: mpsc::Sender<EngineCmd>,
    io_cmd_tx: mpsc::Sender<IoCmd>,
    trade_tx: mpsc::Sender<Vec<Trade>>,
    events: EventBus,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl AggregatorHandle {
    /// 连接交易所并订阅交易对，在连接打开或超时后返回
    pub async fn connect(&self, exchange: impl Into<ExchangeId>, pair: &str) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.send_io(IoCmd::Connect { exchange: exchange.into(), pair: pair.to_string(), ack }).await?;
        rx.await.map_err(|_| AppError::ChannelClosed("connect ack".to_string()))?
    }

    pub async fn disconnect(&self, exchange: impl Into<ExchangeId>, pair: &str) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.send_io(IoCmd::Disconnect { exchange: exchange.into(), pair: pair.to_string(), ack }).await?;
        rx.await.map_err(|_| AppError::ChannelClosed("disconnect ack".to_string()))?
    }

    /// 获取交易所的可交易品种列表
    pub async fn list_products(&self, exchange: impl Into<ExchangeId>) -> Result<Vec<String>> {
        let (ack, rx) = oneshot::channel();
        self.send_io(IoCmd::ListProducts { exchange: exchange.into(), ack }).await?;
        rx.await.map_err(|_| AppError::ChannelClosed("products ack".to_string()))?
    }

    /// 校验失败会以 `error` 事件报告
    pub async fn set_timeframe(&self, timeframe_secs: u32) -> Result<()> {
        self.send_engine(EngineCmd::SetTimeframe(timeframe_secs)).await
    }

    pub async fn init_active_bar(&self, bar: Option<Bar>) -> Result<()> {
        self.send_engine(EngineCmd::InitActiveBar(bar)).await
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.events.subscribe()
    }

    /// 成交通道发送端，可用于回放或注入成交
    pub fn trade_sender(&self) -> mpsc::Sender<Vec<Trade>> {
        self.trade_tx.clone()
    }

    /// 通知全部任务退出，I/O 循环退出前会断开所有交易所
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn send_engine(&self, cmd: EngineCmd) -> Result<()> {
        self.engine_cmd_tx
            .send(cmd)
            .await
            .map_err(|_| AppError::ChannelClosed("engine command".to_string()))
    }

    async fn send_io(&self, cmd: IoCmd) -> Result<()> {
        self.io_cmd_tx
            .send(cmd)
            .await
            .map_err(|_| AppError::ChannelClosed("io command".to_string()))
    }
}
