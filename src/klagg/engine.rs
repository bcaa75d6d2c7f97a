//! K线状态机
//!
//! 同一时刻只存在一根活动K线。成交和时钟两条路径共用 `rollover`：
//! 先完结旧K线，再以旧收盘价播种新K线，保证相邻K线首尾相接。

use super::clock::now_millis;
use super::events::AggrEvent;
use crate::klcommon::{
    config::constants::{DEFAULT_MAX_GAP_FILL_BARS, DEFAULT_MAX_TRADE_LEAD_MS},
    models::{floor_to_timeframe, timeframe_ms},
    AppError, Bar, Result, Trade,
};
use tracing::{debug, error, trace, warn};

/// 触发K线切换的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloverTrigger {
    Trade,
    Clock,
}

pub struct BarEngine {
    timeframe_secs: u32,
    active_bar: Option<Bar>,
    fill_gaps: bool,
    /// 单次切换最多补齐的空K线数
    max_gap_fill_bars: u32,
    /// 成交时间允许超前墙钟的最大毫秒数
    max_trade_lead_ms: i64,
    clock: fn() -> i64,
    stale_trades: u64,
    rejected_trades: u64,
}

impl BarEngine {
    pub fn new(timeframe_secs: u32, fill_gaps: bool) -> Result<Self> {
        if timeframe_secs == 0 {
            return Err(AppError::InvalidTimeframe(timeframe_secs));
        }
        Ok(Self {
            timeframe_secs,
            active_bar: None,
            fill_gaps,
            max_gap_fill_bars: DEFAULT_MAX_GAP_FILL_BARS,
            max_trade_lead_ms: DEFAULT_MAX_TRADE_LEAD_MS as i64,
            clock: now_millis,
            stale_trades: 0,
            rejected_trades: 0,
        })
    }

    pub fn with_max_gap_fill_bars(mut self, max_bars: u32) -> Self {
        self.max_gap_fill_bars = max_bars;
        self
    }

    pub fn with_max_trade_lead_ms(mut self, lead_ms: u64) -> Self {
        self.max_trade_lead_ms = i64::try_from(lead_ms).unwrap_or(i64::MAX);
        self
    }

    /// 替换墙钟来源
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    /// 允许的最晚时间戳（毫秒）
    fn latest_accepted_ms(&self) -> i64 {
        (self.clock)().saturating_add(self.max_trade_lead_ms)
    }

    pub fn timeframe(&self) -> u32 {
        self.timeframe_secs
    }

    pub fn active_bar(&self) -> Option<&Bar> {
        self.active_bar.as_ref()
    }

    /// 因时间早于活动K线而被忽略的成交数
    pub fn stale_trades(&self) -> u64 {
        self.stale_trades
    }

    pub fn rejected_trades(&self) -> u64 {
        self.rejected_trades
    }

    /// 合并一笔成交，必要时先切换K线
    pub fn on_trade(&mut self, trade: &Trade, out: &mut Vec<AggrEvent>) {
        if !trade.is_valid() {
            self.rejected_trades += 1;
            warn!(
                target: "计算核心",
                exchange = %trade.exchange,
                pair = %trade.pair,
                price = trade.price,
                size = trade.size,
                "非法成交在合并前被丢弃"
            );
            return;
        }

        // 成交时间不得超前墙钟过多（例如误用微秒时间戳）
        let latest = self.latest_accepted_ms();
        if trade.timestamp_ms > latest {
            self.rejected_trades += 1;
            let err = AppError::InvalidTrade(format!(
                "{} {} timestamp {} is ahead of the clock limit {}",
                trade.exchange, trade.pair, trade.timestamp_ms, latest
            ));
            warn!(target: "计算核心", error_type = err.get_error_type_summary(), error = %err, "丢弃时间超前的成交");
            return;
        }

        let bucket = floor_to_timeframe(trade.timestamp_ms, self.timeframe_secs);
        match self.active_bar {
            None => {
                self.active_bar = Some(Bar::seeded(bucket, self.timeframe_secs, trade.price));
            }
            Some(bar) if bucket > bar.time => {
                self.rollover(bucket, RolloverTrigger::Trade, out);
            }
            Some(bar) if bucket < bar.time => {
                self.stale_trades += 1;
                debug!(target: "计算核心", bucket, active_time = bar.time, "忽略早于活动K线的成交");
                return;
            }
            Some(_) => {}
        }

        if let Some(bar) = self.active_bar.as_mut() {
            bar.merge(trade);
            debug_assert!(bar.is_consistent(), "OHLC invariant violated: {:?}", bar);
            out.push(AggrEvent::Tick(*bar));
        }
    }

    /// 时钟节拍：周期已推进则切换，否则重发当前K线
    pub fn on_clock(&mut self, now_ms: i64, out: &mut Vec<AggrEvent>) {
        let Some(active_time) = self.active_bar.map(|bar| bar.time) else {
            return;
        };

        let current_bucket = floor_to_timeframe(now_ms, self.timeframe_secs);
        if current_bucket > active_time {
            self.rollover(current_bucket, RolloverTrigger::Clock, out);
        }

        if let Some(bar) = self.active_bar {
            out.push(AggrEvent::Tick(bar));
        }
    }

    /// 修改周期并丢弃进行中的K线，不做完结
    pub fn set_timeframe(&mut self, timeframe_secs: u32, out: &mut Vec<AggrEvent>) -> Result<()> {
        if timeframe_secs == 0 {
            return Err(AppError::InvalidTimeframe(timeframe_secs));
        }
        if let Some(dropped) = self.active_bar.take() {
            debug!(target: "计算核心", dropped_time = dropped.time, old = self.timeframe_secs, new = timeframe_secs, "周期变更，丢弃进行中的K线");
        }
        self.timeframe_secs = timeframe_secs;
        out.push(AggrEvent::TimeframeChanged { timeframe: timeframe_secs });
        Ok(())
    }

    /// 用历史K线播种活动K线，并立即发出一次 tick；`None` 清空活动K线
    pub fn init_active_bar(&mut self, bar: Option<Bar>, out: &mut Vec<AggrEvent>) -> Result<()> {
        let Some(bar) = bar else {
            self.active_bar = None;
            return Ok(());
        };

        if bar.timeframe != self.timeframe_secs {
            return Err(AppError::InvalidBar(format!(
                "timeframe {}s does not match current {}s",
                bar.timeframe, self.timeframe_secs
            )));
        }
        if floor_to_timeframe(bar.time, self.timeframe_secs) != bar.time {
            return Err(AppError::InvalidBar(format!("time {} is not aligned to {}s", bar.time, bar.timeframe)));
        }
        if !bar.is_consistent() {
            return Err(AppError::InvalidBar(format!("inconsistent OHLC: {:?}", bar)));
        }
        if bar.time > self.latest_accepted_ms() {
            return Err(AppError::InvalidBar(format!("time {} is in the future", bar.time)));
        }

        self.active_bar = Some(bar);
        out.push(AggrEvent::Tick(bar));
        Ok(())
    }

    /// 完结当前K线，（可选）补齐空缺周期，并在 `new_time` 播种新K线
    fn rollover(&mut self, new_time: i64, trigger: RolloverTrigger, out: &mut Vec<AggrEvent>) {
        let Some(previous) = self.active_bar.take() else {
            return;
        };
        if new_time <= previous.time {
            error!(target: "计算核心", log_type = "assertion", new_time, previous_time = previous.time, "K线切换目标不晚于当前K线");
            self.active_bar = Some(previous);
            return;
        }

        let last_close = previous.close;
        out.push(AggrEvent::Bar(previous));

        let width = timeframe_ms(self.timeframe_secs);
        let first_gap = previous.time + width;
        let gap_bars = (new_time - first_gap) / width;
        if self.fill_gaps && gap_bars > 0 {
            let filled = gap_bars.min(self.max_gap_fill_bars as i64);
            for i in 0..filled {
                out.push(AggrEvent::Bar(Bar::seeded(first_gap + i * width, self.timeframe_secs, last_close)));
            }
            if filled < gap_bars {
                warn!(
                    target: "计算核心",
                    gap_bars,
                    filled,
                    max_gap_fill_bars = self.max_gap_fill_bars,
                    "空缺周期超过补齐上限，其余周期跳过"
                );
            } else {
                debug!(target: "计算核心", filled, "补齐空缺K线");
            }
        } else if gap_bars > 0 {
            trace!(target: "计算核心", gap_bars, "跳过无成交的周期");
        }

        trace!(target: "计算核心", ?trigger, previous_time = previous.time, new_time, "K线切换");
        self.active_bar = Some(Bar::seeded(new_time, self.timeframe_secs, last_close));
    }
}
