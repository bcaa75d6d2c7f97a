//! 节拍时钟
//!
//! 按固定间隔把当前时间（毫秒）写入 watch 通道，驱动计算核心在无成交时
//! 也能完成K线切换并重发 tick。

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, instrument, trace, warn};

/// 当前 UTC 毫秒时间
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[instrument(target = "全局时钟", skip_all, name = "run_tick_scheduler")]
pub async fn run_tick_scheduler(
    period: Duration,
    clock_tx: watch::Sender<i64>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(target: "全局时钟", log_type = "low_freq", period_ms = period.as_millis() as u64, "节拍时钟已启动");

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // 第一次 tick 立即完成，跳过
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() { break; }
            },
            _ = ticker.tick() => {
                let now = now_millis();
                trace!(target: "全局时钟", now, "发送时钟节拍");
                if clock_tx.send(now).is_err() {
                    warn!(target: "全局时钟", "时钟接收端已关闭");
                    break;
                }
            },
        }
    }
    info!(target: "全局时钟", log_type = "low_freq", "节拍时钟已停止");
}
