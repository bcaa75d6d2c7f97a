//! 归一化交易与K线数据模型

use serde::{Deserialize, Serialize};
use std::fmt;

/// 交易所标识，统一为大写字符串（例如 `BINANCE_FUTURES`）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeId(String);

impl ExchangeId {
    pub const BINANCE: &'static str = "BINANCE";
    pub const BINANCE_FUTURES: &'static str = "BINANCE_FUTURES";
    pub const BYBIT: &'static str = "BYBIT";
    pub const OKX: &'static str = "OKX";

    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExchangeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ExchangeId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// 主动成交方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// 按 "买方是否为做市商" 推导方向：买方挂单被吃即为卖方主动
    pub fn from_buyer_maker(is_buyer_maker: bool) -> Self {
        if is_buyer_maker { Side::Sell } else { Side::Buy }
    }
}

/// 单笔归一化成交
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub exchange: ExchangeId,
    /// 小写拼接形式，例如 `btcusdt`
    pub pair: String,
    /// 成交时间戳（毫秒）
    pub timestamp_ms: i64,
    pub price: f64,
    pub size: f64,
    pub side: Side,
    #[serde(default)]
    pub liquidation: bool,
}

impl Trade {
    /// 价格必须为正的有限数，数量必须为非负有限数
    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && self.price > 0.0 && self.size.is_finite() && self.size >= 0.0
    }
}

/// 一根固定周期的 OHLCV K线
///
/// 序列化时附带派生字段 `volume`、`tradeCount`、`liquidationVolume`，反序列化时忽略它们。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", into = "BarPayload")]
pub struct Bar {
    /// 周期起始时间（毫秒），始终按周期对齐
    pub time: i64,
    /// 周期长度（秒）
    pub timeframe: u32,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub buy_count: u64,
    pub sell_count: u64,
    pub buy_liquidation: f64,
    pub sell_liquidation: f64,
}

impl Bar {
    /// 以单一价格播种一根空K线
    pub fn seeded(time: i64, timeframe: u32, price: f64) -> Self {
        Self {
            time,
            timeframe,
            open: price,
            high: price,
            low: price,
            close: price,
            buy_volume: 0.0,
            sell_volume: 0.0,
            buy_count: 0,
            sell_count: 0,
            buy_liquidation: 0.0,
            sell_liquidation: 0.0,
        }
    }

    /// 将一笔成交合并进当前K线
    pub fn merge(&mut self, trade: &Trade) {
        self.close = trade.price;
        self.high = self.high.max(trade.price);
        self.low = self.low.min(trade.price);

        match trade.side {
            Side::Buy => {
                self.buy_volume += trade.size;
                self.buy_count += 1;
                if trade.liquidation {
                    self.buy_liquidation += trade.size;
                }
            }
            Side::Sell => {
                self.sell_volume += trade.size;
                self.sell_count += 1;
                if trade.liquidation {
                    self.sell_liquidation += trade.size;
                }
            }
        }
    }

    pub fn volume(&self) -> f64 {
        self.buy_volume + self.sell_volume
    }

    pub fn trade_count(&self) -> u64 {
        self.buy_count + self.sell_count
    }

    pub fn liquidation_volume(&self) -> f64 {
        self.buy_liquidation + self.sell_liquidation
    }

    /// OHLC 极值关系是否成立
    pub fn is_consistent(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        prices.iter().all(|p| p.is_finite())
            && self.high >= self.open.max(self.close)
            && self.low <= self.open.min(self.close)
    }
}

/// `Bar` 的对外序列化形式
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BarPayload {
    time: i64,
    timeframe: u32,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    buy_volume: f64,
    sell_volume: f64,
    trade_count: u64,
    buy_count: u64,
    sell_count: u64,
    liquidation_volume: f64,
    buy_liquidation: f64,
    sell_liquidation: f64,
}

impl From<Bar> for BarPayload {
    fn from(bar: Bar) -> Self {
        Self {
            time: bar.time,
            timeframe: bar.timeframe,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume(),
            buy_volume: bar.buy_volume,
            sell_volume: bar.sell_volume,
            trade_count: bar.trade_count(),
            buy_count: bar.buy_count,
            sell_count: bar.sell_count,
            liquidation_volume: bar.liquidation_volume(),
            buy_liquidation: bar.buy_liquidation,
            sell_liquidation: bar.sell_liquidation,
        }
    }
}

/// 周期长度（毫秒）
pub fn timeframe_ms(timeframe_secs: u32) -> i64 {
    timeframe_secs as i64 * 1000
}

/// 将毫秒时间戳向下对齐到周期起点
pub fn floor_to_timeframe(timestamp_ms: i64, timeframe_secs: u32) -> i64 {
    let width = timeframe_ms(timeframe_secs);
    if width == 0 {
        return timestamp_ms;
    }
    timestamp_ms.div_euclid(width) * width
}

/// 交易对归一化：只保留字母数字并转小写（`BTC-USDT` → `btcusdt`）
pub fn normalize_pair(pair: &str) -> String {
    pair.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(price: f64, size: f64, side: Side) -> Trade {
        Trade {
            exchange: ExchangeId::new("binance"),
            pair: "btcusdt".to_string(),
            timestamp_ms: 0,
            price,
            size,
            side,
            liquidation: false,
        }
    }

    #[test]
    fn test_floor_to_timeframe() {
        assert_eq!(floor_to_timeframe(0, 60), 0);
        assert_eq!(floor_to_timeframe(59_999, 60), 0);
        assert_eq!(floor_to_timeframe(61_000, 60), 60_000);
        assert_eq!(floor_to_timeframe(1_700_000_123_456, 300), 1_700_000_100_000);
        // 负时间戳向下取整
        assert_eq!(floor_to_timeframe(-1, 60), -60_000);
    }

    #[test]
    fn test_merge_accumulates_by_side() {
        let mut bar = Bar::seeded(0, 60, 100.0);
        bar.merge(&trade(105.0, 2.0, Side::Buy));
        bar.merge(&trade(98.0, 1.5, Side::Sell));
        let mut liq = trade(99.0, 0.5, Side::Sell);
        liq.liquidation = true;
        bar.merge(&liq);

        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.high, 105.0);
        assert_eq!(bar.low, 98.0);
        assert_eq!(bar.close, 99.0);
        assert_eq!(bar.buy_volume, 2.0);
        assert_eq!(bar.sell_volume, 2.0);
        assert_eq!(bar.trade_count(), 3);
        assert_eq!(bar.liquidation_volume(), 0.5);
        assert!(bar.is_consistent());
    }

    #[test]
    fn test_trade_validity() {
        assert!(trade(1.0, 0.0, Side::Buy).is_valid());
        assert!(!trade(f64::NAN, 1.0, Side::Buy).is_valid());
        assert!(!trade(1.0, f64::INFINITY, Side::Buy).is_valid());
        assert!(!trade(0.0, 1.0, Side::Buy).is_valid());
        assert!(!trade(1.0, -2.0, Side::Sell).is_valid());
    }

    #[test]
    fn test_normalize_pair_and_exchange_id() {
        assert_eq!(normalize_pair("BTC-USDT"), "btcusdt");
        assert_eq!(normalize_pair("ethusdt"), "ethusdt");
        assert_eq!(ExchangeId::new(" okx ").as_str(), ExchangeId::OKX);
        assert_eq!(Side::from_buyer_maker(true), Side::Sell);
        assert_eq!(Side::from_buyer_maker(false), Side::Buy);
    }

    #[test]
    fn test_bar_serializes_camel_case() {
        let json = serde_json::to_value(Bar::seeded(60_000, 60, 1.5)).unwrap();
        assert_eq!(json["time"], 60_000);
        assert_eq!(json["buyVolume"], 0.0);
        assert_eq!(json["sellLiquidation"], 0.0);
    }

    #[test]
    fn test_bar_payload_carries_derived_totals() {
        let mut bar = Bar::seeded(60_000, 60, 100.0);
        bar.merge(&trade(101.0, 2.0, Side::Buy));
        let mut liq = trade(99.0, 0.5, Side::Sell);
        liq.liquidation = true;
        bar.merge(&liq);

        let json = serde_json::to_value(bar).unwrap();
        assert_eq!(json["volume"], 2.5);
        assert_eq!(json["tradeCount"], 2);
        assert_eq!(json["liquidationVolume"], 0.5);

        // 派生字段在反序列化时被忽略，其余字段原样恢复
        let back: Bar = serde_json::from_value(json).unwrap();
        assert_eq!(back, bar);
    }
}
