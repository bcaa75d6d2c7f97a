//! Bybit 现货公共成交流 (v5)

use super::{decimal_field, str_field, timestamp_field, truncate, ExchangeProtocol};
use crate::klcommon::{models::normalize_pair, websocket::Heartbeat, AppError, ExchangeId, Result, Side, Trade};
use serde_json::{json, Value};
use std::time::Duration;

const WS_URL: &str = "wss://stream.bybit.com/v5/public/spot";
const PRODUCTS_URL: &str = "https://api.bybit.com/v5/market/instruments-info?category=spot";
const TOPIC_PREFIX: &str = "publicTrade.";

/// 服务端约 20 秒无消息会断开
const PING_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, Default)]
pub struct Bybit;

fn control_frame(op: &str, pair: &str) -> String {
    json!({
        "op": op,
        "args": [format!("{}{}", TOPIC_PREFIX, pair.to_ascii_uppercase())],
    })
    .to_string()
}

impl ExchangeProtocol for Bybit {
    fn id(&self) -> ExchangeId {
        ExchangeId::new(ExchangeId::BYBIT)
    }

    fn default_ws_url(&self) -> &'static str {
        WS_URL
    }

    fn default_products_url(&self) -> &'static str {
        PRODUCTS_URL
    }

    fn subscribe_frame(&self, pair: &str, _request_id: u64) -> String {
        control_frame("subscribe", pair)
    }

    fn unsubscribe_frame(&self, pair: &str, _request_id: u64) -> String {
        control_frame("unsubscribe", pair)
    }

    fn parse_message(&self, text: &str) -> Result<Vec<Trade>> {
        let value: Value = serde_json::from_str(text)?;

        let Some(data) = value.get("data") else {
            // 订阅回执与心跳回复：{"success":true,"op":"subscribe"} / {"op":"pong"}
            if value.get("op").is_some() {
                if value.get("success").and_then(Value::as_bool) == Some(false) {
                    let reason = value.get("ret_msg").and_then(Value::as_str).unwrap_or("unknown");
                    return Err(AppError::ParseError(format!("BYBIT 请求失败: {}", reason)));
                }
                return Ok(Vec::new());
            }
            return Err(AppError::ParseError(format!("BYBIT 无法识别的消息: {}", truncate(text))));
        };

        let topic = value.get("topic").and_then(Value::as_str).unwrap_or_default();
        if !topic.starts_with(TOPIC_PREFIX) {
            return Err(AppError::ParseError(format!("BYBIT 非成交主题: {}", topic)));
        }

        let items = data
            .as_array()
            .ok_or_else(|| AppError::ParseError("BYBIT data 不是数组".to_string()))?;

        let exchange = self.id();
        items
            .iter()
            .map(|item| {
                Ok(Trade {
                    exchange: exchange.clone(),
                    pair: normalize_pair(str_field(item, "s")?),
                    timestamp_ms: timestamp_field(item, "T")?,
                    price: decimal_field(item, "p")?,
                    size: decimal_field(item, "v")?,
                    side: if str_field(item, "S")? == "Buy" { Side::Buy } else { Side::Sell },
                    liquidation: false,
                })
            })
            .collect()
    }

    fn format_products(&self, body: &Value) -> Result<Vec<String>> {
        let list = body
            .pointer("/result/list")
            .and_then(Value::as_array)
            .ok_or_else(|| AppError::ParseError("instruments-info 缺少 result.list".to_string()))?;
        Ok(list
            .iter()
            .filter(|p| p.get("status").and_then(Value::as_str) == Some("Trading"))
            .filter_map(|p| p.get("symbol").and_then(Value::as_str))
            .map(normalize_pair)
            .collect())
    }

    fn heartbeat(&self) -> Option<Heartbeat> {
        Some(Heartbeat { interval: PING_INTERVAL, payload: json!({"op": "ping"}).to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_frame_uses_uppercase_topic() {
        let frame: Value = serde_json::from_str(&Bybit.subscribe_frame("btcusdt", 1)).unwrap();
        assert_eq!(frame, json!({"op": "subscribe", "args": ["publicTrade.BTCUSDT"]}));
        let frame: Value = serde_json::from_str(&Bybit.unsubscribe_frame("ethusdt", 1)).unwrap();
        assert_eq!(frame, json!({"op": "unsubscribe", "args": ["publicTrade.ETHUSDT"]}));
    }

    #[test]
    fn test_parse_batched_trades() {
        let frame = r#"{"topic":"publicTrade.BTCUSDT","type":"snapshot","ts":1672304486868,"data":[
            {"T":1672304486865,"s":"BTCUSDT","S":"Buy","v":"0.001","p":"16578.50","L":"PlusTick","i":"20f43950","BT":false},
            {"T":"1672304486866","s":"BTCUSDT","S":"Sell","v":"0.2","p":"16578.00","L":"MinusTick","i":"20f43951","BT":false}
        ]}"#;
        let trades = Bybit.parse_message(frame).unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].pair, "btcusdt");
        assert_eq!(trades[0].side, Side::Buy);
        assert_eq!(trades[0].price, 16578.5);
        assert_eq!(trades[1].timestamp_ms, 1_672_304_486_866);
        assert_eq!(trades[1].side, Side::Sell);
        assert_eq!(trades[1].size, 0.2);
    }

    #[test]
    fn test_acks_and_errors() {
        assert!(Bybit.parse_message(r#"{"success":true,"ret_msg":"","op":"subscribe","conn_id":"x"}"#).unwrap().is_empty());
        assert!(Bybit.parse_message(r#"{"op":"pong","args":["1"]}"#).unwrap().is_empty());
        assert!(Bybit.parse_message(r#"{"success":false,"ret_msg":"error:handler not found","op":"subscribe"}"#).is_err());
        assert!(Bybit.parse_message(r#"{"topic":"orderbook.1.BTCUSDT","data":{}}"#).is_err());
        assert!(Bybit.parse_message("[").is_err());
    }

    #[test]
    fn test_format_products() {
        let body = json!({"retCode": 0, "result": {"category": "spot", "list": [
            {"symbol": "BTCUSDT", "status": "Trading"},
            {"symbol": "OLDUSDT", "status": "Closed"}
        ]}});
        assert_eq!(Bybit.format_products(&body).unwrap(), vec!["btcusdt"]);
        assert!(Bybit.heartbeat().is_some());
    }
}
