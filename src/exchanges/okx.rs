//! OKX 现货公共成交流 (v5)
//!
//! OKX 使用 `BTC-USDT` 形式的 instId，订阅时需要从 `btcusdt` 还原。

use super::{decimal_field, str_field, timestamp_field, truncate, ExchangeProtocol};
use crate::klcommon::{models::normalize_pair, websocket::Heartbeat, AppError, ExchangeId, Result, Side, Trade};
use serde_json::{json, Value};
use std::time::Duration;

const WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
const PRODUCTS_URL: &str = "https://www.okx.com/api/v5/public/instruments?instType=SPOT";
const CHANNEL: &str = "trades";

/// 服务端 30 秒无消息会断开
const PING_INTERVAL: Duration = Duration::from_secs(25);

/// 计价币种，长的在前
const QUOTE_ASSETS: &[&str] = &["USDT", "USDC", "USD"];

#[derive(Debug, Clone, Copy, Default)]
pub struct Okx;

/// `btcusdt` → `BTC-USDT`；无法识别计价币种时原样大写
pub fn to_inst_id(pair: &str) -> String {
    let upper = pair.to_ascii_uppercase();
    if upper.contains('-') {
        return upper;
    }
    for quote in QUOTE_ASSETS {
        if let Some(base) = upper.strip_suffix(quote) {
            if !base.is_empty() && base.chars().all(|c| c.is_ascii_alphanumeric()) {
                return format!("{}-{}", base, quote);
            }
        }
    }
    upper
}

fn control_frame(op: &str, pair: &str) -> String {
    json!({
        "op": op,
        "args": [{"channel": CHANNEL, "instId": to_inst_id(pair)}],
    })
    .to_string()
}

impl ExchangeProtocol for Okx {
    fn id(&self) -> ExchangeId {
        ExchangeId::new(ExchangeId::OKX)
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
        // 心跳回复是纯文本
        if text.trim() == "pong" {
            return Ok(Vec::new());
        }

        let value: Value = serde_json::from_str(text)?;

        if let Some(event) = value.get("event").and_then(Value::as_str) {
            if event == "error" {
                let msg = value.get("msg").and_then(Value::as_str).unwrap_or("unknown");
                return Err(AppError::ParseError(format!("OKX 请求失败: {}", msg)));
            }
            return Ok(Vec::new());
        }

        let Some(data) = value.get("data") else {
            return Err(AppError::ParseError(format!("OKX 无法识别的消息: {}", truncate(text))));
        };
        let channel = value.pointer("/arg/channel").and_then(Value::as_str).unwrap_or_default();
        if channel != CHANNEL {
            return Err(AppError::ParseError(format!("OKX 非成交频道: {}", channel)));
        }

        let items = data
            .as_array()
            .ok_or_else(|| AppError::ParseError("OKX data 不是数组".to_string()))?;

        let exchange = self.id();
        items
            .iter()
            .map(|item| {
                Ok(Trade {
                    exchange: exchange.clone(),
                    pair: normalize_pair(str_field(item, "instId")?),
                    timestamp_ms: timestamp_field(item, "ts")?,
                    price: decimal_field(item, "px")?,
                    size: decimal_field(item, "sz")?,
                    side: if str_field(item, "side")? == "buy" { Side::Buy } else { Side::Sell },
                    liquidation: false,
                })
            })
            .collect()
    }

    fn format_products(&self, body: &Value) -> Result<Vec<String>> {
        let list = body
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| AppError::ParseError("instruments 缺少 data".to_string()))?;
        Ok(list
            .iter()
            .filter(|p| p.get("state").and_then(Value::as_str) == Some("live"))
            .filter_map(|p| p.get("instId").and_then(Value::as_str))
            .map(normalize_pair)
            .collect())
    }

    fn heartbeat(&self) -> Option<Heartbeat> {
        Some(Heartbeat { interval: PING_INTERVAL, payload: "ping".to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inst_id_rewrite() {
        assert_eq!(to_inst_id("btcusdt"), "BTC-USDT");
        assert_eq!(to_inst_id("ethusdc"), "ETH-USDC");
        assert_eq!(to_inst_id("btcusd"), "BTC-USD");
        assert_eq!(to_inst_id("BTC-USDT"), "BTC-USDT");
        assert_eq!(to_inst_id("ethbtc"), "ETHBTC");
        assert_eq!(to_inst_id("usdt"), "USDT");
    }

    #[test]
    fn test_subscribe_sends_hyphenated_inst_id() {
        let frame: Value = serde_json::from_str(&Okx.subscribe_frame("btcusdt", 1)).unwrap();
        assert_eq!(frame, json!({"op": "subscribe", "args": [{"channel": "trades", "instId": "BTC-USDT"}]}));
    }

    #[test]
    fn test_trade_normalizes_pair() {
        let frame = r#"{"arg":{"channel":"trades","instId":"BTC-USDT"},"data":[
            {"instId":"BTC-USDT","tradeId":"130639474","px":"42219.9","sz":"0.12060306","side":"buy","ts":"1630048897897","count":"3"},
            {"instId":"BTC-USDT","tradeId":"130639475","px":"42219.8","sz":"0.5","side":"sell","ts":"1630048897898","count":"1"}
        ]}"#;
        let trades = Okx.parse_message(frame).unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].pair, "btcusdt");
        assert_eq!(trades[0].exchange.as_str(), "OKX");
        assert_eq!(trades[0].timestamp_ms, 1_630_048_897_897);
        assert_eq!(trades[0].side, Side::Buy);
        assert_eq!(trades[1].side, Side::Sell);
        assert_eq!(trades[1].price, 42219.8);
    }

    #[test]
    fn test_events_and_malformed_frames() {
        assert!(Okx.parse_message("pong").unwrap().is_empty());
        assert!(Okx
            .parse_message(r#"{"event":"subscribe","arg":{"channel":"trades","instId":"BTC-USDT"},"connId":"a4d3ae55"}"#)
            .unwrap()
            .is_empty());
        assert!(Okx.parse_message(r#"{"event":"error","code":"60012","msg":"Invalid request"}"#).is_err());
        assert!(Okx.parse_message(r#"{"arg":{"channel":"tickers"},"data":[]}"#).is_err());
        assert!(Okx.parse_message("{{").is_err());
    }

    #[test]
    fn test_format_products() {
        let body = json!({"code": "0", "data": [
            {"instId": "BTC-USDT", "state": "live"},
            {"instId": "XYZ-USDT", "state": "suspend"}
        ]});
        assert_eq!(Okx.format_products(&body).unwrap(), vec!["btcusdt"]);
    }
}
