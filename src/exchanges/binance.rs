//! 币安现货与U本位合约的归集交易流
//!
//! 两者的控制帧和成交帧格式一致，只有端点和产品过滤规则不同。

use super::{decimal_field, str_field, timestamp_field, truncate, ExchangeProtocol};
use crate::klcommon::{models::normalize_pair, AppError, ExchangeId, Result, Side, Trade};
use serde_json::{json, Value};

const SPOT_WS_URL: &str = "wss://stream.binance.com:9443/ws";
const SPOT_PRODUCTS_URL: &str = "https://data-api.binance.vision/api/v3/exchangeInfo";
const FUTURES_WS_URL: &str = "wss://fstream.binance.com/ws";
const FUTURES_PRODUCTS_URL: &str = "https://fapi.binance.com/fapi/v1/exchangeInfo";

/// 币安现货
#[derive(Debug, Clone, Copy, Default)]
pub struct BinanceSpot;

/// 币安U本位永续合约
#[derive(Debug, Clone, Copy, Default)]
pub struct BinanceFutures;

fn control_frame(method: &str, pair: &str, request_id: u64) -> String {
    json!({
        "method": method,
        "params": [format!("{}@aggTrade", pair)],
        "id": request_id,
    })
    .to_string()
}

/// 解析 aggTrade 帧；订阅回执 `{"result":null,"id":N}` 返回空列表
fn parse_agg_trade(exchange: &ExchangeId, text: &str) -> Result<Vec<Trade>> {
    let value: Value = serde_json::from_str(text)?;

    if value.get("E").is_none() || value.get("s").is_none() {
        if value.get("id").is_some() && value.get("result").is_some() {
            return Ok(Vec::new());
        }
        if let Some(msg) = value.get("msg").and_then(Value::as_str) {
            return Err(AppError::ParseError(format!("{} 返回错误: {}", exchange, msg)));
        }
        return Err(AppError::ParseError(format!("{} 无法识别的消息: {}", exchange, truncate(text))));
    }

    let is_buyer_maker = value
        .get("m")
        .and_then(Value::as_bool)
        .ok_or_else(|| AppError::ParseError("缺少布尔字段 `m`".to_string()))?;

    Ok(vec![Trade {
        exchange: exchange.clone(),
        pair: normalize_pair(str_field(&value, "s")?),
        timestamp_ms: timestamp_field(&value, "T")?,
        price: decimal_field(&value, "p")?,
        size: decimal_field(&value, "q")?,
        side: Side::from_buyer_maker(is_buyer_maker),
        liquidation: false,
    }])
}

fn symbols<'a>(body: &'a Value) -> Result<&'a Vec<Value>> {
    body.get("symbols")
        .and_then(Value::as_array)
        .ok_or_else(|| AppError::ParseError("exchangeInfo 缺少 symbols".to_string()))
}

impl ExchangeProtocol for BinanceSpot {
    fn id(&self) -> ExchangeId {
        ExchangeId::new(ExchangeId::BINANCE)
    }

    fn default_ws_url(&self) -> &'static str {
        SPOT_WS_URL
    }

    fn default_products_url(&self) -> &'static str {
        SPOT_PRODUCTS_URL
    }

    fn subscribe_frame(&self, pair: &str, request_id: u64) -> String {
        control_frame("SUBSCRIBE", pair, request_id)
    }

    fn unsubscribe_frame(&self, pair: &str, request_id: u64) -> String {
        control_frame("UNSUBSCRIBE", pair, request_id)
    }

    fn parse_message(&self, text: &str) -> Result<Vec<Trade>> {
        parse_agg_trade(&self.id(), text)
    }

    /// 正在交易且不是杠杆代币的品种
    fn format_products(&self, body: &Value) -> Result<Vec<String>> {
        Ok(symbols(body)?
            .iter()
            .filter(|s| s.get("status").and_then(Value::as_str) == Some("TRADING"))
            .filter(|s| {
                let leveraged = |perms: &Value| {
                    perms.as_array().is_some_and(|list| list.iter().any(|p| p.as_str() == Some("LEVERAGED")))
                };
                !s.get("permissions").is_some_and(leveraged)
            })
            .filter_map(|s| s.get("symbol").and_then(Value::as_str))
            .map(normalize_pair)
            .collect())
    }
}

impl ExchangeProtocol for BinanceFutures {
    fn id(&self) -> ExchangeId {
        ExchangeId::new(ExchangeId::BINANCE_FUTURES)
    }

    fn default_ws_url(&self) -> &'static str {
        FUTURES_WS_URL
    }

    fn default_products_url(&self) -> &'static str {
        FUTURES_PRODUCTS_URL
    }

    fn subscribe_frame(&self, pair: &str, request_id: u64) -> String {
        control_frame("SUBSCRIBE", pair, request_id)
    }

    fn unsubscribe_frame(&self, pair: &str, request_id: u64) -> String {
        control_frame("UNSUBSCRIBE", pair, request_id)
    }

    fn parse_message(&self, text: &str) -> Result<Vec<Trade>> {
        parse_agg_trade(&self.id(), text)
    }

    /// 正在交易的永续合约
    fn format_products(&self, body: &Value) -> Result<Vec<String>> {
        Ok(symbols(body)?
            .iter()
            .filter(|s| s.get("status").and_then(Value::as_str) == Some("TRADING"))
            .filter(|s| s.get("contractType").and_then(Value::as_str) == Some("PERPETUAL"))
            .filter_map(|s| s.get("symbol").and_then(Value::as_str))
            .map(normalize_pair)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AGG_TRADE: &str = r#"{"e":"aggTrade","E":1672515782136,"s":"BTCUSDT","a":12345,"p":"16500.10","q":"0.250","f":100,"l":105,"T":1672515782134,"m":true,"M":true}"#;

    #[test]
    fn test_subscribe_frames() {
        let frame: Value = serde_json::from_str(&BinanceSpot.subscribe_frame("btcusdt", 7)).unwrap();
        assert_eq!(frame, json!({"method": "SUBSCRIBE", "params": ["btcusdt@aggTrade"], "id": 7}));

        let frame: Value = serde_json::from_str(&BinanceFutures.unsubscribe_frame("ethusdt", 3)).unwrap();
        assert_eq!(frame, json!({"method": "UNSUBSCRIBE", "params": ["ethusdt@aggTrade"], "id": 3}));
    }

    #[test]
    fn test_parse_agg_trade() {
        let trades = BinanceSpot.parse_message(AGG_TRADE).unwrap();
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert_eq!(t.exchange.as_str(), "BINANCE");
        assert_eq!(t.pair, "btcusdt");
        assert_eq!(t.timestamp_ms, 1_672_515_782_134);
        assert_eq!(t.price, 16500.10);
        assert_eq!(t.size, 0.25);
        // 买方是做市商 → 卖方主动
        assert_eq!(t.side, Side::Sell);

        let futures = BinanceFutures.parse_message(&AGG_TRADE.replace("\"m\":true", "\"m\":false")).unwrap();
        assert_eq!(futures[0].exchange.as_str(), "BINANCE_FUTURES");
        assert_eq!(futures[0].side, Side::Buy);
    }

    #[test]
    fn test_ack_and_malformed_frames() {
        assert!(BinanceSpot.parse_message(r#"{"result":null,"id":1}"#).unwrap().is_empty());
        assert!(BinanceSpot.parse_message(r#"{"code":2,"msg":"Invalid request"}"#).is_err());
        assert!(BinanceSpot.parse_message("not json").is_err());
        assert!(BinanceSpot.parse_message(r#"{"E":1,"s":"BTCUSDT","p":"1","q":"1","T":1}"#).is_err());
    }

    #[test]
    fn test_format_products() {
        let spot = json!({"symbols": [
            {"symbol": "BTCUSDT", "status": "TRADING", "permissions": ["SPOT", "MARGIN"]},
            {"symbol": "BTCUPUSDT", "status": "TRADING", "permissions": ["LEVERAGED"]},
            {"symbol": "LUNAUSDT", "status": "BREAK", "permissions": ["SPOT"]},
            {"symbol": "ETHBTC", "status": "TRADING"}
        ]});
        assert_eq!(BinanceSpot.format_products(&spot).unwrap(), vec!["btcusdt", "ethbtc"]);

        let futures = json!({"symbols": [
            {"symbol": "BTCUSDT", "status": "TRADING", "contractType": "PERPETUAL"},
            {"symbol": "BTCUSDT_240329", "status": "TRADING", "contractType": "CURRENT_QUARTER"},
            {"symbol": "ETHUSDT", "status": "SETTLING", "contractType": "PERPETUAL"}
        ]});
        assert_eq!(BinanceFutures.format_products(&futures).unwrap(), vec!["btcusdt"]);
        assert!(BinanceFutures.format_products(&json!({})).is_err());
    }
}
