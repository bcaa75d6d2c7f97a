//! 聚合器端到端流程测试
//!
//! 通过 `AggregatorHandle` 注入成交与指令，验证事件流的顺序与内容。

use aggr_kline::exchanges::{ExchangeEndpoint, ExchangeRegistry, FeedAdapter, Okx};
use aggr_kline::klagg::{clock::now_millis, AggrEvent, EventSubscription, KlineAggregator};
use aggr_kline::klcommon::{floor_to_timeframe, AggrConfig, Bar, ExchangeId, Side, Trade};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

/// 时钟间隔足够长，测试期间只有成交驱动K线
fn quiet_clock_config(timeframe_secs: u32) -> AggrConfig {
    let mut config = AggrConfig::default();
    config.default_timeframe_secs = timeframe_secs;
    config.tick_interval_ms = 3_600_000;
    config
}

fn trade(ts: i64, price: f64, size: f64, side: Side) -> Trade {
    Trade {
        exchange: ExchangeId::new(ExchangeId::BINANCE),
        pair: "btcusdt".to_string(),
        timestamp_ms: ts,
        price,
        size,
        side,
        liquidation: false,
    }
}

async fn next_event(events: &mut EventSubscription) -> AggrEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event bus closed")
}

#[tokio::test]
async fn test_trades_produce_ticks_and_bars() {
    let config = quiet_clock_config(60);
    let (handle, tasks) = KlineAggregator::spawn_with_registry(&config, |_| ExchangeRegistry::new()).unwrap();
    let mut events = handle.subscribe();
    let trades = handle.trade_sender();

    trades
        .send(vec![trade(0, 100.0, 1.0, Side::Buy), trade(30_000, 105.0, 2.0, Side::Sell)])
        .await
        .unwrap();
    trades.send(vec![trade(61_000, 102.0, 0.5, Side::Buy)]).await.unwrap();

    let mut received = Vec::new();
    for _ in 0..4 {
        received.push(next_event(&mut events).await);
    }
    let kinds: Vec<_> = received.iter().map(|e| e.kind()).collect();
    assert_eq!(kinds, vec!["tick", "tick", "bar", "tick"]);

    let AggrEvent::Bar(closed) = received[2] else { unreachable!() };
    assert_eq!((closed.time, closed.open, closed.high, closed.low, closed.close), (0, 100.0, 105.0, 100.0, 105.0));
    assert_eq!((closed.buy_volume, closed.sell_volume), (1.0, 2.0));
    assert_eq!((closed.buy_count, closed.sell_count), (1, 1));

    let AggrEvent::Tick(active) = received[3] else { unreachable!() };
    assert_eq!((active.time, active.open, active.close), (60_000, 105.0, 102.0));

    handle.shutdown();
    tokio::time::timeout(WAIT, tasks.join()).await.unwrap();
}

#[tokio::test]
async fn test_unknown_exchange_reports_error() {
    let config = quiet_clock_config(60);
    let (handle, tasks) = KlineAggregator::spawn_with_registry(&config, |_| ExchangeRegistry::new()).unwrap();
    let mut events = handle.subscribe();

    let err = handle.connect("KRAKEN", "btcusdt").await.unwrap_err();
    assert_eq!(err.get_error_type_summary(), "invalid_target");
    match next_event(&mut events).await {
        AggrEvent::Error { message } => assert!(message.contains("KRAKEN"), "message: {}", message),
        other => panic!("expected error event, got {:?}", other),
    }

    // 未知交易所的断开请求被忽略
    handle.disconnect("KRAKEN", "btcusdt").await.unwrap();
    assert!(handle.list_products("KRAKEN").await.is_err());

    handle.shutdown();
    tokio::time::timeout(WAIT, tasks.join()).await.unwrap();
}

#[tokio::test]
async fn test_timeframe_commands() {
    let config = quiet_clock_config(60);
    let (handle, tasks) = KlineAggregator::spawn_with_registry(&config, |_| ExchangeRegistry::new()).unwrap();
    let mut events = handle.subscribe();

    handle.trade_sender().send(vec![trade(10_000, 100.0, 1.0, Side::Buy)]).await.unwrap();
    assert_eq!(next_event(&mut events).await.kind(), "tick");

    handle.set_timeframe(300).await.unwrap();
    assert_eq!(next_event(&mut events).await, AggrEvent::TimeframeChanged { timeframe: 300 });

    handle.set_timeframe(0).await.unwrap();
    assert_eq!(next_event(&mut events).await.kind(), "error");

    let mut seed = Bar::seeded(600_000, 300, 50.0);
    seed.high = 55.0;
    seed.close = 53.0;
    handle.init_active_bar(Some(seed)).await.unwrap();
    assert_eq!(next_event(&mut events).await, AggrEvent::Tick(seed));

    // 不匹配当前周期的历史K线被拒绝
    handle.init_active_bar(Some(Bar::seeded(600_000, 60, 50.0))).await.unwrap();
    assert_eq!(next_event(&mut events).await.kind(), "error");

    // 下一周期的成交完结种子K线，新K线以其收盘价开盘
    handle.trade_sender().send(vec![trade(905_000, 54.0, 1.0, Side::Sell)]).await.unwrap();
    assert_eq!(next_event(&mut events).await, AggrEvent::Bar(seed));
    match next_event(&mut events).await {
        AggrEvent::Tick(bar) => assert_eq!((bar.time, bar.open, bar.close), (900_000, 53.0, 54.0)),
        other => panic!("expected tick, got {:?}", other),
    }

    handle.shutdown();
    tokio::time::timeout(WAIT, tasks.join()).await.unwrap();
}

#[tokio::test]
async fn test_clock_finalizes_idle_bar() {
    let mut config = AggrConfig::default();
    config.default_timeframe_secs = 60;
    config.tick_interval_ms = 50;
    let (handle, tasks) = KlineAggregator::spawn_with_registry(&config, |_| ExchangeRegistry::new()).unwrap();
    let mut events = handle.subscribe();

    // 两个周期之前的K线，下一次节拍必须把它完结
    let old_time = floor_to_timeframe(now_millis(), 60) - 120_000;
    let seed = Bar::seeded(old_time, 60, 20.0);
    handle.init_active_bar(Some(seed)).await.unwrap();
    assert_eq!(next_event(&mut events).await, AggrEvent::Tick(seed));

    assert_eq!(next_event(&mut events).await, AggrEvent::Bar(seed));
    match next_event(&mut events).await {
        AggrEvent::Tick(bar) => {
            assert!(bar.time > old_time);
            assert_eq!(bar.time % 60_000, 0);
            assert_eq!((bar.open, bar.close, bar.trade_count()), (20.0, 20.0, 0));
        }
        other => panic!("expected tick, got {:?}", other),
    }

    // 同一周期内后续节拍只重发 tick
    assert_eq!(next_event(&mut events).await.kind(), "tick");

    handle.shutdown();
    tokio::time::timeout(WAIT, tasks.join()).await.unwrap();
}

#[tokio::test]
async fn test_connect_streams_exchange_trades() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        // 等待订阅帧后推送一笔成交
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                if text.contains("subscribe") && !text.contains("unsubscribe") {
                    let push = json!({
                        "arg": {"channel": "trades", "instId": "ETH-USDT"},
                        "data": [{"instId": "ETH-USDT", "px": "2000", "sz": "1.5", "side": "buy", "ts": "120000"}]
                    });
                    ws.send(Message::Text(push.to_string())).await.unwrap();
                }
            }
        }
    });

    let config = quiet_clock_config(60);
    let ws_config = config.websocket.clone();
    let (handle, tasks) = KlineAggregator::spawn_with_registry(&config, move |trade_tx| {
        let mut registry = ExchangeRegistry::new();
        let endpoint = ExchangeEndpoint {
            ws_url: format!("ws://{}", addr),
            products_url: "http://127.0.0.1:9/unused".to_string(),
        };
        registry.register(Box::new(FeedAdapter::new(Okx, endpoint, &ws_config, trade_tx)));
        registry
    })
    .unwrap();
    let mut events = handle.subscribe();

    handle.connect(ExchangeId::OKX, "ETH-USDT").await.unwrap();

    // connected 与首个 tick 分别来自 I/O 循环和计算核心，先后不定
    let mut saw_connected = false;
    let mut tick = None;
    while tick.is_none() || !saw_connected {
        match next_event(&mut events).await {
            AggrEvent::Connected { exchange, pair } => {
                assert_eq!((exchange.as_str(), pair.as_str()), ("OKX", "ethusdt"));
                saw_connected = true;
            }
            AggrEvent::Tick(bar) => tick = Some(bar),
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert!(saw_connected);
    let bar = tick.unwrap();
    assert_eq!((bar.time, bar.open, bar.buy_volume), (120_000, 2000.0, 1.5));

    handle.disconnect(ExchangeId::OKX, "ethusdt").await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        AggrEvent::Disconnected { exchange: ExchangeId::new(ExchangeId::OKX), pair: "ethusdt".to_string() }
    );

    handle.shutdown();
    tokio::time::timeout(WAIT, tasks.join()).await.unwrap();
}
