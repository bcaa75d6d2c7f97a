//! 实时K线聚合服务
//!
//! 连接指定交易所、订阅交易对，并把聚合事件逐行以 JSON 写到标准输出。

use aggr_kline::klagg::{AggrEvent, KlineAggregator};
use aggr_kline::klcommon::{logging_setup::init_logging, AggrConfig, ExchangeId};
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use tracing::{error, info, warn};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Real-time multi-exchange trade aggregation into OHLCV bars.", long_about = None)]
struct Args {
    /// Path to the TOML config file (falls back to CONFIG_PATH, then config/AggrKlineConfig.toml).
    #[arg(short, long)]
    config: Option<String>,

    /// Exchange id: BINANCE, BINANCE_FUTURES, BYBIT or OKX.
    #[arg(short, long, default_value = "BINANCE")]
    exchange: String,

    /// Comma-separated pairs to subscribe (e.g. "btcusdt,ethusdt").
    #[arg(short, long, value_delimiter = ',', default_value = "btcusdt")]
    pairs: Vec<String>,

    /// Bar width in seconds; overrides default_timeframe_secs.
    #[arg(short, long)]
    timeframe: Option<u32>,

    /// Print the tradable pairs of the exchange and exit.
    #[arg(long, default_value_t = false)]
    list_products: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AggrConfig::load_or_default(args.config.as_deref()).context("加载配置失败")?;
    if let Some(timeframe) = args.timeframe {
        config.default_timeframe_secs = timeframe;
        config.validate().context("命令行参数无效")?;
    }

    let _log_guard = init_logging(&config.logging).context("初始化日志失败")?;

    let (handle, tasks) = KlineAggregator::spawn(&config).context("启动聚合器失败")?;
    let exchange = ExchangeId::new(&args.exchange);

    if args.list_products {
        let products = handle.list_products(exchange.clone()).await.context("获取产品列表失败")?;
        let mut stdout = std::io::stdout().lock();
        for pair in products {
            writeln!(stdout, "{}", pair)?;
        }
        handle.shutdown();
        tasks.join().await;
        return Ok(());
    }

    let mut events = handle.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let AggrEvent::Error { message } = &event {
                warn!(target: "计算核心", %message, "聚合器报告错误");
            }
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => error!(target: "计算核心", error = %e, "事件序列化失败"),
            }
        }
    });

    for pair in &args.pairs {
        // 单个交易对失败只记录，不影响其他交易对
        match handle.connect(exchange.clone(), pair).await {
            Ok(()) => info!(target: "I/O核心", %exchange, %pair, "订阅成功"),
            Err(e) => error!(target: "I/O核心", %exchange, %pair, error = %e, "订阅失败"),
        }
    }

    tokio::signal::ctrl_c().await.context("等待 Ctrl-C 失败")?;
    info!(target: "计算核心", "收到关闭信号，开始关闭...");

    handle.shutdown();
    tasks.join().await;
    printer.abort();
    info!(target: "计算核心", "服务已关闭");
    Ok(())
}
