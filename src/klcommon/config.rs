//! K线聚合系统配置模块

use crate::klcommon::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// 系统配置常量
pub mod constants {
    /// 默认配置文件路径
    pub const DEFAULT_CONFIG_PATH: &str = "config/AggrKlineConfig.toml";

    /// 默认K线周期（秒）
    pub const DEFAULT_TIMEFRAME_SECS: u32 = 300;

    /// 默认时钟节拍间隔（毫秒）
    pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;

    /// 补齐空缺周期时单次最多生成的空K线数
    pub const DEFAULT_MAX_GAP_FILL_BARS: u32 = 1440;

    /// 成交时间允许超前墙钟的最大毫秒数
    pub const DEFAULT_MAX_TRADE_LEAD_MS: u64 = 60_000;

    /// 默认连接超时（秒）
    pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

    /// 连接未就绪时订阅的轮询间隔（毫秒）
    pub const DEFAULT_SUBSCRIBE_POLL_INTERVAL_MS: u64 = 100;

    pub const DEFAULT_TRADE_CHANNEL_CAPACITY: usize = 10_000;
    pub const DEFAULT_COMMAND_CHANNEL_CAPACITY: usize = 128;
    pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;
}

use constants::*;

fn default_timeframe_secs() -> u32 { DEFAULT_TIMEFRAME_SECS }
fn default_tick_interval_ms() -> u64 { DEFAULT_TICK_INTERVAL_MS }
fn default_max_gap_fill_bars() -> u32 { DEFAULT_MAX_GAP_FILL_BARS }
fn default_max_trade_lead_ms() -> u64 { DEFAULT_MAX_TRADE_LEAD_MS }
fn default_connect_timeout_secs() -> u64 { DEFAULT_CONNECT_TIMEOUT_SECS }
fn default_subscribe_poll_interval_ms() -> u64 { DEFAULT_SUBSCRIBE_POLL_INTERVAL_MS }
fn default_trade_capacity() -> usize { DEFAULT_TRADE_CHANNEL_CAPACITY }
fn default_command_capacity() -> usize { DEFAULT_COMMAND_CHANNEL_CAPACITY }
fn default_event_capacity() -> usize { DEFAULT_EVENT_CHANNEL_CAPACITY }
fn default_log_level() -> String { "info".to_string() }
fn default_log_dir() -> String { "logs".to_string() }
fn default_true() -> bool { true }

/// 聚合系统配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggrConfig {
    /// 启动时的K线周期（秒）
    #[serde(default = "default_timeframe_secs")]
    pub default_timeframe_secs: u32,

    /// 时钟节拍间隔（毫秒）
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// 跨越多个周期时是否补齐空K线
    #[serde(default)]
    pub fill_gaps: bool,

    /// 单次切换最多补齐的空K线数，超出部分跳过
    #[serde(default = "default_max_gap_fill_bars")]
    pub max_gap_fill_bars: u32,

    /// 成交时间允许超前墙钟的最大毫秒数，超出视为非法成交
    #[serde(default = "default_max_trade_lead_ms")]
    pub max_trade_lead_ms: u64,

    #[serde(default)]
    pub channels: ChannelConfig,

    #[serde(default)]
    pub websocket: WebSocketConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// 按交易所标识覆盖端点，键不区分大小写
    #[serde(default)]
    pub exchanges: HashMap<String, ExchangeEndpointConfig>,
}

/// 通道容量配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_trade_capacity")]
    pub trade_capacity: usize,
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
    /// 每个事件订阅者允许积压的事件数，超出后丢弃 tick（完结K线不丢）
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            trade_capacity: DEFAULT_TRADE_CHANNEL_CAPACITY,
            command_capacity: DEFAULT_COMMAND_CHANNEL_CAPACITY,
            event_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

/// WebSocket配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// 连接尚未打开时订阅请求的轮询间隔（毫秒）
    #[serde(default = "default_subscribe_poll_interval_ms")]
    pub subscribe_poll_interval_ms: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            subscribe_poll_interval_ms: DEFAULT_SUBSCRIBE_POLL_INTERVAL_MS,
        }
    }
}

impl WebSocketConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn subscribe_poll_interval(&self) -> Duration {
        Duration::from_millis(self.subscribe_poll_interval_ms)
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别，可被 RUST_LOG 覆盖
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_true")]
    pub console_output: bool,

    #[serde(default)]
    pub file_output: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// 文件日志使用 JSON 格式
    #[serde(default)]
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            console_output: true,
            file_output: false,
            log_dir: default_log_dir(),
            json_format: false,
        }
    }
}

/// 单个交易所的端点覆盖
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeEndpointConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub ws_url: Option<String>,
    pub products_url: Option<String>,
}

impl Default for AggrConfig {
    fn default() -> Self {
        Self {
            default_timeframe_secs: DEFAULT_TIMEFRAME_SECS,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            fill_gaps: false,
            max_gap_fill_bars: DEFAULT_MAX_GAP_FILL_BARS,
            max_trade_lead_ms: DEFAULT_MAX_TRADE_LEAD_MS,
            channels: ChannelConfig::default(),
            websocket: WebSocketConfig::default(),
            logging: LoggingConfig::default(),
            exchanges: HashMap::new(),
        }
    }
}

impl AggrConfig {
    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AggrConfig = toml::from_str(content)
            .map_err(|e| AppError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 按 `CONFIG_PATH` 环境变量或默认路径加载，文件不存在时回退到默认配置
    pub fn load_or_default(path: Option<&str>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_string(),
            None => std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
        };
        if Path::new(&path).exists() {
            Self::from_file(&path)
        } else {
            eprintln!("配置文件 {} 不存在，使用默认配置", path);
            Ok(Self::default())
        }
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.default_timeframe_secs == 0 {
            return Err(AppError::ConfigError("default_timeframe_secs must be > 0".to_string()));
        }
        if self.tick_interval_ms == 0 {
            return Err(AppError::ConfigError("tick_interval_ms must be > 0".to_string()));
        }
        if self.channels.trade_capacity == 0
            || self.channels.command_capacity == 0
            || self.channels.event_capacity == 0
        {
            return Err(AppError::ConfigError("channel capacities must be > 0".to_string()));
        }
        if self.websocket.connect_timeout_secs == 0 {
            return Err(AppError::ConfigError("websocket.connect_timeout_secs must be > 0".to_string()));
        }
        if self.websocket.subscribe_poll_interval_ms == 0 {
            return Err(AppError::ConfigError("websocket.subscribe_poll_interval_ms must be > 0".to_string()));
        }
        for (id, endpoint) in &self.exchanges {
            for raw in endpoint.ws_url.iter().chain(endpoint.products_url.iter()) {
                url::Url::parse(raw).map_err(|e| {
                    AppError::ConfigError(format!("exchanges.{}: invalid url {}: {}", id, raw, e))
                })?;
            }
        }
        Ok(())
    }

    /// 查找交易所端点覆盖（大小写不敏感）
    pub fn endpoint_for(&self, exchange: &str) -> Option<&ExchangeEndpointConfig> {
        self.exchanges
            .iter()
            .find(|(id, _)| id.eq_ignore_ascii_case(exchange))
            .map(|(_, cfg)| cfg)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AggrConfig::from_toml_str("").unwrap();
        assert_eq!(config.default_timeframe_secs, 300);
        assert_eq!(config.tick_interval_ms, 1000);
        assert!(!config.fill_gaps);
        assert_eq!(config.max_gap_fill_bars, 1440);
        assert_eq!(config.max_trade_lead_ms, 60_000);
        assert_eq!(config.websocket.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.websocket.subscribe_poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_exchange_overrides() {
        let config = AggrConfig::from_toml_str(
            r#"
            default_timeframe_secs = 60
            fill_gaps = true

            [exchanges.okx]
            ws_url = "ws://127.0.0.1:9000"

            [exchanges.BYBIT]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.default_timeframe_secs, 60);
        assert!(config.fill_gaps);
        let okx = config.endpoint_for("OKX").unwrap();
        assert!(okx.enabled);
        assert_eq!(okx.ws_url.as_deref(), Some("ws://127.0.0.1:9000"));
        assert!(!config.endpoint_for("bybit").unwrap().enabled);
        assert!(config.endpoint_for("BINANCE").is_none());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(AggrConfig::from_toml_str("default_timeframe_secs = 0").is_err());
        assert!(AggrConfig::from_toml_str("[websocket]\nconnect_timeout_secs = 0").is_err());
        assert!(AggrConfig::from_toml_str("[exchanges.OKX]\nws_url = \"not a url\"").is_err());
    }
}
