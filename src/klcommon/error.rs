use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection timeout: {exchange} did not open within {timeout_secs}s")]
    ConnectionTimeout { exchange: String, timeout_secs: u64 },

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid trade: {0}")]
    InvalidTrade(String),

    #[error("Unknown exchange: {0}")]
    UnknownExchange(String),

    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    #[error("Invalid timeframe: {0}s")]
    InvalidTimeframe(u32),

    #[error("Invalid bar: {0}")]
    InvalidBar(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl AppError {
    /// 获取错误类型的简洁摘要，作为日志中的 error_type 字段
    ///
    /// 返回稳定的类别字符串，便于按业务影响聚合错误
    pub fn get_error_type_summary(&self) -> &'static str {
        match self {
            // 行情连接建立失败
            AppError::ConnectionError(_) => "feed_connection_failed",
            AppError::ConnectionTimeout { .. } => "feed_connection_timeout",
            AppError::WebSocketError(_) => "feed_connection_failed",

            // 行情数据无法解析
            AppError::ParseError(_) | AppError::JsonError(_) => "feed_message_malformed",
            AppError::InvalidTrade(_) => "trade_rejected",

            // 调用方输入错误
            AppError::UnknownExchange(_) | AppError::UnknownConnection(_) => "invalid_target",
            AppError::InvalidTimeframe(_) | AppError::InvalidBar(_) => "invalid_aggregation_input",

            // 内部通信
            AppError::ChannelClosed(_) => "internal_channel_closed",

            AppError::HttpError(_) => "product_listing_failed",
            AppError::IoError(_) => "system_io_failed",
            AppError::ConfigError(_) => "configuration_invalid",
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::WebSocketError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
