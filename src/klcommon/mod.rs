// 导出共享模块
pub mod api;
pub mod config;
pub mod error;
pub mod logging_setup;
pub mod models;
pub mod websocket;

// 重新导出常用类型，方便使用
pub use config::AggrConfig;
pub use error::{AppError, Result};
pub use models::{floor_to_timeframe, normalize_pair, Bar, ExchangeId, Side, Trade};
