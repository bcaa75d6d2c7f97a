// 导出模块
pub mod exchanges;
pub mod klagg;
pub mod klcommon;

// Re-export error types
pub use klcommon::error::{AppError, Result};
