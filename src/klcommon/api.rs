//! 交易所 REST 接口访问

use crate::klcommon::{AppError, Result};
use std::time::Duration;
use tracing::{debug, instrument};

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// 创建共享的 HTTP 客户端
pub fn build_http_client() -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(concat!("aggr_kline/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

/// GET 请求并解析 JSON 响应体
#[instrument(target = "交易所适配器", skip(client), err)]
pub async fn get_json(client: &reqwest::Client, url: &str) -> Result<serde_json::Value> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AppError::ConnectionError(format!(
            "GET {} 返回状态 {}: {}",
            url,
            status,
            body.chars().take(200).collect::<String>()
        )));
    }
    let value = response.json::<serde_json::Value>().await?;
    debug!(target: "交易所适配器", %url, "REST 响应已解析");
    Ok(value)
}
