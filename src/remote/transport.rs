//! 心跳传输层
//!
//! 非 2xx 与网络错误在传输层按固定间隔重试有限次数，全部失败后才作为一次周期失败交给通道。

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::protocol::{HeartbeatRequest, HeartbeatResponse};
use crate::config::ServerSection;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Server returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response body: {0}")]
    Decode(String),
}

#[async_trait]
pub trait HeartbeatTransport: Send + Sync {
    async fn send(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse, TransportError>;
}

/// 固定间隔重试：首次 + `retries` 次
pub async fn retry_fixed<T, E, F, Fut>(retries: u32, backoff: Duration, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < retries => {
                tracing::debug!(attempt = attempt + 1, error = %e, "Transport attempt failed, retrying");
                attempt += 1;
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// 基于 reqwest 的 HTTP 传输
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    retries: u32,
    backoff: Duration,
}

impl HttpTransport {
    pub fn new(
        url: impl Into<String>,
        timeout: Duration,
        retries: u32,
        backoff: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            retries,
            backoff,
        })
    }

    pub fn from_config(server: &ServerSection) -> Result<Self, TransportError> {
        Self::new(
            server.heartbeat_url.clone(),
            Duration::from_secs(server.request_timeout_secs),
            server.transport_retries,
            Duration::from_millis(server.transport_backoff_ms),
        )
    }

    async fn send_once(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse, TransportError> {
        let resp = self.client.post(&self.url).json(request).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[async_trait]
impl HeartbeatTransport for HttpTransport {
    async fn send(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse, TransportError> {
        retry_fixed(self.retries, self.backoff, |_| self.send_once(request)).await
    }
}
