//! 读写分离限流：写配额是总配额的子集
//!
//! 读只占共享桶；写先占共享桶再占写专用桶。持续读负载下写请求可能长期饿死，这是已知限制，顺序保持不变。

use std::future::Future;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::RateLimitsSection;
use crate::core::AgentError;
use crate::rate_limit::bucket::{RateLimiter, RateLimiterStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DualRateLimiterStatus {
    pub shared: RateLimiterStatus,
    pub write: RateLimiterStatus,
}

#[derive(Debug, Clone)]
pub struct DualRateLimiter {
    shared: RateLimiter,
    write: RateLimiter,
}

impl DualRateLimiter {
    pub fn new(shared: RateLimiter, write: RateLimiter) -> Self {
        Self { shared, write }
    }

    /// 默认 90 次 / 100 秒（总），30 次 / 100 秒（写）
    pub fn from_config(name: &str, cfg: &RateLimitsSection) -> Self {
        Self::new(
            RateLimiter::from_config(format!("{name}:shared"), &cfg.read),
            RateLimiter::from_config(format!("{name}:write"), &cfg.write),
        )
    }

    pub async fn acquire_read(&self) -> Result<(), AgentError> {
        self.shared.acquire().await
    }

    pub async fn acquire_read_with_cancel(&self, cancel: &CancellationToken) -> Result<(), AgentError> {
        self.shared.acquire_with_cancel(cancel).await
    }

    pub async fn acquire_write(&self) -> Result<(), AgentError> {
        self.acquire_write_with_cancel(&CancellationToken::new()).await
    }

    /// 写专用桶的等待被取消时，归还已拿到的共享令牌
    pub async fn acquire_write_with_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        self.shared.acquire_with_cancel(cancel).await?;
        if let Err(e) = self.write.acquire_with_cancel(cancel).await {
            self.shared.release();
            return Err(e);
        }
        Ok(())
    }

    pub async fn execute_read<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<AgentError>,
    {
        self.acquire_read().await?;
        f().await
    }

    pub async fn execute_write<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<AgentError>,
    {
        self.acquire_write().await?;
        f().await
    }

    /// 排队等待可被 cancel 打断；打断时 f 不会执行
    pub async fn execute_read_with_cancel<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<AgentError>,
    {
        self.acquire_read_with_cancel(cancel).await?;
        f().await
    }

    pub async fn execute_write_with_cancel<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<AgentError>,
    {
        self.acquire_write_with_cancel(cancel).await?;
        f().await
    }

    pub fn status(&self) -> DualRateLimiterStatus {
        DualRateLimiterStatus {
            shared: self.shared.status(),
            write: self.write.status(),
        }
    }

    pub fn reset(&self) {
        self.shared.reset();
        self.write.reset();
    }
}
