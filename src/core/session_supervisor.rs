//! 会话监管：一次编排运行的取消令牌
//!
//! 分发循环、退避等待、限流排队都挂在同一个 CancellationToken 上；调用 cancel 后它们尽快以 Cancelled 返回。

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::AgentError;

#[derive(Debug, Clone)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 子 token（交给单个子 Agent），取消会话时一并取消
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// 可取消的等待
    pub async fn sleep(&self, duration: Duration) -> Result<(), AgentError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancel_token.cancelled() => Err(AgentError::Cancelled),
        }
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
