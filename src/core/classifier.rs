//! 错误分类与恢复策略选择
//!
//! 分类：按固定顺序在 code 与 message 中查找标记子串（大小写敏感），首个命中的类别胜出。
//! 策略：(类别, 已重试次数, 重试上限) 的纯函数。退避：initial * multiplier^(n-1)，封顶 max_delay，再乘 [0.5, 1.0] 抖动。

use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::config::RecoverySection;
use crate::core::{AgentError, ErrorCategory};

pub const RATE_LIMIT_MARKERS: &[&str] = &[
    "429",
    "RATE_LIMIT",
    "RESOURCE_EXHAUSTED",
    "rate limit",
    "Rate limit",
    "quota exceeded",
    "Quota exceeded",
    "Too Many Requests",
];

pub const AUTH_MARKERS: &[&str] = &[
    "401",
    "403",
    "UNAUTHENTICATED",
    "PERMISSION_DENIED",
    "invalid_grant",
    "Unauthorized",
    "Forbidden",
];

pub const TRANSIENT_MARKERS: &[&str] = &[
    "ECONNRESET",
    "ECONNREFUSED",
    "ETIMEDOUT",
    "ENOTFOUND",
    "EAI_AGAIN",
    "EPIPE",
    "socket hang up",
    "timeout",
    "Timeout",
    "502",
    "503",
    "504",
    "UNAVAILABLE",
];

pub const SYSTEM_MARKERS: &[&str] = &[
    "ENOMEM",
    "ENOSPC",
    "EMFILE",
    "out of memory",
    "disk full",
    "500",
    "INTERNAL",
];

pub const DATA_MARKERS: &[&str] = &[
    "INVALID_ARGUMENT",
    "VALIDATION",
    "Validation",
    "parse",
    "JSON",
    "malformed",
    "out of range",
];

pub const PERMANENT_MARKERS: &[&str] = &[
    "404",
    "400",
    "410",
    "NOT_FOUND",
    "NOT_IMPLEMENTED",
];

/// 匹配顺序即优先级
const CATEGORY_TABLE: &[(ErrorCategory, &[&str])] = &[
    (ErrorCategory::RateLimit, RATE_LIMIT_MARKERS),
    (ErrorCategory::Auth, AUTH_MARKERS),
    (ErrorCategory::Transient, TRANSIENT_MARKERS),
    (ErrorCategory::System, SYSTEM_MARKERS),
    (ErrorCategory::Data, DATA_MARKERS),
    (ErrorCategory::Permanent, PERMANENT_MARKERS),
];

/// 恢复策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryStrategy {
    Retry,
    CircuitBreak,
    Fallback,
    GracefulDegradation,
    Propagate,
}

/// 根据 code / message 中的标记判定类别
pub fn classify(code: Option<&str>, message: &str) -> ErrorCategory {
    for (category, markers) in CATEGORY_TABLE {
        let hit = markers.iter().any(|marker| {
            code.is_some_and(|c| c.contains(marker)) || message.contains(marker)
        });
        if hit {
            return *category;
        }
    }
    ErrorCategory::Unknown
}

/// 只对外部服务的原始失败做标记匹配；内部错误按变体直接映射（会话 ID、时间戳里的数字不参与匹配）
pub fn classify_error(err: &AgentError) -> ErrorCategory {
    match err {
        AgentError::Service(e) => classify(e.code.as_deref(), &e.message),
        AgentError::Dispatch { source, .. } => classify_error(source),
        AgentError::Workflow(w) => classify_error(&w.source),
        AgentError::Validation(_) | AgentError::InvalidArgument(_) => ErrorCategory::Data,
        AgentError::UnknownAction { .. } | AgentError::UnknownAgent(_) => ErrorCategory::Permanent,
        AgentError::CircuitOpen { .. } => ErrorCategory::Transient,
        AgentError::InitializationFailed(_) | AgentError::Cancelled | AgentError::Config(_) => {
            ErrorCategory::Unknown
        }
    }
}

pub fn determine_strategy(
    category: ErrorCategory,
    retry_count: u32,
    max_retries: u32,
) -> RecoveryStrategy {
    match category {
        ErrorCategory::Permanent | ErrorCategory::Auth | ErrorCategory::Unknown => {
            RecoveryStrategy::Propagate
        }
        ErrorCategory::System => RecoveryStrategy::GracefulDegradation,
        ErrorCategory::Data => RecoveryStrategy::Fallback,
        ErrorCategory::Transient | ErrorCategory::RateLimit => {
            if retry_count < max_retries {
                RecoveryStrategy::Retry
            } else {
                RecoveryStrategy::CircuitBreak
            }
        }
    }
}

/// 领域层重试策略（与 Orchestrator 的分发重试是两套独立计数）
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RecoverySection::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &RecoverySection) -> Self {
        Self {
            max_retries: cfg.max_retries,
            initial_delay: Duration::from_millis(cfg.initial_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            backoff_multiplier: cfg.backoff_multiplier,
        }
    }

    /// 第 retry_count 次重试（从 1 开始，0 视作 1）的未抖动延迟
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.max(1) - 1;
        let millis = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.max(1.0).powi(exponent.min(i32::MAX as u32) as i32);
        let max_millis = self.max_delay.as_millis() as f64;
        Duration::from_millis(millis.min(max_millis).max(0.0) as u64)
    }

    /// 带抖动的实际等待时间：backoff * U[0.5, 1.0]，仍不超过 max_delay
    pub fn jittered_delay(&self, retry_count: u32) -> Duration {
        let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        let millis = self.backoff_delay(retry_count).as_millis() as f64 * factor;
        Duration::from_millis(millis as u64).min(self.max_delay)
    }
}
