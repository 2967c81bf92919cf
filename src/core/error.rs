//! 错误类型：Agent 边界错误、外部协作方错误与错误类别
//!
//! 与 RecoveryEngine 配合：外部协作方（Sheets / WhatsApp / LLM）返回 ServiceError，
//! classifier 根据 code / message 把它归入 ErrorCategory，再决定 Retry / CircuitBreak / Fallback 等。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::circuit::CircuitKey;
use crate::core::orchestrator::WorkflowError;

/// 外部协作方返回的原始失败：message + 可选 code（如 "ECONNREFUSED"、"429"）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ServiceError {
    pub message: String,
    pub code: Option<String>,
}

impl ServiceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }
}

/// Agent 运行过程中可能出现的错误（信封校验、未知动作、分发失败、熔断、外部服务等）
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// 信封结构不合法；在 Agent 边界内被转成 ERROR 响应信封
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown action '{action}' for agent {agent}")]
    UnknownAction { agent: String, action: String },

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Agent {0} failed to initialize")]
    InitializationFailed(String),

    /// 分发重试耗尽；source 为最后一次失败
    #[error("Dispatch to {agent} ({action}) failed after {attempts} attempts in {session_id}: {source}")]
    Dispatch {
        agent: String,
        action: String,
        session_id: String,
        attempts: u32,
        #[source]
        source: Box<AgentError>,
    },

    #[error("Circuit {circuit} is open until {next_attempt}")]
    CircuitOpen {
        circuit: CircuitKey,
        next_attempt: DateTime<Utc>,
    },

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Workflow(Box<WorkflowError>),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),
}

impl AgentError {
    /// 供分类器匹配的错误码：外部服务用其自带 code，校验错误固定为 VALIDATION
    pub fn code(&self) -> Option<&str> {
        match self {
            AgentError::Service(e) => e.code.as_deref(),
            AgentError::Validation(_) => Some("VALIDATION"),
            AgentError::Dispatch { source, .. } => source.code(),
            _ => None,
        }
    }
}

impl From<WorkflowError> for AgentError {
    fn from(err: WorkflowError) -> Self {
        AgentError::Workflow(Box::new(err))
    }
}

/// 错误类别（分类器输出）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Transient,
    RateLimit,
    Auth,
    Data,
    System,
    Permanent,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Transient => "TRANSIENT",
            ErrorCategory::RateLimit => "RATE_LIMIT",
            ErrorCategory::Auth => "AUTH",
            ErrorCategory::Data => "DATA",
            ErrorCategory::System => "SYSTEM",
            ErrorCategory::Permanent => "PERMANENT",
            ErrorCategory::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_code() {
        let err: AgentError = ServiceError::with_code("ECONNREFUSED", "connect failed").into();
        assert_eq!(err.code(), Some("ECONNREFUSED"));
        assert_eq!(err.to_string(), "Service error: connect failed");
    }

    #[test]
    fn test_dispatch_error_keeps_source_code() {
        let err = AgentError::Dispatch {
            agent: "fatigue-checker".to_string(),
            action: "CHECK_FATIGUE".to_string(),
            session_id: "session_1_abc".to_string(),
            attempts: 4,
            source: Box::new(ServiceError::with_code("429", "quota").into()),
        };
        assert_eq!(err.code(), Some("429"));
        assert!(err.to_string().contains("fatigue-checker"));
        assert!(err.to_string().contains("session_1_abc"));
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::RateLimit.to_string(), "RATE_LIMIT");
        assert_eq!(
            serde_json::to_string(&ErrorCategory::Permanent).unwrap(),
            "\"PERMANENT\""
        );
    }
}
