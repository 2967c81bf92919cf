//! 信封结构校验
//!
//! 只检查结构：必需字段存在、字段的基本类型正确、context 带 sessionId / parentAgent、timestamp 可解析。
//! 不检查 payload 语义（由各 action 的处理器负责）。校验失败以 Validation 返回，不 panic、不抛出。

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Serialize;
use serde_json::Value;

use crate::core::AgentError;
use crate::protocol::envelope::Envelope;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Validation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Validation {
    pub fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
        }
    }

    /// 无效时转成 AgentError::Validation
    pub fn into_result(self) -> Result<(), AgentError> {
        if self.valid {
            Ok(())
        } else {
            Err(AgentError::Validation(
                self.error.unwrap_or_else(|| "invalid message".to_string()),
            ))
        }
    }
}

/// RFC 3339，或不带时区的 ISO 8601 日期时间 / 日期
fn timestamp_is_valid(ts: &str) -> bool {
    DateTime::parse_from_rfc3339(ts).is_ok()
        || NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S%.f").is_ok()
        || NaiveDate::parse_from_str(ts, "%Y-%m-%d").is_ok()
}

/// 校验已类型化的信封（类型本身保证了基本类型，这里检查非空与时间戳）
pub fn validate_message(envelope: &Envelope) -> Validation {
    if envelope.agent_id.trim().is_empty() {
        return Validation::invalid("Missing required field: agentId");
    }
    if envelope.action.is_empty() {
        return Validation::invalid("Missing required field: action");
    }
    if envelope.context.session_id.is_empty() {
        return Validation::invalid("Missing required context field: sessionId");
    }
    if envelope.context.parent_agent.is_empty() {
        return Validation::invalid("Missing required context field: parentAgent");
    }
    if !timestamp_is_valid(&envelope.timestamp) {
        return Validation::invalid(format!("Invalid timestamp: {}", envelope.timestamp));
    }
    Validation::ok()
}

fn require_string<'a>(obj: &'a serde_json::Map<String, Value>, key: &str, scope: &str) -> Result<&'a str, String> {
    match obj.get(key) {
        None | Some(Value::Null) => Err(format!("Missing required {scope}field: {key}")),
        Some(Value::String(s)) if s.trim().is_empty() => {
            Err(format!("Missing required {scope}field: {key}"))
        }
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(format!("Field {key} must be a string")),
    }
}

fn check_value(value: &Value) -> Result<(), String> {
    let obj = value.as_object().ok_or("Message must be an object")?;

    require_string(obj, "agentId", "")?;
    require_string(obj, "action", "")?;
    let timestamp = require_string(obj, "timestamp", "")?;
    if !timestamp_is_valid(timestamp) {
        return Err(format!("Invalid timestamp: {timestamp}"));
    }

    match obj.get("payload") {
        Some(Value::Object(_)) => {}
        None => return Err("Missing required field: payload".to_string()),
        Some(_) => return Err("Field payload must be an object".to_string()),
    }

    let context = match obj.get("context") {
        Some(Value::Object(ctx)) => ctx,
        None => return Err("Missing required field: context".to_string()),
        Some(_) => return Err("Field context must be an object".to_string()),
    };
    require_string(context, "sessionId", "context ")?;
    require_string(context, "parentAgent", "context ")?;
    if let Some(priority) = context.get("priority") {
        if !priority.is_i64() {
            return Err("Field context.priority must be an integer".to_string());
        }
    }
    if let Some(chain) = context.get("chain") {
        if !chain.is_array() {
            return Err("Field context.chain must be an array".to_string());
        }
    }

    if let Some(flag) = obj.get("responseRequired") {
        if !flag.is_boolean() {
            return Err("Field responseRequired must be a boolean".to_string());
        }
    }
    Ok(())
}

/// 校验来自集成边界的原始 JSON 信封
pub fn validate_value(value: &Value) -> Validation {
    match check_value(value) {
        Ok(()) => Validation::ok(),
        Err(error) => Validation::invalid(error),
    }
}

/// 校验并解析原始 JSON 信封
pub fn parse_envelope(value: Value) -> Result<Envelope, AgentError> {
    validate_value(&value).into_result()?;
    serde_json::from_value(value).map_err(|e| AgentError::Validation(e.to_string()))
}
