//! 信封：Agent 之间传递的唯一消息格式
//!
//! 信封创建后不再修改；转发时通过 preserve_context 得到新的 context（复制后在 chain 末尾追加一条），
//! 原信封的 chain 不受影响。

use std::fmt;
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::core::AgentError;

/// 信封 payload：任意键值对，语义由具体 action 决定
pub type Payload = Map<String, Value>;

const SESSION_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SESSION_ID_SUFFIX_LEN: usize = 9;
const SUCCESS_SUFFIX: &str = "_SUCCESS";

/// 动作：已知动作为具名变体，线上格式为 SCREAMING_SNAKE 字符串
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Action {
    GenerateTopic,
    CheckFatigue,
    ValidateCompliance,
    GenerateContent,
    GenerateImage,
    RequestApproval,
    Distribute,
    RunWorkflow,
    Error,
    /// `<X>_SUCCESS`
    Success(Box<Action>),
    Other(String),
}

impl Action {
    /// 对应的成功响应动作
    pub fn success(&self) -> Action {
        Action::Success(Box::new(self.clone()))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Action::Error)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Action::Success(_))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Action::Other(name) => name.trim().is_empty(),
            Action::Success(inner) => inner.is_empty(),
            _ => false,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::GenerateTopic => f.write_str("GENERATE_TOPIC"),
            Action::CheckFatigue => f.write_str("CHECK_FATIGUE"),
            Action::ValidateCompliance => f.write_str("VALIDATE_COMPLIANCE"),
            Action::GenerateContent => f.write_str("GENERATE_CONTENT"),
            Action::GenerateImage => f.write_str("GENERATE_IMAGE"),
            Action::RequestApproval => f.write_str("REQUEST_APPROVAL"),
            Action::Distribute => f.write_str("DISTRIBUTE"),
            Action::RunWorkflow => f.write_str("RUN_WORKFLOW"),
            Action::Error => f.write_str("ERROR"),
            Action::Success(inner) => write!(f, "{}{}", inner, SUCCESS_SUFFIX),
            Action::Other(name) => f.write_str(name),
        }
    }
}

impl Action {
    /// 按线上名称解析；无法识别的名称保留为 Other
    pub fn parse(s: &str) -> Action {
        match s {
            "GENERATE_TOPIC" => Action::GenerateTopic,
            "CHECK_FATIGUE" => Action::CheckFatigue,
            "VALIDATE_COMPLIANCE" => Action::ValidateCompliance,
            "GENERATE_CONTENT" => Action::GenerateContent,
            "GENERATE_IMAGE" => Action::GenerateImage,
            "REQUEST_APPROVAL" => Action::RequestApproval,
            "DISTRIBUTE" => Action::Distribute,
            "RUN_WORKFLOW" => Action::RunWorkflow,
            "ERROR" => Action::Error,
            other => match other.strip_suffix(SUCCESS_SUFFIX) {
                Some(inner) if !inner.is_empty() => Action::Success(Box::new(Action::parse(inner))),
                _ => Action::Other(other.to_string()),
            },
        }
    }
}

impl FromStr for Action {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Action::parse(s))
    }
}

impl From<String> for Action {
    fn from(s: String) -> Self {
        Action::parse(&s)
    }
}

impl From<&str> for Action {
    fn from(s: &str) -> Self {
        Action::parse(s)
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        action.to_string()
    }
}

/// 溯源链中的一条记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainEntry {
    pub agent_id: String,
    pub action: Action,
    pub timestamp: String,
}

fn default_priority() -> i32 {
    1
}

/// 信封上下文：会话关联、因果上游、优先级与溯源链
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContext {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub parent_agent: String,
    /// 越大越先处理
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub chain: Vec<ChainEntry>,
    /// 其余上下文字段（如 advisorId），原样透传
    #[serde(flatten)]
    pub extra: Payload,
}

impl Default for MessageContext {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            parent_agent: String::new(),
            priority: default_priority(),
            chain: Vec::new(),
            extra: Payload::new(),
        }
    }
}

impl MessageContext {
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_parent(mut self, parent_agent: impl Into<String>) -> Self {
        self.parent_agent = parent_agent.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub agent_id: String,
    /// ISO-8601（RFC 3339，毫秒精度，UTC）
    pub timestamp: String,
    pub action: Action,
    #[serde(default)]
    pub payload: Payload,
    pub context: MessageContext,
    #[serde(default)]
    pub response_required: bool,
}

impl Envelope {
    pub fn session_id(&self) -> &str {
        &self.context.session_id
    }

    /// payload 中的单个字段
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// 把 payload 反序列化为具体类型；失败视为校验错误
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, AgentError> {
        serde_json::from_value(Value::Object(self.payload.clone())).map_err(|e| {
            AgentError::Validation(format!("invalid payload for {}: {}", self.action, e))
        })
    }

    /// 由 agent_id 转发：沿用会话，parentAgent 指向本信封发送方，chain 追加本信封
    pub fn forward(
        &self,
        agent_id: &str,
        action: Action,
        payload: Payload,
        response_required: bool,
    ) -> Result<Envelope, AgentError> {
        let mut extra = Payload::new();
        extra.insert("parentAgent".to_string(), json!(self.agent_id));
        let context = preserve_context(self, extra);
        create_message(agent_id, action, payload, Some(context), response_required)
    }
}

/// 当前时间的 ISO-8601 字符串
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// `session_{毫秒时间戳}_{9 位 [a-z0-9]}`；仅用于关联日志，不具备安全性
pub fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SESSION_ID_SUFFIX_LEN)
        .map(|_| SESSION_ID_ALPHABET[rng.gen_range(0..SESSION_ID_ALPHABET.len())] as char)
        .collect();
    format!("session_{}_{}", Utc::now().timestamp_millis(), suffix)
}

/// 构造信封。agent_id / action 为空时返回 InvalidArgument；缺少 sessionId 时自动生成，缺少 parentAgent 时取 agent_id
pub fn create_message(
    agent_id: &str,
    action: Action,
    payload: Payload,
    context: Option<MessageContext>,
    response_required: bool,
) -> Result<Envelope, AgentError> {
    if agent_id.trim().is_empty() {
        return Err(AgentError::InvalidArgument("agentId is required".to_string()));
    }
    if action.is_empty() {
        return Err(AgentError::InvalidArgument("action is required".to_string()));
    }

    let mut context = context.unwrap_or_default();
    if context.session_id.is_empty() {
        context.session_id = generate_session_id();
    }
    if context.parent_agent.is_empty() {
        context.parent_agent = agent_id.to_string();
    }

    Ok(Envelope {
        agent_id: agent_id.to_string(),
        timestamp: now_timestamp(),
        action,
        payload,
        context,
        response_required,
    })
}

/// 复制原信封的 context，浅合并 extra，再把原信封追加到 chain 末尾
///
/// extra 中 sessionId / parentAgent / priority 覆盖对应字段，chain 不允许被覆盖，其余键进入 context.extra。
pub fn preserve_context(original: &Envelope, extra: Payload) -> MessageContext {
    let mut context = original.context.clone();
    for (key, value) in extra {
        match key.as_str() {
            "sessionId" => {
                if let Some(s) = value.as_str() {
                    context.session_id = s.to_string();
                }
            }
            "parentAgent" => {
                if let Some(s) = value.as_str() {
                    context.parent_agent = s.to_string();
                }
            }
            "priority" => {
                if let Some(p) = value.as_i64() {
                    context.priority = p.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
                }
            }
            "chain" => {}
            _ => {
                context.extra.insert(key, value);
            }
        }
    }
    context.chain.push(ChainEntry {
        agent_id: original.agent_id.clone(),
        action: original.action.clone(),
        timestamp: original.timestamp.clone(),
    });
    context
}

fn response_context(original: &Envelope) -> MessageContext {
    let mut extra = Payload::new();
    extra.insert("parentAgent".to_string(), json!(original.agent_id));
    preserve_context(original, extra)
}

/// ERROR 响应：payload 为 { error, errorCode, originalAction }
pub fn create_error_response(responder: &str, original: &Envelope, err: &AgentError) -> Envelope {
    let mut payload = Payload::new();
    payload.insert("error".to_string(), json!(err.to_string()));
    payload.insert("errorCode".to_string(), json!(err.code()));
    payload.insert("originalAction".to_string(), json!(original.action.to_string()));

    Envelope {
        agent_id: responder.to_string(),
        timestamp: now_timestamp(),
        action: Action::Error,
        payload,
        context: response_context(original),
        response_required: false,
    }
}

/// `<action>_SUCCESS` 响应，payload 为 data
pub fn create_success_response(responder: &str, original: &Envelope, data: Payload) -> Envelope {
    Envelope {
        agent_id: responder.to_string(),
        timestamp: now_timestamp(),
        action: original.action.success(),
        payload: data,
        context: response_context(original),
        response_required: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        create_message("a", Action::Other("X".to_string()), Payload::new(), None, false).unwrap()
    }

    #[test]
    fn test_action_wire_names() {
        assert_eq!(Action::GenerateTopic.to_string(), "GENERATE_TOPIC");
        assert_eq!(Action::CheckFatigue.success().to_string(), "CHECK_FATIGUE_SUCCESS");
        assert_eq!(
            Action::from("VALIDATE_COMPLIANCE_SUCCESS"),
            Action::Success(Box::new(Action::ValidateCompliance))
        );
        assert_eq!(Action::from("PING"), Action::Other("PING".to_string()));
        assert_eq!(Action::from("_SUCCESS"), Action::Other("_SUCCESS".to_string()));
        assert_eq!(serde_json::to_value(Action::RunWorkflow).unwrap(), json!("RUN_WORKFLOW"));
    }

    #[test]
    fn test_create_message_defaults() {
        let env = sample();
        assert!(env.context.session_id.starts_with("session_"));
        assert_eq!(env.context.parent_agent, "a");
        assert_eq!(env.context.priority, 1);
        assert!(env.context.chain.is_empty());
        assert!(!env.response_required);
        assert!(chrono::DateTime::parse_from_rfc3339(&env.timestamp).is_ok());
    }

    #[test]
    fn test_create_message_rejects_empty_fields() {
        assert!(matches!(
            create_message("", Action::GenerateTopic, Payload::new(), None, false),
            Err(AgentError::InvalidArgument(_))
        ));
        assert!(matches!(
            create_message("a", Action::Other(String::new()), Payload::new(), None, false),
            Err(AgentError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_session_id_format() {
        let id = generate_session_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "session");
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[2].len(), 9);
        assert!(parts[2].chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_preserve_context_appends_without_aliasing() {
        let env = sample();
        let mut extra = Payload::new();
        extra.insert("advisorId".to_string(), json!("adv-1"));
        extra.insert("chain".to_string(), json!([]));
        extra.insert("priority".to_string(), json!(5));

        let first = preserve_context(&env, extra);
        assert_eq!(first.chain.len(), env.context.chain.len() + 1);
        assert!(env.context.chain.is_empty());
        assert_eq!(first.chain[0].agent_id, "a");
        assert_eq!(first.priority, 5);
        assert_eq!(first.extra.get("advisorId"), Some(&json!("adv-1")));
        assert_eq!(first.session_id, env.context.session_id);

        let forwarded = env.forward("b", Action::CheckFatigue, Payload::new(), true).unwrap();
        let second = preserve_context(&forwarded, Payload::new());
        assert_eq!(second.chain.len(), 2);
        assert_eq!(forwarded.context.chain.len(), 1);
        assert_eq!(second.chain[1].agent_id, "b");
        assert_eq!(forwarded.context.parent_agent, "a");
    }

    #[test]
    fn test_error_and_success_responses() {
        let env = create_message("orchestrator", Action::CheckFatigue, Payload::new(), None, true)
            .unwrap();

        let err = AgentError::Validation("missing topic".to_string());
        let error = create_error_response("fatigue-checker", &env, &err);
        assert_eq!(error.action, Action::Error);
        assert_eq!(error.payload["errorCode"], json!("VALIDATION"));
        assert_eq!(error.payload["originalAction"], json!("CHECK_FATIGUE"));
        assert_eq!(error.context.parent_agent, "orchestrator");
        assert_eq!(error.context.chain.len(), 1);

        let mut data = Payload::new();
        data.insert("fatigued".to_string(), json!(false));
        let ok = create_success_response("fatigue-checker", &env, data);
        assert_eq!(ok.action.to_string(), "CHECK_FATIGUE_SUCCESS");
        assert_eq!(ok.session_id(), env.session_id());
    }

    #[test]
    fn test_json_shape_is_camel_case() {
        let mut ctx = MessageContext::default().with_session("s1");
        ctx.extra.insert("advisorId".to_string(), json!("adv"));
        let env = create_message("a", Action::GenerateTopic, Payload::new(), Some(ctx), false).unwrap();
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["agentId"], json!("a"));
        assert_eq!(value["context"]["sessionId"], json!("s1"));
        assert_eq!(value["context"]["advisorId"], json!("adv"));
        assert_eq!(value["responseRequired"], json!(false));

        let back: Envelope = serde_json::from_value(value).unwrap();
        assert_eq!(back, env);
    }
}
