//! Agent 编排器
//!
//! 负责：按名称实例化子 Agent 并分发信封（传输层失败时按 retry_delay * 2^attempt 纯指数退避重试），
//! 维护会话状态，依次执行 选题 → 疲劳度 → 合规 三步并汇总结果。
//! 分发重试是传输层重试，与 Agent 内部 RecoveryEngine 的领域重试各自计数。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::agents::{
    AgentKind, ComplianceReport, FatigueReport, SubAgent, Topic, TopicList,
};
use crate::config::{AppConfig, OrchestratorSection};
use crate::core::state::{AgentSessionState, AgentState};
use crate::core::{classify_error, AgentError, ErrorCategory, SessionSupervisor};
use crate::protocol::{
    create_error_response, create_message, create_success_response, generate_session_id,
    validate_message, Action, Envelope, MessageContext, MessageQueue, Payload,
};

/// 子 Agent 工厂：每次分发新建一个实例，参数为本次分发的取消 token
pub type AgentFactory = Arc<dyn Fn(CancellationToken) -> Box<dyn SubAgent> + Send + Sync>;

/// 子 Agent 注册表：名称 → 工厂
#[derive(Clone, Default)]
pub struct AgentRegistry {
    factories: HashMap<String, AgentFactory>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(CancellationToken) -> Box<dyn SubAgent> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn instantiate(&self, name: &str, cancel: CancellationToken) -> Option<Box<dyn SubAgent>> {
        self.factories.get(name).map(|factory| factory(cancel))
    }
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.names())
            .finish()
    }
}

/// 分发重试策略：最多 max_retries 次重试，第 attempt 次失败后等待 retry_delay * 2^attempt（无抖动）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self::from_config(&OrchestratorSection::default())
    }
}

impl DispatchPolicy {
    pub fn from_config(cfg: &OrchestratorSection) -> Self {
        Self {
            max_retries: cfg.max_retries,
            retry_delay: Duration::from_millis(cfg.retry_delay_ms),
        }
    }

    /// attempt 从 0 开始
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.retry_delay.saturating_mul(factor)
    }
}

/// RUN_WORKFLOW 的 payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub advisor_id: String,
    #[serde(default)]
    pub topic_count: Option<usize>,
}

impl WorkflowRequest {
    pub fn new(advisor_id: impl Into<String>) -> Self {
        Self {
            advisor_id: advisor_id.into(),
            topic_count: None,
        }
    }

    pub fn with_topic_count(mut self, count: usize) -> Self {
        self.topic_count = Some(count);
        self
    }
}

/// 工作流中的一次分发记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowStep {
    pub agent: String,
    pub action: Action,
    pub response_action: Action,
    pub payload: Payload,
}

/// 一次工作流的汇总结果；失败时作为部分结果随 WorkflowError 返回
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkflowResult {
    pub session_id: String,
    pub advisor_id: String,
    pub success: bool,
    pub topics: Vec<Topic>,
    pub fatigue_checks: Vec<FatigueReport>,
    pub selected_topic: Option<Topic>,
    pub compliance: Option<ComplianceReport>,
    pub steps: Vec<WorkflowStep>,
    /// 提前结束的原因（无效响应、全部疲劳、未通过合规）
    pub failure: Option<String>,
}

/// 分发重试耗尽等终止性错误，带会话、失败步骤与已得到的部分结果
#[derive(Error, Debug, Clone)]
#[error("Workflow {session_id} failed at {agent} ({action}): {source}")]
pub struct WorkflowError {
    pub session_id: String,
    pub agent: String,
    pub action: Action,
    #[source]
    pub source: AgentError,
    pub partial: WorkflowResult,
}

pub struct Orchestrator {
    id: String,
    registry: AgentRegistry,
    policy: DispatchPolicy,
    session: AgentSessionState,
    supervisor: SessionSupervisor,
    inbox: MessageQueue,
}

impl Orchestrator {
    pub fn new(registry: AgentRegistry, policy: DispatchPolicy) -> Self {
        Self {
            id: AgentKind::Orchestrator.as_str().to_string(),
            registry,
            policy,
            session: AgentSessionState::new(generate_session_id()),
            supervisor: SessionSupervisor::new(),
            inbox: MessageQueue::new(),
        }
    }

    pub fn from_config(cfg: &AppConfig, registry: AgentRegistry) -> Self {
        Self::new(registry, DispatchPolicy::from_config(&cfg.orchestrator))
    }

    pub fn with_supervisor(mut self, supervisor: SessionSupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session(&self) -> &AgentSessionState {
        &self.session
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    /// 取消当前会话：分发中的子 Agent、退避等待与领域重试尽快以 Cancelled 返回
    pub fn cancel(&self) {
        self.supervisor.cancel();
    }

    /// 按名称分发；传输层失败重试 max_retries 次，确定性失败不重试。
    /// 两种情况都以 Dispatch 返回（source 为最后一次错误，attempts 为实际尝试次数）
    pub async fn dispatch(&mut self, agent_name: &str, envelope: Envelope) -> Result<Envelope, AgentError> {
        self.session.transition(AgentState::Processing);
        let max_attempts = self.policy.max_retries.saturating_add(1);
        let mut attempts = 0;
        let mut last_error = AgentError::UnknownAgent(agent_name.to_string());

        for attempt in 0..max_attempts {
            if self.supervisor.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            attempts = attempt + 1;
            self.session.transition(AgentState::Waiting);
            let result = self.try_dispatch(agent_name, envelope.clone()).await;
            self.session.transition(AgentState::Processing);

            match result {
                Ok(response) => {
                    tracing::info!(
                        agent = agent_name,
                        action = %envelope.action,
                        session_id = %self.session.session_id,
                        attempt,
                        response = %response.action,
                        "dispatch completed"
                    );
                    return Ok(response);
                }
                Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                Err(e) => {
                    let retryable = is_dispatch_retryable(&e);
                    tracing::warn!(
                        agent = agent_name,
                        action = %envelope.action,
                        session_id = %self.session.session_id,
                        attempt,
                        retryable,
                        error = %e,
                        "dispatch failed"
                    );
                    last_error = e;
                    if !retryable {
                        break;
                    }
                }
            }

            if attempt + 1 < max_attempts {
                let delay = self.policy.delay_for(attempt);
                self.session.retry_count += 1;
                self.session.transition(AgentState::Retry);
                tracing::debug!(
                    agent = agent_name,
                    delay_ms = delay.as_millis() as u64,
                    "waiting before dispatch retry"
                );
                self.supervisor.sleep(delay).await?;
                self.session.transition(AgentState::Processing);
            }
        }

        tracing::error!(
            agent = agent_name,
            action = %envelope.action,
            session_id = %self.session.session_id,
            attempts,
            error = %last_error,
            "dispatch failed permanently"
        );
        Err(AgentError::Dispatch {
            agent: agent_name.to_string(),
            action: envelope.action.to_string(),
            session_id: self.session.session_id.clone(),
            attempts,
            source: Box::new(last_error),
        })
    }

    /// 单次分发；会话取消时立即以 Cancelled 返回（丢弃子 Agent 未完成的调用）
    async fn try_dispatch(&self, agent_name: &str, envelope: Envelope) -> Result<Envelope, AgentError> {
        let cancel = self.supervisor.cancel_token();
        let mut agent = self
            .registry
            .instantiate(agent_name, cancel.child_token())
            .ok_or_else(|| AgentError::UnknownAgent(agent_name.to_string()))?;
        tokio::select! {
            result = async {
                if !agent.initialize().await {
                    return Err(AgentError::InitializationFailed(agent_name.to_string()));
                }
                agent.process_message(envelope).await
            } => result,
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
        }
    }

    /// 本编排器发出的请求：有上一条响应时沿用其 context 并追加 chain，否则新建
    fn request(
        &self,
        previous: Option<&Envelope>,
        action: Action,
        payload: Payload,
    ) -> Result<Envelope, AgentError> {
        match previous {
            Some(prev) => prev.forward(&self.id, action, payload, true),
            None => {
                let context = MessageContext::default()
                    .with_session(self.session.session_id.clone())
                    .with_parent(self.id.clone());
                create_message(&self.id, action, payload, Some(context), true)
            }
        }
    }

    /// 一步分发：终止性错误返回 Err；ERROR 响应或无数据的降级响应返回 Ok(None) 并记录原因
    async fn step(
        &mut self,
        result: &mut WorkflowResult,
        previous: &mut Option<Envelope>,
        agent: AgentKind,
        action: Action,
        payload: Payload,
    ) -> Result<Option<Payload>, WorkflowError> {
        let request = match self.request(previous.as_ref(), action.clone(), payload) {
            Ok(request) => request,
            Err(e) => return Err(self.fail(result, agent, action, e)),
        };
        let response = match self.dispatch(agent.as_str(), request).await {
            Ok(response) => response,
            Err(e) => return Err(self.fail(result, agent, action, e)),
        };

        result.steps.push(WorkflowStep {
            agent: agent.as_str().to_string(),
            action: action.clone(),
            response_action: response.action.clone(),
            payload: response.payload.clone(),
        });

        let data = if response.action.is_error() {
            let reason = response
                .field("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            result.failure = Some(format!("{agent} rejected {action}: {reason}"));
            None
        } else if validate_message(&response).valid {
            recovered_data(&response.payload, agent, result)
        } else {
            result.failure = Some(format!("{agent} returned a malformed response"));
            None
        };
        *previous = Some(response);
        Ok(data)
    }

    fn fail(
        &mut self,
        result: &WorkflowResult,
        agent: AgentKind,
        action: Action,
        source: AgentError,
    ) -> WorkflowError {
        self.session.transition(AgentState::Error);
        tracing::error!(
            session_id = %self.session.session_id,
            agent = %agent,
            action = %action,
            error = %source,
            "workflow aborted"
        );
        WorkflowError {
            session_id: self.session.session_id.clone(),
            agent: agent.as_str().to_string(),
            action,
            source,
            partial: result.clone(),
        }
    }

    fn finish(&mut self, mut result: WorkflowResult) -> WorkflowResult {
        result.success = result.failure.is_none();
        let next = if result.success {
            AgentState::Completed
        } else {
            AgentState::Error
        };
        self.session.transition(next);
        tracing::info!(
            session_id = %result.session_id,
            advisor_id = %result.advisor_id,
            success = result.success,
            failure = result.failure.as_deref().unwrap_or(""),
            "workflow finished"
        );
        result
    }

    /// 选题 → 逐个检查疲劳度直到找到未疲劳的选题 → 合规校验；严格顺序执行
    pub async fn run_workflow(&mut self, request: WorkflowRequest) -> Result<WorkflowResult, WorkflowError> {
        self.session.transition(AgentState::Processing);
        self.session.retry_count = 0;
        let mut result = WorkflowResult {
            session_id: self.session.session_id.clone(),
            advisor_id: request.advisor_id.clone(),
            ..WorkflowResult::default()
        };
        tracing::info!(
            session_id = %result.session_id,
            advisor_id = %request.advisor_id,
            "workflow started"
        );

        let mut previous: Option<Envelope> = None;

        let mut payload = Payload::new();
        payload.insert("advisor_id".to_string(), json!(request.advisor_id));
        if let Some(count) = request.topic_count {
            payload.insert("topic_count".to_string(), json!(count));
        }
        let Some(data) = self
            .step(&mut result, &mut previous, AgentKind::ContentStrategist, Action::GenerateTopic, payload)
            .await?
        else {
            return Ok(self.finish(result));
        };
        let topics = match parse_payload::<TopicList>(data) {
            Ok(list) if !list.topics.is_empty() => list.topics,
            Ok(_) => {
                result.failure = Some("no topics generated".to_string());
                return Ok(self.finish(result));
            }
            Err(reason) => {
                result.failure = Some(format!("invalid topic list: {reason}"));
                return Ok(self.finish(result));
            }
        };
        result.topics = topics.clone();

        for topic in topics {
            let mut payload = Payload::new();
            payload.insert("advisor_id".to_string(), json!(request.advisor_id));
            payload.insert("topic".to_string(), json!(topic));
            let Some(data) = self
                .step(&mut result, &mut previous, AgentKind::FatigueChecker, Action::CheckFatigue, payload)
                .await?
            else {
                return Ok(self.finish(result));
            };
            let report = match parse_payload::<FatigueReport>(data) {
                Ok(report) => report,
                Err(reason) => {
                    result.failure = Some(format!("invalid fatigue report: {reason}"));
                    return Ok(self.finish(result));
                }
            };
            let fatigued = report.fatigued;
            result.fatigue_checks.push(report);
            if !fatigued {
                result.selected_topic = Some(topic);
                break;
            }
        }

        let Some(topic) = result.selected_topic.clone() else {
            result.failure = Some("all candidate topics are fatigued".to_string());
            return Ok(self.finish(result));
        };

        let mut payload = Payload::new();
        payload.insert("advisor_id".to_string(), json!(request.advisor_id));
        payload.insert("topic".to_string(), json!(topic));
        let Some(data) = self
            .step(&mut result, &mut previous, AgentKind::ComplianceValidator, Action::ValidateCompliance, payload)
            .await?
        else {
            return Ok(self.finish(result));
        };
        match parse_payload::<ComplianceReport>(data) {
            Ok(report) => {
                if !report.compliant {
                    result.failure = Some(format!(
                        "topic {} failed compliance (score {})",
                        topic.id, report.score
                    ));
                }
                result.compliance = Some(report);
            }
            Err(reason) => {
                result.failure = Some(format!("invalid compliance report: {reason}"));
            }
        }

        Ok(self.finish(result))
    }

    /// 放入收件箱，按 context.priority 排序
    pub fn enqueue(&mut self, envelope: Envelope) {
        self.inbox.push(envelope);
    }

    pub fn pending(&self) -> usize {
        self.inbox.len()
    }

    /// 处理收件箱中优先级最高的一条
    pub async fn process_next(&mut self) -> Option<Result<Envelope, AgentError>> {
        let envelope = self.inbox.pop()?;
        Some(self.process_message(envelope).await)
    }
}

/// 传输层失败（Agent 不可达、初始化失败、熔断打开、瞬时或限流类服务错误）才重发；
/// 校验、未知 action、权限、不存在等确定性失败重发也不会变
fn is_dispatch_retryable(err: &AgentError) -> bool {
    match err {
        AgentError::UnknownAgent(_)
        | AgentError::InitializationFailed(_)
        | AgentError::CircuitOpen { .. } => true,
        AgentError::Cancelled => false,
        other => matches!(
            classify_error(other),
            ErrorCategory::Transient | ErrorCategory::RateLimit
        ),
    }
}

/// 恢复后的响应（fallback / degraded）把数据放在 data 里；降级且无数据视为服务不可用
fn recovered_data(payload: &Payload, agent: AgentKind, result: &mut WorkflowResult) -> Option<Payload> {
    let recovered = ["fallback", "degraded"]
        .iter()
        .any(|flag| payload.get(*flag).and_then(Value::as_bool).unwrap_or(false));
    if !recovered {
        return Some(payload.clone());
    }
    match payload.get("data") {
        Some(Value::Object(data)) => Some(data.clone()),
        _ => {
            result.failure = Some(format!("{agent} is unavailable"));
            None
        }
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(payload: Payload) -> Result<T, String> {
    serde_json::from_value(Value::Object(payload)).map_err(|e| e.to_string())
}

#[async_trait]
impl SubAgent for Orchestrator {
    fn agent_id(&self) -> &str {
        &self.id
    }

    async fn initialize(&mut self) -> bool {
        self.session.transition(AgentState::Processing);
        if self.registry.is_empty() {
            tracing::error!(session_id = %self.session.session_id, "no sub-agents registered");
            self.session.transition(AgentState::Error);
            return false;
        }
        self.session.transition(AgentState::Idle);
        true
    }

    async fn process_message(&mut self, envelope: Envelope) -> Result<Envelope, AgentError> {
        if let Err(err) = validate_message(&envelope).into_result() {
            tracing::warn!(agent = %self.id, error = %err, "rejected malformed envelope");
            return Ok(create_error_response(&self.id, &envelope, &err));
        }
        match &envelope.action {
            Action::RunWorkflow => {
                let request: WorkflowRequest = match envelope.payload_as() {
                    Ok(request) => request,
                    Err(err) => return Ok(create_error_response(&self.id, &envelope, &err)),
                };
                let result = self.run_workflow(request).await?;
                let payload = match serde_json::to_value(&result) {
                    Ok(Value::Object(map)) => map,
                    _ => Payload::new(),
                };
                Ok(create_success_response(&self.id, &envelope, payload))
            }
            other => Err(AgentError::UnknownAction {
                agent: self.id.clone(),
                action: other.to_string(),
            }),
        }
    }

    fn state(&self) -> AgentState {
        self.session.state
    }

    fn reset(&mut self) {
        self.session.reset();
        self.inbox.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    use super::*;
    use crate::agents::mock::{FixedComplianceScorer, FixedFatigueScorer, StaticTopicSource};
    use crate::agents::{standard_registry, Collaborators, TopicSource};
    use crate::core::{RecoveryEngine, ServiceError};

    fn fast_policy() -> DispatchPolicy {
        DispatchPolicy {
            max_retries: 3,
            retry_delay: Duration::from_millis(5),
        }
    }

    fn registry(fatigue: FixedFatigueScorer, compliance: FixedComplianceScorer) -> AgentRegistry {
        standard_registry(
            &AppConfig::default(),
            Arc::new(RecoveryEngine::default()),
            Collaborators {
                topics: Arc::new(StaticTopicSource::sample()),
                fatigue: Arc::new(fatigue),
                compliance: Arc::new(compliance),
            },
        )
    }

    fn envelope(action: Action) -> Envelope {
        create_message("orchestrator", action, Payload::new(), None, true).unwrap()
    }

    #[test]
    fn test_delay_for_is_plain_exponential() {
        let policy = DispatchPolicy {
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(8000));
        assert!(policy.delay_for(40) >= policy.delay_for(31));
    }

    #[tokio::test]
    async fn test_workflow_selects_first_fresh_topic() {
        let fatigue = FixedFatigueScorer::uniform(20).with_score("sip-basics", 90);
        let mut orchestrator = Orchestrator::new(
            registry(fatigue, FixedComplianceScorer::new(92, vec![])),
            fast_policy(),
        );
        let result = orchestrator
            .run_workflow(WorkflowRequest::new("adv-1").with_topic_count(3))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.topics.len(), 3);
        assert_eq!(result.fatigue_checks.len(), 2);
        assert!(result.fatigue_checks[0].fatigued);
        assert_eq!(result.selected_topic.as_ref().map(|t| t.id.as_str()), Some("term-insurance"));
        assert_eq!(result.compliance.as_ref().map(|c| c.score), Some(92));
        assert_eq!(result.steps.len(), 4);
        assert_eq!(result.session_id, orchestrator.session().session_id);
        assert_eq!(orchestrator.state(), AgentState::Completed);
    }

    #[tokio::test]
    async fn test_workflow_reports_non_compliance() {
        let mut orchestrator = Orchestrator::new(
            registry(
                FixedFatigueScorer::uniform(10),
                FixedComplianceScorer::new(40, vec!["no risk disclaimer".to_string()]),
            ),
            fast_policy(),
        );
        let result = orchestrator.run_workflow(WorkflowRequest::new("adv-1")).await.unwrap();
        assert!(!result.success);
        assert!(result.failure.unwrap().contains("failed compliance"));
        assert_eq!(result.compliance.unwrap().violations, vec!["no risk disclaimer"]);
    }

    #[tokio::test]
    async fn test_workflow_all_fatigued() {
        let mut orchestrator = Orchestrator::new(
            registry(FixedFatigueScorer::uniform(99), FixedComplianceScorer::new(100, vec![])),
            fast_policy(),
        );
        let result = orchestrator
            .run_workflow(WorkflowRequest::new("adv-1").with_topic_count(2))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.fatigue_checks.len(), 2);
        assert!(result.compliance.is_none());
        assert_eq!(orchestrator.state(), AgentState::Error);
    }

    /// 第一次成功，之后一直报系统级故障
    struct OverloadedTopics {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TopicSource for OverloadedTopics {
        async fn generate_topics(&self, _advisor_id: &str, _count: usize) -> Result<Vec<Topic>, AgentError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(vec![Topic::new("cached", "Cached topic")])
            } else {
                Err(ServiceError::with_code("INTERNAL", "model overloaded").into())
            }
        }
    }

    #[tokio::test]
    async fn test_topic_cache_survives_between_workflows() {
        let registry = standard_registry(
            &AppConfig::default(),
            Arc::new(RecoveryEngine::default()),
            Collaborators {
                topics: Arc::new(OverloadedTopics { calls: AtomicU32::new(0) }),
                fatigue: Arc::new(FixedFatigueScorer::uniform(10)),
                compliance: Arc::new(FixedComplianceScorer::new(90, vec![])),
            },
        );
        let mut orchestrator = Orchestrator::new(registry, fast_policy());

        let first = orchestrator.run_workflow(WorkflowRequest::new("adv-1")).await.unwrap();
        assert!(first.success);
        assert_eq!(first.topics[0].id, "cached");

        let second = orchestrator.run_workflow(WorkflowRequest::new("adv-1")).await.unwrap();
        assert!(second.success, "{:?}", second.failure);
        assert_eq!(second.topics[0].id, "cached");
        assert_eq!(second.steps[0].payload["degraded"], json!(true));
        assert_eq!(second.steps[0].payload["serviceUnavailable"], json!(false));
    }

    #[tokio::test]
    async fn test_invalid_request_short_circuits() {
        let mut orchestrator = Orchestrator::new(
            registry(FixedFatigueScorer::uniform(10), FixedComplianceScorer::new(100, vec![])),
            fast_policy(),
        );
        let result = orchestrator.run_workflow(WorkflowRequest::new("  ")).await;
        // 空 advisor_id 在策划 Agent 里是校验错误（DATA → FALLBACK，无备用数据则原样上抛），不重发
        let err = result.unwrap_err();
        assert_eq!(err.agent, "content-strategist");
        assert!(err.partial.topics.is_empty());
        assert!(matches!(err.source, AgentError::Dispatch { attempts: 1, .. }));
        assert_eq!(orchestrator.session().retry_count, 0);
    }

    #[test]
    fn test_only_transport_failures_are_retried() {
        assert!(is_dispatch_retryable(&AgentError::UnknownAgent("x".to_string())));
        assert!(is_dispatch_retryable(&AgentError::InitializationFailed("x".to_string())));
        assert!(is_dispatch_retryable(
            &ServiceError::with_code("ECONNRESET", "socket hang up").into()
        ));
        assert!(is_dispatch_retryable(
            &ServiceError::with_code("429", "Too Many Requests").into()
        ));
        assert!(!is_dispatch_retryable(
            &ServiceError::with_code("403", "The caller does not have permission").into()
        ));
        assert!(!is_dispatch_retryable(
            &ServiceError::with_code("404", "spreadsheet not found").into()
        ));
        assert!(!is_dispatch_retryable(&AgentError::Validation("bad".to_string())));
        assert!(!is_dispatch_retryable(&AgentError::UnknownAction {
            agent: "x".to_string(),
            action: "Y".to_string(),
        }));
        assert!(!is_dispatch_retryable(&AgentError::Cancelled));
    }

    #[tokio::test]
    async fn test_missing_agent_exhausts_retries() {
        let mut orchestrator = Orchestrator::new(AgentRegistry::new(), fast_policy());
        let started = Instant::now();
        let err = orchestrator
            .dispatch("missing-agent", envelope(Action::GenerateTopic))
            .await
            .unwrap_err();
        // 5 + 10 + 20 ms
        assert!(started.elapsed() >= Duration::from_millis(35));
        match err {
            AgentError::Dispatch { agent, attempts, source, .. } => {
                assert_eq!(agent, "missing-agent");
                assert_eq!(attempts, 4);
                assert!(matches!(*source, AgentError::UnknownAgent(_)));
            }
            other => panic!("Expected Dispatch, got {other:?}"),
        }
        assert_eq!(orchestrator.session().retry_count, 3);
    }

    #[tokio::test]
    async fn test_dispatch_recovers_after_flaky_initialization() {
        struct Stubborn {
            ready: bool,
        }

        #[async_trait]
        impl SubAgent for Stubborn {
            fn agent_id(&self) -> &str {
                "stubborn"
            }
            async fn initialize(&mut self) -> bool {
                self.ready
            }
            async fn process_message(&mut self, envelope: Envelope) -> Result<Envelope, AgentError> {
                Ok(create_success_response("stubborn", &envelope, Payload::new()))
            }
            fn state(&self) -> AgentState {
                AgentState::Idle
            }
            fn reset(&mut self) {}
        }

        let created = Arc::new(AtomicU32::new(0));
        let mut registry = AgentRegistry::new();
        {
            let created = Arc::clone(&created);
            registry.register("stubborn", move |_cancel| -> Box<dyn SubAgent> {
                let n = created.fetch_add(1, Ordering::SeqCst);
                Box::new(Stubborn { ready: n >= 2 })
            });
        }
        let mut orchestrator = Orchestrator::new(registry, fast_policy());
        let response = orchestrator
            .dispatch("stubborn", envelope(Action::GenerateImage))
            .await
            .unwrap();
        assert_eq!(response.action.to_string(), "GENERATE_IMAGE_SUCCESS");
        assert_eq!(created.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancel_stops_dispatch_backoff() {
        let mut orchestrator = Orchestrator::new(
            AgentRegistry::new(),
            DispatchPolicy {
                max_retries: 3,
                retry_delay: Duration::from_secs(30),
            },
        );
        let supervisor = orchestrator.supervisor().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            supervisor.cancel();
        });
        let result = orchestrator.dispatch("missing-agent", envelope(Action::GenerateTopic)).await;
        assert!(matches!(result, Err(AgentError::Cancelled)));
    }

    #[tokio::test]
    async fn test_run_workflow_via_inbox() {
        let mut orchestrator = Orchestrator::new(
            registry(FixedFatigueScorer::uniform(10), FixedComplianceScorer::new(85, vec![])),
            fast_policy(),
        );
        assert!(orchestrator.initialize().await);

        let mut payload = Payload::new();
        payload.insert("advisor_id".to_string(), json!("adv-9"));
        let low = create_message("dashboard", Action::Distribute, Payload::new(), None, false).unwrap();
        let high = create_message(
            "dashboard",
            Action::RunWorkflow,
            payload,
            Some(MessageContext::default().with_priority(5)),
            true,
        )
        .unwrap();
        orchestrator.enqueue(low);
        orchestrator.enqueue(high);

        let response = orchestrator.process_next().await.unwrap().unwrap();
        assert_eq!(response.action.to_string(), "RUN_WORKFLOW_SUCCESS");
        assert_eq!(response.payload["success"], json!(true));
        assert_eq!(response.payload["advisor_id"], json!("adv-9"));

        let unknown = orchestrator.process_next().await.unwrap();
        assert!(matches!(unknown, Err(AgentError::UnknownAction { .. })));
        assert!(orchestrator.process_next().await.is_none());

        orchestrator.reset();
        assert_eq!(orchestrator.state(), AgentState::Idle);
    }
}
