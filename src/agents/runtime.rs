//! Agent 运行时契约
//!
//! SubAgent 是编排器可分发的最小接口（initialize / process_message / state / reset）。
//! AgentRuntime 把一个 ActionHandler 包装成 SubAgent：校验信封、推进状态机、保存最近历史，
//! 并把处理器的失败交给 RecoveryEngine（领域层重试，计数独立于编排器的分发重试）。

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::agents::AgentKind;
use crate::core::circuit::CircuitKey;
use crate::core::recovery::{RecoveryContext, RecoveryOutcome};
use crate::core::state::AgentState;
use crate::core::{AgentError, RecoveryEngine};
use crate::protocol::{
    create_error_response, create_success_response, validate_message, Action, Envelope, Payload,
};

/// 可被编排器分发的 Agent
#[async_trait]
pub trait SubAgent: Send + Sync {
    fn agent_id(&self) -> &str;

    /// 准备协作方；失败返回 false，不返回错误
    async fn initialize(&mut self) -> bool;

    /// 处理一条信封。结构不合法时返回 ERROR 响应信封（Ok），领域失败在恢复无果后返回 Err
    async fn process_message(&mut self, envelope: Envelope) -> Result<Envelope, AgentError>;

    fn state(&self) -> AgentState;

    /// 回到 IDLE 并清空本地缓存（历史、队列）
    fn reset(&mut self);
}

/// 单个 Agent 的动作处理器：按 action 分派到具体逻辑
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn kind(&self) -> AgentKind;

    /// 处理器依赖的外部服务对应的熔断键
    fn circuit_key(&self) -> CircuitKey {
        CircuitKey::Agent(self.kind())
    }

    async fn setup(&mut self) -> Result<(), AgentError> {
        Ok(())
    }

    /// 未知 action 返回 UnknownAction
    async fn handle(&self, action: &Action, envelope: &Envelope) -> Result<Payload, AgentError>;

    /// 失败时交给 RecoveryEngine 的上下文（备用数据、降级数据等）
    fn recovery_context(&self, _action: &Action, _envelope: &Envelope) -> RecoveryContext {
        RecoveryContext::new(self.circuit_key())
    }

    /// reset 时清空处理器自己的缓存
    fn clear(&mut self) {}
}

pub struct AgentRuntime<H> {
    handler: H,
    recovery: Arc<RecoveryEngine>,
    state: AgentState,
    history: VecDeque<Envelope>,
    history_limit: usize,
    cancel: CancellationToken,
}

impl<H: ActionHandler> AgentRuntime<H> {
    pub fn new(handler: H, recovery: Arc<RecoveryEngine>, history_limit: usize) -> Self {
        Self {
            handler,
            recovery,
            state: AgentState::Idle,
            history: VecDeque::new(),
            history_limit,
            cancel: CancellationToken::new(),
        }
    }

    /// 处理器调用与领域重试的退避等待都挂到该 token 上
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// 最近处理过的信封（旧 → 新）
    pub fn history(&self) -> impl Iterator<Item = &Envelope> {
        self.history.iter()
    }

    fn set_state(&mut self, next: AgentState) {
        if self.state == next {
            return;
        }
        if self.state.can_transition_to(next) {
            tracing::trace!(agent = %self.handler.kind(), from = %self.state, to = %next, "agent state");
            self.state = next;
        } else {
            tracing::debug!(agent = %self.handler.kind(), from = %self.state, to = %next, "ignored agent state transition");
        }
    }

    fn remember(&mut self, envelope: &Envelope) {
        if self.history_limit == 0 {
            return;
        }
        self.history.push_back(envelope.clone());
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }

    async fn run_with_recovery(&mut self, envelope: &Envelope) -> Result<Envelope, AgentError> {
        let agent_id = self.handler.kind().as_str();
        let key = self.handler.circuit_key();
        self.recovery.check_circuit(key)?;

        let mut retry_count = 0;
        loop {
            self.set_state(AgentState::Waiting);
            let handled = tokio::select! {
                result = self.handler.handle(&envelope.action, envelope) => result,
                _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
            };
            let err = match handled {
                Ok(payload) => {
                    self.recovery.record_success(key);
                    return Ok(create_success_response(agent_id, envelope, payload));
                }
                Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                Err(err) => err,
            };

            let ctx = self
                .handler
                .recovery_context(&envelope.action, envelope)
                .with_retry_count(retry_count);
            let outcome = self
                .recovery
                .handle_with_cancel(err.clone(), ctx, &self.cancel)
                .await?;

            match outcome {
                RecoveryOutcome::Retry { retry_count: next, delay_ms } => {
                    tracing::info!(
                        agent = agent_id,
                        action = %envelope.action,
                        session_id = %envelope.session_id(),
                        retry_count = next,
                        delay_ms,
                        "retrying after domain error"
                    );
                    retry_count = next;
                    self.set_state(AgentState::Retry);
                    self.set_state(AgentState::Processing);
                }
                RecoveryOutcome::Fallback { .. } | RecoveryOutcome::Degraded { .. } => {
                    tracing::warn!(
                        agent = agent_id,
                        action = %envelope.action,
                        error = %err,
                        "answered with recovered data"
                    );
                    return Ok(create_success_response(agent_id, envelope, outcome.to_payload()));
                }
                RecoveryOutcome::CircuitBreak {
                    circuit_open: true,
                    next_attempt,
                    ..
                } => {
                    return Err(AgentError::CircuitOpen {
                        circuit: key,
                        next_attempt: next_attempt.unwrap_or_else(Utc::now),
                    });
                }
                RecoveryOutcome::CircuitBreak { .. } => return Err(err),
            }
        }
    }
}

#[async_trait]
impl<H: ActionHandler> SubAgent for AgentRuntime<H> {
    fn agent_id(&self) -> &str {
        self.handler.kind().as_str()
    }

    async fn initialize(&mut self) -> bool {
        self.set_state(AgentState::Processing);
        match self.handler.setup().await {
            Ok(()) => {
                self.set_state(AgentState::Idle);
                true
            }
            Err(e) => {
                tracing::error!(agent = %self.handler.kind(), error = %e, "agent initialization failed");
                self.set_state(AgentState::Error);
                false
            }
        }
    }

    async fn process_message(&mut self, envelope: Envelope) -> Result<Envelope, AgentError> {
        self.set_state(AgentState::Processing);
        self.remember(&envelope);

        let agent_id = self.handler.kind().as_str();
        if let Err(err) = validate_message(&envelope).into_result() {
            tracing::warn!(agent = agent_id, error = %err, "rejected malformed envelope");
            self.set_state(AgentState::Error);
            return Ok(create_error_response(agent_id, &envelope, &err));
        }

        tracing::debug!(
            agent = agent_id,
            action = %envelope.action,
            session_id = %envelope.session_id(),
            "processing message"
        );
        let result = self.run_with_recovery(&envelope).await;
        match &result {
            Ok(_) => self.set_state(AgentState::Completed),
            Err(e) => {
                tracing::error!(agent = agent_id, action = %envelope.action, error = %e, "message failed");
                self.set_state(AgentState::Error);
            }
        }
        result
    }

    fn state(&self) -> AgentState {
        self.state
    }

    fn reset(&mut self) {
        self.state = AgentState::Idle;
        self.history.clear();
        self.handler.clear();
    }
}
