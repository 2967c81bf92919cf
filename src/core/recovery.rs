//! 错误恢复引擎
//!
//! 分类 → 选策略 → 执行。Retry 只负责计算并等待退避时间，返回重试指令，由调用方重新发起操作（引擎自身不递归）；
//! CircuitBreak 累计熔断计数；Fallback 返回备用数据；GracefulDegradation 返回缓存 / 默认值；其余原样上抛。

use std::fmt;
use std::future::Future;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::config::RecoverySection;
use crate::core::circuit::{CircuitBreakerStatus, CircuitBreakers, CircuitKey, CircuitState};
use crate::core::classifier::{classify_error, determine_strategy, RecoveryStrategy, RetryPolicy};
use crate::core::plan::{recovery_plan, RecoveryPlan};
use crate::core::{AgentError, ErrorCategory};

/// 备用数据生成函数（零参，异步）
pub type FallbackFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<Value, AgentError>> + Send>;

/// 降级时返回哪类数据
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DegradationStrategy {
    Cache,
    Default,
    #[default]
    None,
}

/// 单次恢复决策的上下文：重试计数、熔断键、备用 / 缓存 / 默认数据
pub struct RecoveryContext {
    pub circuit_key: CircuitKey,
    pub retry_count: u32,
    /// 未设置时使用引擎配置的 max_retries
    pub max_retries: Option<u32>,
    pub fallback_data: Option<Value>,
    pub fallback_fn: Option<FallbackFn>,
    pub degradation: DegradationStrategy,
    pub cached_data: Option<Value>,
    pub default_data: Option<Value>,
}

impl fmt::Debug for RecoveryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryContext")
            .field("circuit_key", &self.circuit_key)
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .field("fallback_data", &self.fallback_data)
            .field("fallback_fn", &self.fallback_fn.is_some())
            .field("degradation", &self.degradation)
            .field("cached_data", &self.cached_data)
            .field("default_data", &self.default_data)
            .finish()
    }
}

impl RecoveryContext {
    pub fn new(circuit_key: CircuitKey) -> Self {
        Self {
            circuit_key,
            retry_count: 0,
            max_retries: None,
            fallback_data: None,
            fallback_fn: None,
            degradation: DegradationStrategy::None,
            cached_data: None,
            default_data: None,
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_fallback_data(mut self, data: Value) -> Self {
        self.fallback_data = Some(data);
        self
    }

    pub fn with_fallback_fn<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, AgentError>> + Send + 'static,
    {
        self.fallback_fn = Some(Box::new(move || Box::pin(f())));
        self
    }

    pub fn with_degradation(mut self, strategy: DegradationStrategy) -> Self {
        self.degradation = strategy;
        self
    }

    pub fn with_cached_data(mut self, data: Value) -> Self {
        self.cached_data = Some(data);
        self
    }

    pub fn with_default_data(mut self, data: Value) -> Self {
        self.default_data = Some(data);
        self
    }
}

/// 恢复结果（PROPAGATE 不在此列：它以 Err 返回原错误）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "strategy", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryOutcome {
    /// 调用方应在 delay 之后重新发起操作
    Retry { retry_count: u32, delay_ms: u64 },
    CircuitBreak {
        circuit_open: bool,
        failures: u32,
        next_attempt: Option<DateTime<Utc>>,
    },
    Fallback { data: Value },
    Degraded {
        data: Option<Value>,
        service_unavailable: bool,
    },
}

impl RecoveryOutcome {
    pub fn should_retry(&self) -> bool {
        matches!(self, RecoveryOutcome::Retry { .. })
    }

    /// 转成可放进响应信封的 payload
    pub fn to_payload(&self) -> Map<String, Value> {
        let value = match self {
            RecoveryOutcome::Retry { retry_count, delay_ms } => json!({
                "retry": true,
                "retryCount": retry_count,
                "delay": delay_ms,
            }),
            RecoveryOutcome::CircuitBreak {
                circuit_open,
                failures,
                next_attempt,
            } => json!({
                "retry": false,
                "circuitOpen": circuit_open,
                "failures": failures,
                "nextAttempt": next_attempt,
            }),
            RecoveryOutcome::Fallback { data } => json!({
                "success": true,
                "fallback": true,
                "data": data,
            }),
            RecoveryOutcome::Degraded {
                data,
                service_unavailable,
            } => json!({
                "success": true,
                "degraded": true,
                "data": data,
                "serviceUnavailable": service_unavailable,
            }),
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

/// 错误分类与恢复引擎；熔断状态跨调用持久，应每个进程（或子系统）构造一次并以 Arc 共享
#[derive(Debug, Default)]
pub struct RecoveryEngine {
    policy: RetryPolicy,
    circuits: CircuitBreakers,
}

impl RecoveryEngine {
    pub fn new(policy: RetryPolicy, circuits: CircuitBreakers) -> Self {
        Self { policy, circuits }
    }

    pub fn from_config(cfg: &RecoverySection) -> Self {
        Self::new(
            RetryPolicy::from_config(cfg),
            CircuitBreakers::new(
                cfg.circuit_failure_threshold,
                std::time::Duration::from_millis(cfg.circuit_open_ms),
            ),
        )
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn classify(&self, err: &AgentError) -> ErrorCategory {
        classify_error(err)
    }

    pub fn determine_strategy(
        &self,
        category: ErrorCategory,
        ctx: &RecoveryContext,
    ) -> RecoveryStrategy {
        let max_retries = ctx.max_retries.unwrap_or(self.policy.max_retries);
        determine_strategy(category, ctx.retry_count, max_retries)
    }

    pub async fn handle(
        &self,
        err: AgentError,
        ctx: RecoveryContext,
    ) -> Result<RecoveryOutcome, AgentError> {
        self.handle_with_cancel(err, ctx, &CancellationToken::new()).await
    }

    /// 执行恢复决策；Retry 的等待可被 cancel 打断（返回 Cancelled）
    pub async fn handle_with_cancel(
        &self,
        err: AgentError,
        ctx: RecoveryContext,
        cancel: &CancellationToken,
    ) -> Result<RecoveryOutcome, AgentError> {
        let category = self.classify(&err);
        let strategy = self.determine_strategy(category, &ctx);
        tracing::info!(
            category = %category,
            strategy = ?strategy,
            circuit = %ctx.circuit_key,
            retry_count = ctx.retry_count,
            error = %err,
            "recovery decision"
        );

        match strategy {
            RecoveryStrategy::Propagate => Err(err),
            RecoveryStrategy::Retry => {
                self.handle_retry(ctx.circuit_key, ctx.retry_count, cancel).await
            }
            RecoveryStrategy::CircuitBreak => Ok(self.handle_circuit_break(ctx.circuit_key)),
            RecoveryStrategy::Fallback => self.handle_fallback(err, ctx).await,
            RecoveryStrategy::GracefulDegradation => Ok(self.handle_graceful_degradation(ctx)),
        }
    }

    /// 第 retry_count 次失败之后的退避等待，返回的指令携带递增后的计数
    pub async fn handle_retry(
        &self,
        circuit_key: CircuitKey,
        retry_count: u32,
        cancel: &CancellationToken,
    ) -> Result<RecoveryOutcome, AgentError> {
        let retry_count = retry_count + 1;
        let delay = self.policy.jittered_delay(retry_count);
        tracing::debug!(
            circuit = %circuit_key,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            "backing off before retry"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
        }
        Ok(RecoveryOutcome::Retry {
            retry_count,
            delay_ms: delay.as_millis() as u64,
        })
    }

    pub fn handle_circuit_break(&self, key: CircuitKey) -> RecoveryOutcome {
        let status = self.circuits.record_failure(key);
        let circuit_open = status.state == CircuitState::Open;
        RecoveryOutcome::CircuitBreak {
            circuit_open,
            failures: status.failure_count,
            next_attempt: if circuit_open { status.next_attempt_at } else { None },
        }
    }

    /// 备用数据优先，其次备用函数；备用函数失败时上抛的是原始错误
    pub async fn handle_fallback(
        &self,
        err: AgentError,
        ctx: RecoveryContext,
    ) -> Result<RecoveryOutcome, AgentError> {
        if let Some(data) = ctx.fallback_data {
            return Ok(RecoveryOutcome::Fallback { data });
        }
        match ctx.fallback_fn {
            Some(fallback) => match fallback().await {
                Ok(data) => Ok(RecoveryOutcome::Fallback { data }),
                Err(fallback_err) => {
                    tracing::warn!(
                        circuit = %ctx.circuit_key,
                        fallback_error = %fallback_err,
                        "fallback failed, re-raising original error"
                    );
                    Err(err)
                }
            },
            None => Err(err),
        }
    }

    pub fn handle_graceful_degradation(&self, ctx: RecoveryContext) -> RecoveryOutcome {
        let data = match ctx.degradation {
            DegradationStrategy::Cache => ctx.cached_data,
            DegradationStrategy::Default => ctx.default_data,
            DegradationStrategy::None => None,
        };
        RecoveryOutcome::Degraded {
            service_unavailable: data.is_none(),
            data,
        }
    }

    pub fn circuit_status(&self, key: CircuitKey) -> CircuitBreakerStatus {
        self.circuits.status(key)
    }

    pub fn circuit_statuses(&self) -> Vec<CircuitBreakerStatus> {
        self.circuits.all_statuses()
    }

    pub fn check_circuit(&self, key: CircuitKey) -> Result<(), AgentError> {
        self.circuits.check(key)
    }

    pub fn record_success(&self, key: CircuitKey) {
        self.circuits.record_success(key);
    }

    pub fn reset_circuit(&self, key: CircuitKey) {
        self.circuits.reset(key);
    }

    pub fn reset_all_circuits(&self) {
        self.circuits.reset_all();
    }

    pub fn recovery_plan(&self, category: ErrorCategory) -> RecoveryPlan {
        recovery_plan(category)
    }
}
