//! 核心层：错误与分类、熔断、恢复引擎、状态机、会话监管、编排器

pub mod circuit;
pub mod classifier;
pub mod error;
pub mod orchestrator;
pub mod plan;
pub mod recovery;
pub mod session_supervisor;
pub mod state;

pub use circuit::{CircuitBreakerStatus, CircuitBreakers, CircuitKey, CircuitState};
pub use classifier::{classify, classify_error, determine_strategy, RecoveryStrategy, RetryPolicy};
pub use error::{AgentError, ErrorCategory, ServiceError};
pub use orchestrator::{
    AgentRegistry, DispatchPolicy, Orchestrator, WorkflowError, WorkflowRequest, WorkflowResult,
};
pub use plan::{recovery_plan, RecoveryPlan};
pub use recovery::{DegradationStrategy, RecoveryContext, RecoveryEngine, RecoveryOutcome};
pub use session_supervisor::SessionSupervisor;
pub use state::{AgentSessionState, AgentState};
