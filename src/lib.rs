//! 理财顾问内容流水线：多 Agent 通信与编排核心
//!
//! 模块划分：
//! - **protocol**: 信封格式、结构校验、优先队列
//! - **rate_limit**: 令牌桶与读写分离限流
//! - **core**: 错误分类与恢复（重试 / 熔断 / 备用 / 降级）、状态机、编排器
//! - **agents**: 子 Agent 运行时契约与选题 / 疲劳度 / 合规三个 Agent
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **observability**: 日志初始化

pub mod agents;
pub mod config;
pub mod core;
pub mod observability;
pub mod protocol;
pub mod rate_limit;

pub use crate::core::{AgentError, Orchestrator, RecoveryEngine};
pub use protocol::{Action, Envelope};
