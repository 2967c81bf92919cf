//! 状态定义：Agent 生命周期状态与编排会话状态
//!
//! 每次调用内单调推进：IDLE → PROCESSING →（WAITING）→ COMPLETED / ERROR；收到重试指令时经 RETRY 回到 PROCESSING。
//! 终态只能通过显式 reset 回到 IDLE；新一次调用可以从终态直接进入 PROCESSING。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    #[default]
    Idle,
    Processing,
    Waiting,
    Completed,
    Error,
    Retry,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Idle => "IDLE",
            AgentState::Processing => "PROCESSING",
            AgentState::Waiting => "WAITING",
            AgentState::Completed => "COMPLETED",
            AgentState::Error => "ERROR",
            AgentState::Retry => "RETRY",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Completed | AgentState::Error)
    }

    /// 允许的迁移（reset 不经过这里）
    pub fn can_transition_to(&self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Idle, Processing)
                | (Processing, Waiting | Completed | Error | Retry | Idle)
                | (Waiting, Processing | Completed | Error | Retry)
                | (Retry, Processing | Error)
                | (Completed | Error, Processing)
        )
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IDLE" => Ok(AgentState::Idle),
            "PROCESSING" => Ok(AgentState::Processing),
            "WAITING" => Ok(AgentState::Waiting),
            "COMPLETED" => Ok(AgentState::Completed),
            "ERROR" => Ok(AgentState::Error),
            "RETRY" => Ok(AgentState::Retry),
            other => Err(format!("unknown agent state: {other}")),
        }
    }
}

/// 一次编排运行的会话状态，只由 Orchestrator 通过 transition / set_state 修改
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSessionState {
    pub session_id: String,
    pub state: AgentState,
    /// 分发层重试次数（不含 Agent 内部的领域重试）
    pub retry_count: u32,
}

impl AgentSessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            state: AgentState::Idle,
            retry_count: 0,
        }
    }

    /// 按规则迁移；非法迁移被忽略并返回 false
    pub fn transition(&mut self, next: AgentState) -> bool {
        if self.state == next {
            return true;
        }
        if self.state.can_transition_to(next) {
            tracing::debug!(session_id = %self.session_id, from = %self.state, to = %next, "state transition");
            self.state = next;
            true
        } else {
            tracing::debug!(session_id = %self.session_id, from = %self.state, to = %next, "ignored state transition");
            false
        }
    }

    /// 按名称迁移；未知名称静默忽略
    pub fn set_state(&mut self, name: &str) -> bool {
        match name.parse::<AgentState>() {
            Ok(next) => self.transition(next),
            Err(_) => false,
        }
    }

    pub fn reset(&mut self) {
        self.state = AgentState::Idle;
        self.retry_count = 0;
    }
}
