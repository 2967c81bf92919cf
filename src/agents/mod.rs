//! 子 Agent：运行时契约、外部协作方接口与流水线中的具体 Agent
//!
//! - **runtime**: SubAgent（可被编排器分发的接口）、ActionHandler、AgentRuntime（校验 / 状态机 / 领域重试）
//! - **collaborators**: 选题、疲劳度、合规评分等外部服务的窄接口
//! - **strategist / fatigue / compliance**: run_workflow 依次调用的三个 Agent
//! - **mock**: 固定数据的协作方实现（测试与演示用）

pub mod collaborators;
pub mod compliance;
pub mod fatigue;
pub mod mock;
pub mod runtime;
pub mod strategist;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::core::orchestrator::AgentRegistry;
use crate::core::RecoveryEngine;

pub use collaborators::{
    ComplianceAssessment, ComplianceScorer, FatigueScorer, RateLimitedFatigueScorer, Topic,
    TopicSource,
};
pub use compliance::{ComplianceReport, ComplianceValidator};
pub use fatigue::{FatigueChecker, FatigueReport};
pub use runtime::{ActionHandler, AgentRuntime, SubAgent};
pub use strategist::{ContentStrategist, TopicCache, TopicList};

/// 流水线中的 Agent 种类；as_str 即注册名与信封中的 agentId
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    Orchestrator,
    ContentStrategist,
    FatigueChecker,
    ComplianceValidator,
    ContentGenerator,
    ImageGenerator,
    #[serde(rename = "approval-manager")]
    Approval,
    #[serde(rename = "distribution-manager")]
    Distribution,
}

impl AgentKind {
    pub const ALL: [AgentKind; 8] = [
        AgentKind::Orchestrator,
        AgentKind::ContentStrategist,
        AgentKind::FatigueChecker,
        AgentKind::ComplianceValidator,
        AgentKind::ContentGenerator,
        AgentKind::ImageGenerator,
        AgentKind::Approval,
        AgentKind::Distribution,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Orchestrator => "orchestrator",
            AgentKind::ContentStrategist => "content-strategist",
            AgentKind::FatigueChecker => "fatigue-checker",
            AgentKind::ComplianceValidator => "compliance-validator",
            AgentKind::ContentGenerator => "content-generator",
            AgentKind::ImageGenerator => "image-generator",
            AgentKind::Approval => "approval-manager",
            AgentKind::Distribution => "distribution-manager",
        }
    }

    pub fn from_name(name: &str) -> Option<AgentKind> {
        AgentKind::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 子 Agent 共用的外部协作方
#[derive(Clone)]
pub struct Collaborators {
    pub topics: Arc<dyn TopicSource>,
    pub fatigue: Arc<dyn FatigueScorer>,
    pub compliance: Arc<dyn ComplianceScorer>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// 注册 run_workflow 需要的三个子 Agent；每次分发都会新建实例，RecoveryEngine 与选题缓存共享
pub fn standard_registry(
    cfg: &AppConfig,
    recovery: Arc<RecoveryEngine>,
    collaborators: Collaborators,
) -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    let history_limit = cfg.orchestrator.history_limit;

    {
        let recovery = Arc::clone(&recovery);
        let topics = Arc::clone(&collaborators.topics);
        let topic_count = cfg.agents.topic_count;
        let cache = TopicCache::new();
        registry.register(AgentKind::ContentStrategist.as_str(), move |cancel| -> Box<dyn SubAgent> {
            Box::new(AgentRuntime::new(
                ContentStrategist::with_cache(Arc::clone(&topics), topic_count, cache.clone()),
                Arc::clone(&recovery),
                history_limit,
            )
            .with_cancel(cancel))
        });
    }
    {
        let recovery = Arc::clone(&recovery);
        let scorer = Arc::clone(&collaborators.fatigue);
        let max_score = cfg.agents.max_fatigue_score;
        registry.register(AgentKind::FatigueChecker.as_str(), move |cancel| -> Box<dyn SubAgent> {
            Box::new(AgentRuntime::new(
                FatigueChecker::new(Arc::clone(&scorer), max_score),
                Arc::clone(&recovery),
                history_limit,
            )
            .with_cancel(cancel))
        });
    }
    {
        let scorer = Arc::clone(&collaborators.compliance);
        let min_score = cfg.agents.min_compliance_score;
        registry.register(AgentKind::ComplianceValidator.as_str(), move |cancel| -> Box<dyn SubAgent> {
            Box::new(AgentRuntime::new(
                ComplianceValidator::new(Arc::clone(&scorer), min_score),
                Arc::clone(&recovery),
                history_limit,
            )
            .with_cancel(cancel))
        });
    }

    registry
}
