//! 固定数据的协作方（用于测试与演示，无需外部服务）

use std::collections::HashMap;

use async_trait::async_trait;

use crate::agents::collaborators::{
    ComplianceAssessment, ComplianceScorer, FatigueScorer, Topic, TopicSource,
};
use crate::core::AgentError;

/// 返回预置选题的前 count 个
#[derive(Debug, Clone, Default)]
pub struct StaticTopicSource {
    topics: Vec<Topic>,
}

impl StaticTopicSource {
    pub fn new(topics: Vec<Topic>) -> Self {
        Self { topics }
    }

    /// 演示用的理财选题
    pub fn sample() -> Self {
        Self::new(vec![
            Topic {
                id: "sip-basics".to_string(),
                title: "Why monthly SIPs beat market timing".to_string(),
                summary: "Rupee-cost averaging explained with a five-year example".to_string(),
            },
            Topic {
                id: "term-insurance".to_string(),
                title: "Term insurance before investing".to_string(),
                summary: "Protect the family first, then build wealth".to_string(),
            },
            Topic {
                id: "emergency-fund".to_string(),
                title: "Six months of expenses, parked safely".to_string(),
                summary: "Where to keep an emergency fund and why liquidity matters".to_string(),
            },
            Topic {
                id: "tax-harvesting".to_string(),
                title: "Year-end tax harvesting checklist".to_string(),
                summary: "Booking long-term gains within the exemption limit".to_string(),
            },
            Topic {
                id: "goal-planning".to_string(),
                title: "Mapping goals to asset classes".to_string(),
                summary: "Short, medium and long horizons need different products".to_string(),
            },
        ])
    }
}

#[async_trait]
impl TopicSource for StaticTopicSource {
    async fn generate_topics(&self, _advisor_id: &str, count: usize) -> Result<Vec<Topic>, AgentError> {
        Ok(self.topics.iter().take(count).cloned().collect())
    }
}

/// 按选题 id 返回固定疲劳分，未配置的返回 default_score
#[derive(Debug, Clone, Default)]
pub struct FixedFatigueScorer {
    scores: HashMap<String, u8>,
    default_score: u8,
}

impl FixedFatigueScorer {
    pub fn uniform(score: u8) -> Self {
        Self {
            scores: HashMap::new(),
            default_score: score,
        }
    }

    pub fn with_score(mut self, topic_id: impl Into<String>, score: u8) -> Self {
        self.scores.insert(topic_id.into(), score);
        self
    }
}

#[async_trait]
impl FatigueScorer for FixedFatigueScorer {
    async fn fatigue_score(&self, _advisor_id: &str, topic: &Topic) -> Result<u8, AgentError> {
        Ok(self.scores.get(&topic.id).copied().unwrap_or(self.default_score))
    }
}

#[derive(Debug, Clone)]
pub struct FixedComplianceScorer {
    assessment: ComplianceAssessment,
}

impl FixedComplianceScorer {
    pub fn new(score: u8, violations: Vec<String>) -> Self {
        Self {
            assessment: ComplianceAssessment { score, violations },
        }
    }
}

#[async_trait]
impl ComplianceScorer for FixedComplianceScorer {
    async fn assess(&self, _advisor_id: &str, _topic: &Topic) -> Result<ComplianceAssessment, AgentError> {
        Ok(self.assessment.clone())
    }
}
