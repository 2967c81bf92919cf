//! 外部协作方的窄接口：选题生成、疲劳度评分、合规评分
//!
//! 具体实现（Sheets、Gemini、Claude 等）不在本 crate 内；失败以 AgentError::Service 返回，由分类器决定恢复策略。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::rate_limit::DualRateLimiter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub summary: String,
}

impl Topic {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            summary: String::new(),
        }
    }
}

/// 合规评估：0-100 分及违规项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceAssessment {
    pub score: u8,
    #[serde(default)]
    pub violations: Vec<String>,
}

#[async_trait]
pub trait TopicSource: Send + Sync {
    async fn generate_topics(&self, advisor_id: &str, count: usize) -> Result<Vec<Topic>, AgentError>;
}

/// 疲劳度：该顾问近期发布内容与选题的重复程度，0-100
#[async_trait]
pub trait FatigueScorer: Send + Sync {
    async fn fatigue_score(&self, advisor_id: &str, topic: &Topic) -> Result<u8, AgentError>;
}

#[async_trait]
pub trait ComplianceScorer: Send + Sync {
    async fn assess(&self, advisor_id: &str, topic: &Topic) -> Result<ComplianceAssessment, AgentError>;
}

/// 读取发布历史受表格读配额限制：每次评分先占一个读令牌
///
/// 排队等待挂在 cancel 上（通常是会话的取消 token），取消后以 Cancelled 返回且不占令牌。
pub struct RateLimitedFatigueScorer {
    inner: Arc<dyn FatigueScorer>,
    limiter: DualRateLimiter,
    cancel: CancellationToken,
}

impl RateLimitedFatigueScorer {
    pub fn new(inner: Arc<dyn FatigueScorer>, limiter: DualRateLimiter) -> Self {
        Self {
            inner,
            limiter,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[async_trait]
impl FatigueScorer for RateLimitedFatigueScorer {
    async fn fatigue_score(&self, advisor_id: &str, topic: &Topic) -> Result<u8, AgentError> {
        self.limiter
            .execute_read_with_cancel(&self.cancel, || self.inner.fatigue_score(advisor_id, topic))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::agents::mock::FixedFatigueScorer;
    use crate::rate_limit::RateLimiter;

    #[tokio::test]
    async fn test_rate_limited_scorer_consumes_read_tokens() {
        let limiter = DualRateLimiter::new(
            RateLimiter::new("sheets:shared", 4, Duration::from_secs(100)),
            RateLimiter::new("sheets:write", 2, Duration::from_secs(100)),
        );
        let scorer = RateLimitedFatigueScorer::new(
            Arc::new(FixedFatigueScorer::uniform(42)),
            limiter.clone(),
        );
        let topic = Topic::new("t1", "Retirement basics");
        assert_eq!(scorer.fatigue_score("adv-1", &topic).await.unwrap(), 42);
        assert_eq!(scorer.fatigue_score("adv-1", &topic).await.unwrap(), 42);

        let status = limiter.status();
        assert_eq!(status.shared.available_tokens, 2);
        assert_eq!(status.write.available_tokens, 2);
    }

    #[tokio::test]
    async fn test_rate_limited_scorer_observes_cancel() {
        let limiter = DualRateLimiter::new(
            RateLimiter::new("sheets:shared", 1, Duration::from_secs(60)),
            RateLimiter::new("sheets:write", 1, Duration::from_secs(60)),
        );
        limiter.acquire_read().await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let scorer = RateLimitedFatigueScorer::new(
            Arc::new(FixedFatigueScorer::uniform(42)),
            limiter.clone(),
        )
        .with_cancel(token);
        let result = scorer.fatigue_score("adv-1", &Topic::new("t1", "Retirement basics")).await;
        assert!(matches!(result, Err(AgentError::Cancelled)));
        assert_eq!(limiter.status().shared.queue_length, 0);
    }
}
