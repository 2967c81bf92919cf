//! 内容疲劳度检查：CHECK_FATIGUE → { topic, fatigue_score, fatigued }
//!
//! 评分由协作方给出（0-100），分数 > max_score 视为疲劳。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agents::collaborators::{FatigueScorer, Topic};
use crate::agents::runtime::ActionHandler;
use crate::agents::AgentKind;
use crate::core::circuit::CircuitKey;
use crate::core::AgentError;
use crate::protocol::{Action, Envelope, Payload};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckFatigueRequest {
    pub advisor_id: String,
    pub topic: Topic,
}

/// CHECK_FATIGUE 的成功 payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatigueReport {
    pub topic: Topic,
    pub fatigue_score: u8,
    pub fatigued: bool,
}

pub struct FatigueChecker {
    scorer: Arc<dyn FatigueScorer>,
    max_score: u8,
}

impl FatigueChecker {
    pub fn new(scorer: Arc<dyn FatigueScorer>, max_score: u8) -> Self {
        Self { scorer, max_score }
    }

    async fn check(&self, envelope: &Envelope) -> Result<Payload, AgentError> {
        let request: CheckFatigueRequest = envelope.payload_as()?;
        let score = self.scorer.fatigue_score(&request.advisor_id, &request.topic).await?;
        if score > 100 {
            return Err(AgentError::Validation(format!(
                "fatigue score {score} out of range 0-100"
            )));
        }
        let report = FatigueReport {
            fatigued: score > self.max_score,
            fatigue_score: score,
            topic: request.topic,
        };
        tracing::debug!(
            advisor_id = %request.advisor_id,
            topic = %report.topic.id,
            score,
            fatigued = report.fatigued,
            "fatigue scored"
        );
        match serde_json::to_value(report) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Ok(Payload::new()),
            Err(e) => Err(AgentError::Validation(e.to_string())),
        }
    }
}

#[async_trait]
impl ActionHandler for FatigueChecker {
    fn kind(&self) -> AgentKind {
        AgentKind::FatigueChecker
    }

    fn circuit_key(&self) -> CircuitKey {
        CircuitKey::GoogleSheets
    }

    async fn handle(&self, action: &Action, envelope: &Envelope) -> Result<Payload, AgentError> {
        match action {
            Action::CheckFatigue => self.check(envelope).await,
            other => Err(AgentError::UnknownAction {
                agent: self.kind().to_string(),
                action: other.to_string(),
            }),
        }
    }
}
