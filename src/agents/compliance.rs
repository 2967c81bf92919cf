//! 合规校验：VALIDATE_COMPLIANCE → { compliant, score, violations }
//!
//! 评分与违规项由协作方给出，分数 >= min_score 视为合规。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agents::collaborators::{ComplianceScorer, Topic};
use crate::agents::runtime::ActionHandler;
use crate::agents::AgentKind;
use crate::core::circuit::CircuitKey;
use crate::core::AgentError;
use crate::protocol::{Action, Envelope, Payload};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateComplianceRequest {
    pub advisor_id: String,
    pub topic: Topic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub compliant: bool,
    pub score: u8,
    #[serde(default)]
    pub violations: Vec<String>,
}

pub struct ComplianceValidator {
    scorer: Arc<dyn ComplianceScorer>,
    min_score: u8,
}

impl ComplianceValidator {
    pub fn new(scorer: Arc<dyn ComplianceScorer>, min_score: u8) -> Self {
        Self { scorer, min_score }
    }

    async fn validate(&self, envelope: &Envelope) -> Result<Payload, AgentError> {
        let request: ValidateComplianceRequest = envelope.payload_as()?;
        let assessment = self.scorer.assess(&request.advisor_id, &request.topic).await?;
        if assessment.score > 100 {
            return Err(AgentError::Validation(format!(
                "compliance score {} out of range 0-100",
                assessment.score
            )));
        }
        let report = ComplianceReport {
            compliant: assessment.score >= self.min_score,
            score: assessment.score,
            violations: assessment.violations,
        };
        if !report.compliant {
            tracing::warn!(
                advisor_id = %request.advisor_id,
                topic = %request.topic.id,
                score = report.score,
                violations = report.violations.len(),
                "topic failed compliance"
            );
        }
        match serde_json::to_value(report) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Ok(Payload::new()),
            Err(e) => Err(AgentError::Validation(e.to_string())),
        }
    }
}

#[async_trait]
impl ActionHandler for ComplianceValidator {
    fn kind(&self) -> AgentKind {
        AgentKind::ComplianceValidator
    }

    fn circuit_key(&self) -> CircuitKey {
        CircuitKey::Claude
    }

    async fn handle(&self, action: &Action, envelope: &Envelope) -> Result<Payload, AgentError> {
        match action {
            Action::ValidateCompliance => self.validate(envelope).await,
            other => Err(AgentError::UnknownAction {
                agent: self.kind().to_string(),
                action: other.to_string(),
            }),
        }
    }
}
