//! 选题策划：GENERATE_TOPIC → { topics }
//!
//! 最近一次成功生成的选题留作缓存；选题服务出现系统级故障时以缓存降级。
//! 编排器每次分发都会新建实例，缓存放在 TopicCache 里由注册表共享，跨分发保留。

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agents::collaborators::{Topic, TopicSource};
use crate::agents::runtime::ActionHandler;
use crate::agents::AgentKind;
use crate::core::circuit::CircuitKey;
use crate::core::recovery::{DegradationStrategy, RecoveryContext};
use crate::core::AgentError;
use crate::protocol::{Action, Envelope, Payload};

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateTopicRequest {
    pub advisor_id: String,
    #[serde(default)]
    pub topic_count: Option<usize>,
}

/// GENERATE_TOPIC 的成功 payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicList {
    pub topics: Vec<Topic>,
}

/// 最近一次成功的 GENERATE_TOPIC payload；Clone 共享同一份
#[derive(Debug, Clone, Default)]
pub struct TopicCache {
    inner: Arc<Mutex<Option<Value>>>,
}

impl TopicCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Value>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self) -> Option<Value> {
        self.lock().clone()
    }

    pub fn store(&self, payload: &Payload) {
        *self.lock() = Some(Value::Object(payload.clone()));
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }
}

pub struct ContentStrategist {
    source: Arc<dyn TopicSource>,
    default_count: usize,
    cache: TopicCache,
}

impl ContentStrategist {
    pub fn new(source: Arc<dyn TopicSource>, default_count: usize) -> Self {
        Self::with_cache(source, default_count, TopicCache::new())
    }

    pub fn with_cache(source: Arc<dyn TopicSource>, default_count: usize, cache: TopicCache) -> Self {
        Self {
            source,
            default_count,
            cache,
        }
    }

    async fn generate(&self, envelope: &Envelope) -> Result<Payload, AgentError> {
        let request: GenerateTopicRequest = envelope.payload_as()?;
        if request.advisor_id.trim().is_empty() {
            return Err(AgentError::Validation("advisor_id is required".to_string()));
        }
        let count = request.topic_count.unwrap_or(self.default_count);
        let topics = self.source.generate_topics(&request.advisor_id, count).await?;
        tracing::info!(advisor_id = %request.advisor_id, count = topics.len(), "topics generated");

        let payload = match serde_json::to_value(TopicList { topics }) {
            Ok(Value::Object(map)) => map,
            Ok(_) => Payload::new(),
            Err(e) => return Err(AgentError::Validation(e.to_string())),
        };
        self.cache.store(&payload);
        Ok(payload)
    }
}

#[async_trait]
impl ActionHandler for ContentStrategist {
    fn kind(&self) -> AgentKind {
        AgentKind::ContentStrategist
    }

    fn circuit_key(&self) -> CircuitKey {
        CircuitKey::Gemini
    }

    async fn handle(&self, action: &Action, envelope: &Envelope) -> Result<Payload, AgentError> {
        match action {
            Action::GenerateTopic => self.generate(envelope).await,
            other => Err(AgentError::UnknownAction {
                agent: self.kind().to_string(),
                action: other.to_string(),
            }),
        }
    }

    fn recovery_context(&self, _action: &Action, _envelope: &Envelope) -> RecoveryContext {
        let ctx = RecoveryContext::new(self.circuit_key());
        match self.cache.get() {
            Some(cached) => ctx
                .with_degradation(DegradationStrategy::Cache)
                .with_cached_data(cached),
            None => ctx,
        }
    }

    fn clear(&mut self) {
        self.cache.clear();
    }
}
