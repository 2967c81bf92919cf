//! 熔断器：按 CircuitKey 懒创建，累计失败达到阈值后打开一段时间
//!
//! 状态查询时惰性地把已到期的 OPEN 转为 HALF_OPEN（没有后台定时器）。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::AgentKind;
use crate::core::AgentError;

/// 熔断键：受保护的外部服务或子 Agent，避免拼写错误悄悄生成新熔断器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitKey {
    GoogleSheets,
    GoogleDrive,
    WhatsApp,
    Gemini,
    Claude,
    Agent(AgentKind),
}

impl fmt::Display for CircuitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitKey::GoogleSheets => write!(f, "google-sheets"),
            CircuitKey::GoogleDrive => write!(f, "google-drive"),
            CircuitKey::WhatsApp => write!(f, "whatsapp"),
            CircuitKey::Gemini => write!(f, "gemini"),
            CircuitKey::Claude => write!(f, "claude"),
            CircuitKey::Agent(kind) => write!(f, "agent:{}", kind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

/// 单个熔断器的对外快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerStatus {
    pub key: CircuitKey,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
struct CircuitRecord {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
}

impl CircuitRecord {
    fn refresh(&mut self, now: DateTime<Utc>) {
        if self.state == CircuitState::Open && self.next_attempt_at.is_some_and(|t| now >= t) {
            self.state = CircuitState::HalfOpen;
        }
    }

    fn snapshot(&self, key: CircuitKey) -> CircuitBreakerStatus {
        CircuitBreakerStatus {
            key,
            state: self.state,
            failure_count: self.failure_count,
            last_failure_at: self.last_failure_at,
            next_attempt_at: self.next_attempt_at,
        }
    }
}

/// 熔断器集合，由 RecoveryEngine 独占；外部只通过 status / check 读取
#[derive(Debug)]
pub struct CircuitBreakers {
    failure_threshold: u32,
    open_for: chrono::Duration,
    circuits: Mutex<HashMap<CircuitKey, CircuitRecord>>,
}

impl CircuitBreakers {
    pub fn new(failure_threshold: u32, open_for: Duration) -> Self {
        let open_for = chrono::Duration::from_std(open_for)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        Self {
            failure_threshold: failure_threshold.max(1),
            open_for,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CircuitKey, CircuitRecord>> {
        self.circuits.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// 记录一次失败；累计失败 >= 阈值时打开熔断并设置 next_attempt_at = now + open_for
    pub fn record_failure(&self, key: CircuitKey) -> CircuitBreakerStatus {
        let now = Utc::now();
        let mut circuits = self.lock();
        let record = circuits.entry(key).or_default();
        record.failure_count = record.failure_count.saturating_add(1);
        record.last_failure_at = Some(now);
        if record.failure_count >= self.failure_threshold {
            let next_attempt = now + self.open_for;
            if record.state != CircuitState::Open {
                tracing::warn!(
                    circuit = %key,
                    failures = record.failure_count,
                    next_attempt = %next_attempt,
                    "circuit opened"
                );
            }
            record.state = CircuitState::Open;
            record.next_attempt_at = Some(next_attempt);
        }
        record.snapshot(key)
    }

    /// 成功调用：关闭熔断并清零计数
    pub fn record_success(&self, key: CircuitKey) {
        if let Some(record) = self.lock().remove(&key) {
            if record.state != CircuitState::Closed {
                tracing::info!(circuit = %key, "circuit closed after successful call");
            }
        }
    }

    pub fn status(&self, key: CircuitKey) -> CircuitBreakerStatus {
        let mut circuits = self.lock();
        match circuits.get_mut(&key) {
            Some(record) => {
                record.refresh(Utc::now());
                record.snapshot(key)
            }
            None => CircuitRecord::default().snapshot(key),
        }
    }

    /// OPEN 期间拒绝调用；HALF_OPEN 放行试探请求
    pub fn check(&self, key: CircuitKey) -> Result<(), AgentError> {
        let status = self.status(key);
        match (status.state, status.next_attempt_at) {
            (CircuitState::Open, Some(next_attempt)) => Err(AgentError::CircuitOpen {
                circuit: key,
                next_attempt,
            }),
            _ => Ok(()),
        }
    }

    pub fn reset(&self, key: CircuitKey) {
        self.lock().remove(&key);
    }

    pub fn reset_all(&self) {
        self.lock().clear();
    }

    pub fn all_statuses(&self) -> Vec<CircuitBreakerStatus> {
        let now = Utc::now();
        let mut circuits = self.lock();
        circuits
            .iter_mut()
            .map(|(key, record)| {
                record.refresh(now);
                record.snapshot(*key)
            })
            .collect()
    }
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_four_failures_stay_closed() {
        let breakers = CircuitBreakers::default();
        for _ in 0..4 {
            breakers.record_failure(CircuitKey::GoogleSheets);
        }
        let status = breakers.status(CircuitKey::GoogleSheets);
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 4);
        assert!(breakers.check(CircuitKey::GoogleSheets).is_ok());
    }

    #[test]
    fn test_fifth_failure_opens() {
        let breakers = CircuitBreakers::default();
        let before = Utc::now();
        let mut last = None;
        for _ in 0..5 {
            last = Some(breakers.record_failure(CircuitKey::Gemini));
        }
        let status = last.unwrap();
        assert_eq!(status.state, CircuitState::Open);
        let next = status.next_attempt_at.unwrap();
        assert!(next >= before + chrono::Duration::seconds(59));
        assert!(matches!(
            breakers.check(CircuitKey::Gemini),
            Err(AgentError::CircuitOpen { circuit: CircuitKey::Gemini, .. })
        ));
    }

    #[test]
    fn test_circuits_are_independent() {
        let breakers = CircuitBreakers::default();
        for _ in 0..5 {
            breakers.record_failure(CircuitKey::WhatsApp);
        }
        assert_eq!(breakers.status(CircuitKey::Claude).state, CircuitState::Closed);
        assert_eq!(breakers.status(CircuitKey::Claude).failure_count, 0);
    }

    #[test]
    fn test_open_becomes_half_open_after_cooldown() {
        let breakers = CircuitBreakers::new(2, Duration::from_millis(20));
        let key = CircuitKey::Agent(AgentKind::FatigueChecker);
        breakers.record_failure(key);
        breakers.record_failure(key);
        assert_eq!(breakers.status(key).state, CircuitState::Open);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(breakers.status(key).state, CircuitState::HalfOpen);
        assert!(breakers.check(key).is_ok());
    }

    #[test]
    fn test_success_and_reset_close_circuit() {
        let breakers = CircuitBreakers::new(1, Duration::from_secs(60));
        breakers.record_failure(CircuitKey::GoogleDrive);
        assert_eq!(breakers.status(CircuitKey::GoogleDrive).state, CircuitState::Open);
        breakers.record_success(CircuitKey::GoogleDrive);
        assert_eq!(breakers.status(CircuitKey::GoogleDrive).state, CircuitState::Closed);

        breakers.record_failure(CircuitKey::GoogleDrive);
        breakers.reset(CircuitKey::GoogleDrive);
        assert_eq!(breakers.status(CircuitKey::GoogleDrive).failure_count, 0);
    }

    #[test]
    fn test_key_display() {
        assert_eq!(CircuitKey::GoogleSheets.to_string(), "google-sheets");
        assert_eq!(
            CircuitKey::Agent(AgentKind::ComplianceValidator).to_string(),
            "agent:compliance-validator"
        );
    }
}
