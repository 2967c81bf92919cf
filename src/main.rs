//! advisor-pipeline：跑一次 选题 → 疲劳度 → 合规 工作流并输出 JSON 结果
//!
//! 用法：advisor-pipeline [advisor_id]
//! 协作方使用内置的固定数据；配置见 config/default.toml，可用 ADVISOR__* 环境变量覆盖。

use std::sync::Arc;

use anyhow::Context;
use advisor_agents::agents::mock::{FixedComplianceScorer, FixedFatigueScorer, StaticTopicSource};
use advisor_agents::agents::{standard_registry, Collaborators, RateLimitedFatigueScorer};
use advisor_agents::config::{load_config, AppConfig};
use advisor_agents::core::{Orchestrator, RecoveryEngine, SessionSupervisor, WorkflowRequest};
use advisor_agents::observability;
use advisor_agents::rate_limit::DualRateLimiter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let advisor_id = std::env::args().nth(1).unwrap_or_else(|| "demo-advisor".to_string());

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    // 进程内共享：熔断计数与令牌桶必须跨调用保留
    let recovery = Arc::new(RecoveryEngine::from_config(&cfg.recovery));
    let sheets = DualRateLimiter::from_config("google-sheets", &cfg.rate_limits);

    let supervisor = SessionSupervisor::new();

    let fatigue = FixedFatigueScorer::uniform(35).with_score("sip-basics", 82);
    let fatigue = RateLimitedFatigueScorer::new(Arc::new(fatigue), sheets.clone())
        .with_cancel(supervisor.cancel_token());
    let collaborators = Collaborators {
        topics: Arc::new(StaticTopicSource::sample()),
        fatigue: Arc::new(fatigue),
        compliance: Arc::new(FixedComplianceScorer::new(88, Vec::new())),
    };

    let registry = standard_registry(&cfg, Arc::clone(&recovery), collaborators);
    let mut orchestrator = Orchestrator::from_config(&cfg, registry).with_supervisor(supervisor.clone());

    let ctrl_c = supervisor.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling session");
            ctrl_c.cancel();
        }
    });

    let result = orchestrator
        .run_workflow(WorkflowRequest::new(advisor_id))
        .await
        .context("Workflow failed")?;

    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to serialize workflow result")?
    );
    tracing::info!(
        session_id = %result.session_id,
        sheets_quota = ?sheets.status(),
        circuits = recovery.circuit_statuses().len(),
        "done"
    );

    Ok(())
}
