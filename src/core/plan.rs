//! 恢复预案：只供人工查看（报告 / 告警），从不自动执行

use serde::Serialize;

use crate::core::ErrorCategory;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryPlan {
    pub category: ErrorCategory,
    pub steps: Vec<String>,
    /// 预计恢复时间（秒）
    pub estimated_recovery_time: u64,
    pub requires_manual_intervention: bool,
}

pub fn recovery_plan(category: ErrorCategory) -> RecoveryPlan {
    let (steps, estimated_recovery_time, requires_manual_intervention): (&[&str], u64, bool) =
        match category {
            ErrorCategory::Transient => (
                &[
                    "Wait for network connectivity to stabilise",
                    "Retry the operation with exponential backoff",
                    "Check the upstream service status page if failures persist",
                ],
                30,
                false,
            ),
            ErrorCategory::RateLimit => (
                &[
                    "Pause outgoing requests until the quota window resets",
                    "Retry with exponential backoff",
                    "Reduce batch sizes or request a higher quota",
                ],
                100,
                false,
            ),
            ErrorCategory::Auth => (
                &[
                    "Verify the configured API credentials",
                    "Refresh or rotate the access token",
                    "Confirm the service account still has the required permissions",
                ],
                300,
                true,
            ),
            ErrorCategory::Data => (
                &[
                    "Inspect the payload for missing or malformed fields",
                    "Serve fallback data for the affected item",
                    "Correct the source record",
                ],
                60,
                false,
            ),
            ErrorCategory::System => (
                &[
                    "Free system resources (memory, disk, file handles)",
                    "Serve cached or default content while degraded",
                    "Restart the affected service",
                ],
                120,
                true,
            ),
            ErrorCategory::Permanent => (
                &[
                    "Confirm the requested resource exists",
                    "Correct the request before resubmitting",
                    "Escalate to the owning team",
                ],
                0,
                true,
            ),
            ErrorCategory::Unknown => (
                &[
                    "Inspect the logs for the affected session",
                    "Escalate to an operator",
                ],
                600,
                true,
            ),
        };

    RecoveryPlan {
        category,
        steps: steps.iter().map(|s| s.to_string()).collect(),
        estimated_recovery_time,
        requires_manual_intervention,
    }
}
