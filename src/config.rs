//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ADVISOR__*` 覆盖（双下划线表示嵌套，如 `ADVISOR__RECOVERY__MAX_RETRIES=5`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub recovery: RecoverySection,
    pub orchestrator: OrchestratorSection,
    pub rate_limits: RateLimitsSection,
    pub agents: AgentsSection,
}

/// [recovery] 段：领域错误的重试退避与熔断
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// 累计失败多少次后打开熔断
    pub circuit_failure_threshold: u32,
    /// 熔断打开时长（毫秒）
    pub circuit_open_ms: u64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            circuit_failure_threshold: 5,
            circuit_open_ms: 60_000,
        }
    }
}

/// [orchestrator] 段：子 Agent 分发失败的重试（纯指数退避，无抖动）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// 每个 Agent 保留的最近信封数
    pub history_limit: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            history_limit: 50,
        }
    }
}

/// 单个令牌桶：capacity 个请求 / window_ms
///
/// 缺省字段取读配额的默认值；经 load_config 加载时写桶缺省字段取写配额默认值。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BucketSection {
    pub capacity: u32,
    pub window_ms: u64,
}

impl Default for BucketSection {
    fn default() -> Self {
        RateLimitsSection::default().read
    }
}

impl BucketSection {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// [rate_limits] 段：读配额（共享桶）与写配额（写专用桶）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitsSection {
    pub read: BucketSection,
    pub write: BucketSection,
}

impl Default for RateLimitsSection {
    fn default() -> Self {
        Self {
            read: BucketSection {
                capacity: 90,
                window_ms: 100_000,
            },
            write: BucketSection {
                capacity: 30,
                window_ms: 100_000,
            },
        }
    }
}

/// [agents] 段：子 Agent 的评分契约阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentsSection {
    /// 策划 Agent 默认生成的选题数
    pub topic_count: usize,
    /// 疲劳分 > 该值视为疲劳（0-100）
    pub max_fatigue_score: u8,
    /// 合规分 >= 该值视为合规（0-100）
    pub min_compliance_score: u8,
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            topic_count: 5,
            max_fatigue_score: 70,
            min_compliance_score: 80,
        }
    }
}

/// 从 config 目录加载配置，环境变量 ADVISOR__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ADVISOR__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    // 令牌桶按字段合并：只覆盖 capacity 或 window_ms 时另一项保持各自桶的默认值
    let limits = RateLimitsSection::default();
    let mut builder = config::Config::builder();
    for (name, bucket) in [("read", limits.read), ("write", limits.write)] {
        builder = builder
            .set_default(format!("rate_limits.{name}.capacity"), i64::from(bucket.capacity))?
            .set_default(
                format!("rate_limits.{name}.window_ms"),
                i64::try_from(bucket.window_ms).unwrap_or(i64::MAX),
            )?;
    }

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ADVISOR")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.recovery.max_retries, 3);
        assert_eq!(cfg.recovery.initial_delay_ms, 1000);
        assert_eq!(cfg.recovery.max_delay_ms, 30_000);
        assert_eq!(cfg.orchestrator.retry_delay_ms, 1000);
        assert_eq!(cfg.rate_limits.read.capacity, 90);
        assert_eq!(cfg.rate_limits.write.capacity, 30);
        assert_eq!(cfg.rate_limits.write.window(), Duration::from_secs(100));
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[recovery]\nmax_retries = 7\n\n[rate_limits.write]\ncapacity = 10\nwindow_ms = 5000"
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.recovery.max_retries, 7);
        assert_eq!(cfg.recovery.backoff_multiplier, 2.0);
        assert_eq!(cfg.rate_limits.write.capacity, 10);
        assert_eq!(cfg.rate_limits.read.capacity, 90);
        assert_eq!(cfg.agents.min_compliance_score, 80);
    }

    #[test]
    fn test_partial_bucket_override_keeps_bucket_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[rate_limits.write]\ncapacity = 10\n\n[rate_limits.read]\nwindow_ms = 5000").unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.rate_limits.write.capacity, 10);
        assert_eq!(cfg.rate_limits.write.window_ms, 100_000);
        assert_eq!(cfg.rate_limits.read.capacity, 90);
        assert_eq!(cfg.rate_limits.read.window_ms, 5000);

        // 不经过 load_config 的反序列化同样按字段补默认值
        let bucket: BucketSection = serde_json::from_str(r#"{"capacity": 10}"#).unwrap();
        assert_eq!(bucket.window_ms, 100_000);
    }
}
