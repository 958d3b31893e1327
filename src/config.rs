//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CADENCE__*` 覆盖（双下划线表示嵌套，如 `CADENCE__LLM__PROVIDER=openai`）。
//! 文件层的配置经 validate() 转成各组件的运行期配置；这是唯一会失败的一步，发生在任何运行开始之前。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::bus::BusConfig;
use crate::core::{ConfigError, PhaseTimeoutConfig, RetryDelay, RetryPolicy};
use crate::cycle::ControllerConfig;
use crate::monitor::MonitorConfig;
use crate::workers::DispatchConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub workers: WorkersSection,
}

/// [controller] 段：迭代上限与近截止告警比例
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_timeout_warning_ratio")]
    pub timeout_warning_ratio: f64,
}

fn default_max_iterations() -> u32 {
    5
}

fn default_timeout_warning_ratio() -> f64 {
    0.8
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            timeout_warning_ratio: default_timeout_warning_ratio(),
        }
    }
}

/// [timeouts] 段：各阶段预算（毫秒）
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_think_ms")]
    pub think_ms: u64,
    #[serde(default = "default_plan_ms")]
    pub plan_ms: u64,
    #[serde(default = "default_act_ms")]
    pub act_ms: u64,
    #[serde(default = "default_next_ms")]
    pub next_ms: u64,
}

fn default_think_ms() -> u64 {
    30_000
}

fn default_plan_ms() -> u64 {
    30_000
}

fn default_act_ms() -> u64 {
    60_000
}

fn default_next_ms() -> u64 {
    15_000
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            think_ms: default_think_ms(),
            plan_ms: default_plan_ms(),
            act_ms: default_act_ms(),
            next_ms: default_next_ms(),
        }
    }
}

/// [retry] 段：Completion Service 调用的重试与退避
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_timeout_ms")]
    pub base_timeout_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_timeout_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    1.5
}

fn default_max_timeout_ms() -> u64 {
    90_000
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_timeout_ms: default_base_timeout_ms(),
            backoff_factor: default_backoff_factor(),
            max_timeout_ms: default_max_timeout_ms(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// [dispatch] 段：Worker 截止时间、重试与并发
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSection {
    #[serde(default = "default_worker_timeout_ms")]
    pub worker_timeout_ms: u64,
    #[serde(default = "default_worker_retries")]
    pub worker_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_group_buffer_ms")]
    pub group_buffer_ms: u64,
    #[serde(default = "default_max_group_timeout_ms")]
    pub max_group_timeout_ms: u64,
    #[serde(default = "default_max_concurrent_workers")]
    pub max_concurrent_workers: usize,
}

fn default_worker_timeout_ms() -> u64 {
    30_000
}

fn default_worker_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_group_buffer_ms() -> u64 {
    10_000
}

fn default_max_group_timeout_ms() -> u64 {
    90_000
}

fn default_max_concurrent_workers() -> usize {
    8
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            worker_timeout_ms: default_worker_timeout_ms(),
            worker_retries: default_worker_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff_factor: default_backoff_factor(),
            group_buffer_ms: default_group_buffer_ms(),
            max_group_timeout_ms: default_max_group_timeout_ms(),
            max_concurrent_workers: default_max_concurrent_workers(),
        }
    }
}

/// [bus] 段：每个频道的队列容量与轮询间隔
#[derive(Debug, Clone, Deserialize)]
pub struct BusSection {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// [monitor] 段：样本缓冲与健康阈值
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSection {
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
    #[serde(default = "default_max_mean_latency_ms")]
    pub max_mean_latency_ms: u64,
    #[serde(default = "default_max_failures")]
    pub max_failures: u64,
}

fn default_history_size() -> usize {
    1000
}

fn default_min_success_rate() -> f64 {
    0.9
}

fn default_max_mean_latency_ms() -> u64 {
    30_000
}

fn default_max_failures() -> u64 {
    10
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            history_size: default_history_size(),
            min_success_rate: default_min_success_rate(),
            max_mean_latency_ms: default_max_mean_latency_ms(),
            max_failures: default_max_failures(),
        }
    }
}

/// [llm] 段：后端选择
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// mock / openai / deepseek；openai 与 deepseek 需要对应的 API Key，否则回退到 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
}

fn default_provider() -> String {
    "mock".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
        }
    }
}

/// [workers] 段：插件目录与内联命令 Worker
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkersSection {
    /// 扫描 *.toml 清单的目录
    pub plugin_dir: Option<PathBuf>,
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
}

/// 单个命令 Worker 的定义（[[workers.plugins]] 或插件目录中的清单）
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PluginEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub timeout_ms: Option<u64>,
}

/// 校验后的运行期配置
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub controller: ControllerConfig,
    pub dispatch: DispatchConfig,
    pub bus: BusConfig,
    pub monitor: MonitorConfig,
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

impl AppConfig {
    /// 转成运行期配置；任何非法值返回 ConfigError
    pub fn validate(&self) -> Result<RuntimeConfig, ConfigError> {
        let r = &self.retry;
        if r.base_delay_ms > r.max_delay_ms {
            return Err(ConfigError::invalid(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                r.base_delay_ms, r.max_delay_ms
            )));
        }
        let retry = RetryPolicy::new(r.max_attempts, ms(r.base_timeout_ms), r.backoff_factor)?
            .with_max_timeout(ms(r.max_timeout_ms))
            .with_delay(RetryDelay::Linear {
                base: ms(r.base_delay_ms),
                max: ms(r.max_delay_ms),
            });

        let t = &self.timeouts;
        let controller = ControllerConfig {
            max_iterations: self.controller.max_iterations,
            timeout_warning_ratio: self.controller.timeout_warning_ratio,
            timeouts: PhaseTimeoutConfig::new(
                ms(t.think_ms),
                ms(t.plan_ms),
                ms(t.act_ms),
                ms(t.next_ms),
            )?,
            retry,
        };
        controller.validate()?;

        let d = &self.dispatch;
        if d.worker_timeout_ms == 0 {
            return Err(ConfigError::invalid("dispatch.worker_timeout_ms must be positive"));
        }
        let dispatch = DispatchConfig {
            worker_timeout: ms(d.worker_timeout_ms),
            worker_retries: d.worker_retries,
            retry_delay: ms(d.retry_delay_ms),
            backoff_factor: d.backoff_factor,
            group_buffer: ms(d.group_buffer_ms),
            max_group_timeout: ms(d.max_group_timeout_ms),
            max_concurrent_workers: d.max_concurrent_workers,
        };
        dispatch.validate()?;

        let bus = BusConfig {
            max_queue_size: self.bus.max_queue_size,
            poll_interval: ms(self.bus.poll_interval_ms),
        };
        bus.validate()?;

        let m = &self.monitor;
        let monitor = MonitorConfig {
            history_size: m.history_size,
            min_success_rate: m.min_success_rate,
            max_mean_latency: ms(m.max_mean_latency_ms),
            max_failures: m.max_failures,
        };
        monitor.validate()?;

        for plugin in &self.workers.plugins {
            if plugin.name.trim().is_empty() || plugin.program.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "workers.plugins entries need a name and a program",
                ));
            }
        }

        Ok(RuntimeConfig {
            controller,
            dispatch,
            bus,
            monitor,
        })
    }
}

/// 从 config 目录加载配置，环境变量 CADENCE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CADENCE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, ConfigError> {
    let mut builder = config::Config::builder();

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
        config::Environment::with_prefix("CADENCE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    Ok(c.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let runtime = AppConfig::default().validate().unwrap();
        assert_eq!(runtime.controller.max_iterations, 5);
        assert_eq!(
            runtime.controller.timeouts.get(crate::core::Phase::Act),
            Duration::from_secs(60)
        );
        assert_eq!(runtime.dispatch.worker_retries, 2);
        assert_eq!(runtime.bus.max_queue_size, 1000);
        assert_eq!(runtime.monitor.min_success_rate, 0.9);
        assert_eq!(runtime.controller.retry.deadline_for(3), Duration::from_millis(67_500));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut cfg = AppConfig::default();
        cfg.controller.max_iterations = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = AppConfig::default();
        cfg.timeouts.plan_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.retry.backoff_factor = 0.5;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.bus.max_queue_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.dispatch.max_concurrent_workers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadence.toml");
        std::fs::write(
            &path,
            r#"
[controller]
max_iterations = 3

[timeouts]
act_ms = 5000

[[workers.plugins]]
name = "weather"
program = "echo"
args = ["{{query}}"]
"#,
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.controller.max_iterations, 3);
        assert_eq!(cfg.timeouts.act_ms, 5000);
        assert_eq!(cfg.timeouts.think_ms, 30_000);
        assert_eq!(cfg.workers.plugins.len(), 1);
        assert_eq!(cfg.workers.plugins[0].args, vec!["{{query}}"]);
        assert!(cfg.validate().is_ok());
    }
}
