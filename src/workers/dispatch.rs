//! 并行分发（fan-out / fan-in）
//!
//! 一个并行组内的每个 Worker 在独立任务中执行，各自经过 TimeoutExecutor 的截止时间与重试；
//! 整组再受一个外层上限约束：`min(group_timeout + group_buffer, max_group_timeout)`。
//! 注册表中不存在的名字、到期仍未返回的任务、panic 的任务都转为合成失败结果，不影响同组其他 Worker。

use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::timeout::wait_cancelled;
use crate::core::{
    CallLabel, ConfigError, RetryDelay, RetryPolicy, ServiceError, TaskScheduler, TimeoutExecutor,
};
use crate::monitor::PerformanceSample;
use crate::workers::{Worker, WorkerRegistry, WorkerResult};

/// 性能监控中 Worker 调用的操作名
pub const WORKER_OPERATION: &str = "worker.execute";

/// 分发参数
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Worker 未声明自身超时时的单次截止时间
    pub worker_timeout: Duration,
    /// 首次之外的额外尝试次数
    pub worker_retries: u32,
    /// 两次尝试之间的固定间隔
    pub retry_delay: Duration,
    /// 截止时间的退避倍数
    pub backoff_factor: f64,
    pub group_buffer: Duration,
    pub max_group_timeout: Duration,
    pub max_concurrent_workers: usize,
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_workers == 0 {
            return Err(ConfigError::invalid(
                "dispatch.max_concurrent_workers must be positive",
            ));
        }
        if self.max_group_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "dispatch.max_group_timeout must be positive",
            ));
        }
        self.policy_for(self.worker_timeout).map(|_| ())
    }

    /// 单个 Worker 的重试策略：尝试 retries + 1 次，截止时间上限为 2 × 基础超时
    pub fn policy_for(&self, base: Duration) -> Result<RetryPolicy, ConfigError> {
        let attempts = self.worker_retries.checked_add(1).ok_or_else(|| {
            ConfigError::invalid(format!(
                "dispatch.worker_retries too large: {}",
                self.worker_retries
            ))
        })?;
        Ok(RetryPolicy::new(attempts, base, self.backoff_factor)?
            .with_max_timeout(base.saturating_mul(2))
            .with_delay(RetryDelay::Fixed(self.retry_delay)))
    }

    /// 整组等待上限
    pub fn group_bound(&self, group_timeout: Duration) -> Duration {
        (group_timeout + self.group_buffer).min(self.max_group_timeout)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_timeout: Duration::from_secs(30),
            worker_retries: 2,
            retry_delay: Duration::from_secs(1),
            backoff_factor: 1.5,
            group_buffer: Duration::from_secs(10),
            max_group_timeout: Duration::from_secs(90),
            max_concurrent_workers: 8,
        }
    }
}

/// 并行分发器：克隆后共享注册表、执行器与并发许可
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<WorkerRegistry>,
    executor: TimeoutExecutor,
    scheduler: TaskScheduler,
    config: DispatchConfig,
    default_policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        executor: TimeoutExecutor,
        config: DispatchConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let default_policy = config.policy_for(config.worker_timeout)?;
        Ok(Self {
            registry,
            executor,
            scheduler: TaskScheduler::new(config.max_concurrent_workers),
            config,
            default_policy,
        })
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn executor(&self) -> &TimeoutExecutor {
        &self.executor
    }

    /// 共享注册表与并发许可，但经由另一个执行器调用 Worker
    pub fn with_executor(&self, executor: TimeoutExecutor) -> Self {
        Self {
            executor,
            ..self.clone()
        }
    }

    fn policy_for(&self, worker: &dyn Worker) -> RetryPolicy {
        match worker.timeout() {
            Some(t) if !t.is_zero() => self
                .config
                .policy_for(t)
                .unwrap_or_else(|_| self.default_policy.clone()),
            _ => self.default_policy.clone(),
        }
    }

    /// 分发一个并行组；每个去重后的名字都会得到一个结果
    ///
    /// sub_queries 中没有的名字使用上下文中的 `last_query`。
    pub async fn dispatch(
        &self,
        names: &[String],
        sub_queries: &BTreeMap<String, String>,
        context: &Map<String, Value>,
        group_timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> BTreeMap<String, WorkerResult> {
        let bound = self.config.group_bound(group_timeout);
        let deadline = tokio::time::Instant::now() + bound;
        let snapshot = Arc::new(context.clone());
        let fallback_query = context
            .get("last_query")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut results = BTreeMap::new();
        let mut pending = BTreeSet::new();
        let mut tasks = JoinSet::new();

        for name in names {
            if results.contains_key(name) || pending.contains(name) {
                continue;
            }
            let Some(worker) = self.registry.get(name) else {
                tracing::warn!(worker = %name, "worker not registered");
                let result = WorkerResult::not_found(name.clone());
                audit(&result, "not_found");
                results.insert(name.clone(), result);
                continue;
            };
            let query = sub_queries
                .get(name)
                .cloned()
                .unwrap_or_else(|| fallback_query.clone());
            let policy = self.policy_for(worker.as_ref());
            pending.insert(name.clone());
            tasks.spawn(self.clone().run_worker(
                name.clone(),
                worker,
                query,
                Arc::clone(&snapshot),
                policy,
                cancel.cloned(),
            ));
        }

        let mut cancelled = false;
        while !pending.is_empty() {
            let joined = tokio::select! {
                biased;
                _ = wait_cancelled(cancel) => {
                    cancelled = true;
                    break;
                }
                joined = tokio::time::timeout_at(deadline, tasks.join_next()) => joined,
            };
            match joined {
                Ok(Some(Ok((name, result)))) => {
                    pending.remove(&name);
                    results.insert(name, result);
                }
                Ok(Some(Err(join_err))) => {
                    tracing::error!(error = %join_err, "worker task aborted");
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        bound_ms = bound.as_millis() as u64,
                        outstanding = pending.len(),
                        "group bound elapsed, abandoning workers"
                    );
                    break;
                }
            }
        }
        tasks.abort_all();

        for name in pending {
            let result = if cancelled {
                WorkerResult::failed(name.clone(), &ServiceError::Cancelled)
            } else {
                self.executor.monitor().record_timeout(WORKER_OPERATION, Some(&name));
                WorkerResult::timeout(name.clone(), bound).with_stats(0, true, bound)
            };
            audit(&result, if cancelled { "cancelled" } else { "abandoned" });
            results.insert(name, result);
        }
        results
    }

    async fn run_worker(
        self,
        name: String,
        worker: Arc<dyn Worker>,
        query: String,
        context: Arc<Map<String, Value>>,
        policy: RetryPolicy,
        cancel: Option<CancellationToken>,
    ) -> (String, WorkerResult) {
        let _permit = self.scheduler.acquire().await;
        let monitor = Arc::clone(self.executor.monitor());
        let _active = monitor.track();
        let label = CallLabel::worker(WORKER_OPERATION, &name);
        let start = Instant::now();

        let call = self.executor.execute(&label, &policy, cancel.as_ref(), |_attempt| {
            let worker = Arc::clone(&worker);
            let query = query.clone();
            let context = Arc::clone(&context);
            async move { worker.execute(&query, &context).await }
        });

        let (result, outcome) = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(done)) => {
                let mut result = done.value;
                result.worker = name.clone();
                result.confidence = crate::workers::result::clamp_confidence(result.confidence);
                (
                    result.with_stats(done.attempts, done.timed_out, start.elapsed()),
                    "ok",
                )
            }
            Ok(Err(failure)) => {
                let outcome = if failure.error.is_timeout() {
                    "timeout"
                } else {
                    "error"
                };
                (
                    WorkerResult::failed(name.clone(), &failure.error).with_stats(
                        failure.attempts,
                        failure.timed_out,
                        start.elapsed(),
                    ),
                    outcome,
                )
            }
            Err(_) => {
                monitor.record(PerformanceSample::new(
                    WORKER_OPERATION,
                    Some(&name),
                    false,
                    start.elapsed(),
                ));
                let err = ServiceError::Permanent("worker panicked".to_string());
                (
                    WorkerResult::failed(name.clone(), &err).with_stats(1, false, start.elapsed()),
                    "panic",
                )
            }
        };
        audit(&result, outcome);
        (name, result)
    }
}

/// 每次 Worker 调用一条 JSON 审计日志
fn audit(result: &WorkerResult, outcome: &str) {
    let record = serde_json::json!({
        "event": "worker_audit",
        "worker": result.worker,
        "ok": result.is_success(),
        "outcome": outcome,
        "duration_ms": result.duration_ms,
        "attempts": result.attempts,
    });
    tracing::info!(audit = %record, "worker");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::monitor::PerformanceMonitor;

    struct Fixed {
        name: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl Worker for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(
            &self,
            query: &str,
            _context: &Map<String, Value>,
        ) -> Result<WorkerResult, ServiceError> {
            tokio::time::sleep(self.delay).await;
            let mut payload = Map::new();
            payload.insert("query".into(), json!(query));
            Ok(WorkerResult::success("ignored", payload, 0.8))
        }
    }

    struct Flaky {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Worker for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn execute(
            &self,
            _query: &str,
            _context: &Map<String, Value>,
        ) -> Result<WorkerResult, ServiceError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ServiceError::Transient("first call fails".into()))
            } else {
                Ok(WorkerResult::success("flaky", Map::new(), 0.5))
            }
        }
    }

    struct Panics;

    #[async_trait]
    impl Worker for Panics {
        fn name(&self) -> &str {
            "panics"
        }

        async fn execute(
            &self,
            _query: &str,
            _context: &Map<String, Value>,
        ) -> Result<WorkerResult, ServiceError> {
            panic!("boom");
        }
    }

    fn config() -> DispatchConfig {
        DispatchConfig {
            worker_timeout: Duration::from_millis(40),
            worker_retries: 1,
            retry_delay: Duration::from_millis(1),
            backoff_factor: 1.5,
            group_buffer: Duration::from_millis(30),
            max_group_timeout: Duration::from_secs(5),
            max_concurrent_workers: 4,
        }
    }

    fn dispatcher(registry: WorkerRegistry) -> Dispatcher {
        let monitor = Arc::new(PerformanceMonitor::default());
        Dispatcher::new(Arc::new(registry), TimeoutExecutor::new(monitor), config()).unwrap()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_missing_worker_does_not_block_siblings() {
        let registry = WorkerRegistry::new();
        registry.register(Fixed {
            name: "weather",
            delay: Duration::ZERO,
        });
        let d = dispatcher(registry);
        let mut subs = BTreeMap::new();
        subs.insert("weather".to_string(), "paris weather".to_string());

        let results = d
            .dispatch(
                &names(&["weather", "budget"]),
                &subs,
                &Map::new(),
                Duration::from_millis(100),
                None,
            )
            .await;
        assert_eq!(results.len(), 2);
        let weather = &results["weather"];
        assert!(weather.is_success());
        assert_eq!(weather.worker, "weather");
        assert_eq!(weather.payload["query"], json!("paris weather"));
        assert_eq!(results["budget"].error.as_deref(), Some("not found"));
    }

    #[tokio::test]
    async fn test_retry_is_counted() {
        let registry = WorkerRegistry::new();
        registry.register(Flaky {
            calls: AtomicU32::new(0),
        });
        let d = dispatcher(registry);
        let results = d
            .dispatch(
                &names(&["flaky"]),
                &BTreeMap::new(),
                &Map::new(),
                Duration::from_millis(200),
                None,
            )
            .await;
        let r = &results["flaky"];
        assert!(r.is_success());
        assert_eq!(r.attempts, 2);
        let stats = d.executor.monitor().worker_stats("flaky").unwrap();
        assert_eq!(stats.retries, 1);
    }

    #[tokio::test]
    async fn test_all_timeouts_return_within_bound() {
        let registry = WorkerRegistry::new();
        for name in ["a", "b", "c"] {
            registry.register(Fixed {
                name,
                delay: Duration::from_secs(10),
            });
        }
        let d = dispatcher(registry);
        let group_timeout = Duration::from_millis(60);
        let start = Instant::now();
        let results = d
            .dispatch(
                &names(&["a", "b", "c"]),
                &BTreeMap::new(),
                &Map::new(),
                group_timeout,
                None,
            )
            .await;
        let bound = group_timeout + config().group_buffer;
        assert!(start.elapsed() < bound + Duration::from_millis(200));
        assert_eq!(results.len(), 3);
        assert!(results.values().all(|r| r.timed_out && !r.is_success()));
    }

    #[tokio::test]
    async fn test_panicking_worker_becomes_failure() {
        let registry = WorkerRegistry::new();
        registry.register(Panics);
        registry.register(Fixed {
            name: "ok",
            delay: Duration::ZERO,
        });
        let d = dispatcher(registry);
        let results = d
            .dispatch(
                &names(&["panics", "ok"]),
                &BTreeMap::new(),
                &Map::new(),
                Duration::from_millis(100),
                None,
            )
            .await;
        assert_eq!(
            results["panics"].error.as_deref(),
            Some("permanent service error: worker panicked")
        );
        assert!(results["ok"].is_success());
    }

    #[tokio::test]
    async fn test_duplicate_names_dispatch_once() {
        let registry = WorkerRegistry::new();
        registry.register(Fixed {
            name: "w",
            delay: Duration::ZERO,
        });
        let d = dispatcher(registry);
        let results = d
            .dispatch(
                &names(&["w", "w"]),
                &BTreeMap::new(),
                &Map::new(),
                Duration::from_millis(100),
                None,
            )
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(d.executor.monitor().worker_stats("w").unwrap().total, 1);
    }

    #[test]
    fn test_group_bound_is_capped() {
        let cfg = DispatchConfig::default();
        assert_eq!(cfg.group_bound(Duration::from_secs(60)), Duration::from_secs(70));
        assert_eq!(cfg.group_bound(Duration::from_secs(120)), Duration::from_secs(90));
    }

    #[test]
    fn test_max_worker_retries_is_rejected() {
        let cfg = DispatchConfig {
            worker_retries: u32::MAX,
            ..DispatchConfig::default()
        };
        assert!(cfg.validate().is_err());
        assert!(cfg.policy_for(Duration::from_secs(1)).is_err());
        let monitor = Arc::new(PerformanceMonitor::default());
        let built = Dispatcher::new(
            Arc::new(WorkerRegistry::new()),
            TimeoutExecutor::new(monitor),
            cfg,
        );
        assert!(built.is_err());
    }

    #[tokio::test]
    async fn test_with_executor_records_into_new_monitor() {
        let registry = WorkerRegistry::new();
        registry.register(Fixed {
            name: "w",
            delay: Duration::ZERO,
        });
        let d = dispatcher(registry);
        let scoped = PerformanceMonitor::scoped(d.executor.monitor());
        let run = d.with_executor(d.executor.with_monitor(Arc::clone(&scoped)));
        run.dispatch(
            &names(&["w"]),
            &BTreeMap::new(),
            &Map::new(),
            Duration::from_millis(100),
            None,
        )
        .await;
        assert_eq!(scoped.worker_stats("w").unwrap().total, 1);
        assert_eq!(d.executor.monitor().worker_stats("w").unwrap().total, 1);
        assert_eq!(run.scheduler.capacity(), d.scheduler.capacity());
    }
}
