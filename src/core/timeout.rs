//! 超时与重试执行器
//!
//! 对任意异步调用施加截止时间、有限次数重试与指数退避：
//! 第 n 次尝试的截止时间为 `base_timeout * backoff_factor^(n-1)`，并被 max_timeout 封顶。
//! 是否重试由 RecoveryEngine 根据错误类别决定；成功与最终失败都写入 PerformanceMonitor。

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::{ConfigError, RecoveryAction, RecoveryEngine, ServiceError};
use crate::monitor::{PerformanceMonitor, PerformanceSample};

/// 非限流重试前的等待策略
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDelay {
    /// 固定间隔（Worker 分发使用）
    Fixed(Duration),
    /// `base * attempt`，不超过 max
    Linear { base: Duration, max: Duration },
}

/// 重试策略；构造时校验，运行期不会再产生配置错误
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_timeout: Duration,
    backoff_factor: f64,
    max_timeout: Duration,
    delay: RetryDelay,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_timeout: Duration,
        backoff_factor: f64,
    ) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be at least 1"));
        }
        if base_timeout.is_zero() {
            return Err(ConfigError::invalid("base_timeout must be positive"));
        }
        if !backoff_factor.is_finite() || backoff_factor < 1.0 {
            return Err(ConfigError::invalid(format!(
                "backoff_factor must be >= 1, got {}",
                backoff_factor
            )));
        }
        Ok(Self {
            max_attempts,
            base_timeout,
            backoff_factor,
            max_timeout: base_timeout,
            delay: RetryDelay::Linear {
                base: Duration::from_secs(1),
                max: Duration::from_secs(10),
            },
        })
    }

    /// 截止时间上限；小于 base_timeout 时按 base_timeout 处理
    pub fn with_max_timeout(mut self, max_timeout: Duration) -> Self {
        self.max_timeout = max_timeout.max(self.base_timeout);
        self
    }

    pub fn with_delay(mut self, delay: RetryDelay) -> Self {
        self.delay = delay;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_timeout(&self) -> Duration {
        self.base_timeout
    }

    pub fn max_timeout(&self) -> Duration {
        self.max_timeout
    }

    /// 第 attempt 次（从 1 开始）尝试的截止时间
    pub fn deadline_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let nanos = self.base_timeout.as_nanos() as f64 * self.backoff_factor.powi(exp);
        if !nanos.is_finite() || nanos >= self.max_timeout.as_nanos() as f64 {
            return self.max_timeout;
        }
        Duration::from_nanos(nanos.round() as u64)
    }

    /// 第 attempt 次失败后、下一次尝试前的等待
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.delay {
            RetryDelay::Fixed(d) => d,
            RetryDelay::Linear { base, max } => base.saturating_mul(attempt).min(max),
        }
    }

    /// 限流冷却：`base_delay * attempt * 2`
    pub fn cooldown_after(&self, attempt: u32) -> Duration {
        let base = match self.delay {
            RetryDelay::Fixed(d) => d,
            RetryDelay::Linear { base, .. } => base,
        };
        base.saturating_mul(attempt.saturating_mul(2))
    }

    /// 把截止时间收紧到 budget 之内（阶段预算小于策略基础超时时使用）
    pub fn within(&self, budget: Duration) -> RetryPolicy {
        let budget = if budget.is_zero() { self.base_timeout } else { budget };
        let mut scoped = self.clone();
        scoped.base_timeout = self.base_timeout.min(budget);
        scoped.max_timeout = self.max_timeout.min(budget).max(scoped.base_timeout);
        scoped
    }

    /// 单次调用的最坏耗时（所有尝试都超时、每次都等待）
    pub fn worst_case(&self) -> Duration {
        (1..=self.max_attempts)
            .map(|a| self.deadline_for(a) + self.delay_after(a).max(self.cooldown_after(a)))
            .sum()
    }
}

impl Default for RetryPolicy {
    /// 3 次尝试，30s 起步，1.5 倍退避，上限 90s，间隔 1s 线性增长至 10s
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_timeout: Duration::from_secs(30),
            backoff_factor: 1.5,
            max_timeout: Duration::from_secs(90),
            delay: RetryDelay::Linear {
                base: Duration::from_secs(1),
                max: Duration::from_secs(10),
            },
        }
    }
}

/// 本次尝试的上下文，传给被包装的操作
#[derive(Debug, Clone, Copy)]
pub struct Attempt {
    pub number: u32,
    pub deadline: Duration,
}

/// 性能监控中的调用标识
#[derive(Debug, Clone)]
pub struct CallLabel {
    pub operation: String,
    pub worker: Option<String>,
}

impl CallLabel {
    pub fn operation(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            worker: None,
        }
    }

    pub fn worker(operation: impl Into<String>, worker: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            worker: Some(worker.into()),
        }
    }
}

/// 成功（或降级）结果与尝试统计
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub attempts: u32,
    pub retries: u32,
    /// 是否有任一尝试超时
    pub timed_out: bool,
    pub elapsed: Duration,
    /// 降级时记录导致降级的错误；真实成功为 None
    pub fallback_reason: Option<ServiceError>,
}

impl<T> RetryOutcome<T> {
    pub fn is_degraded(&self) -> bool {
        self.fallback_reason.is_some()
    }
}

/// 所有尝试用尽或遇到不可重试错误
#[derive(Error, Debug, Clone)]
#[error("{error} after {attempts} attempt(s)")]
pub struct RetryFailure {
    pub error: ServiceError,
    pub attempts: u32,
    pub retries: u32,
    pub timed_out: bool,
    pub elapsed: Duration,
}

/// 超时重试执行器：可克隆，内部共享 PerformanceMonitor
#[derive(Clone)]
pub struct TimeoutExecutor {
    monitor: Arc<PerformanceMonitor>,
    recovery: RecoveryEngine,
}

impl TimeoutExecutor {
    pub fn new(monitor: Arc<PerformanceMonitor>) -> Self {
        Self {
            monitor,
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    /// 相同的恢复策略，计数写入另一个监控
    pub fn with_monitor(&self, monitor: Arc<PerformanceMonitor>) -> Self {
        Self {
            monitor,
            recovery: self.recovery,
        }
    }

    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }

    /// 执行 operation；每次尝试都会拿到本次的截止时间
    pub async fn execute<T, F, Fut>(
        &self,
        label: &CallLabel,
        policy: &RetryPolicy,
        cancel: Option<&CancellationToken>,
        mut operation: F,
    ) -> Result<RetryOutcome<T>, RetryFailure>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let start = Instant::now();
        let worker = label.worker.as_deref();
        let mut retries = 0u32;
        let mut timed_out = false;
        let mut attempt = 1u32;

        loop {
            let deadline = policy.deadline_for(attempt);
            tracing::debug!(
                operation = %label.operation,
                worker = worker.unwrap_or("-"),
                attempt,
                max_attempts = policy.max_attempts(),
                deadline_ms = deadline.as_millis() as u64,
                "attempt"
            );

            let call = operation(Attempt {
                number: attempt,
                deadline,
            });
            let result = tokio::select! {
                biased;
                _ = wait_cancelled(cancel) => Err(ServiceError::Cancelled),
                r = tokio::time::timeout(deadline, call) => {
                    match r {
                        Ok(inner) => inner,
                        Err(_) => Err(ServiceError::Timeout(deadline)),
                    }
                }
            };

            let err = match result {
                Ok(value) => {
                    let elapsed = start.elapsed();
                    self.monitor.record(PerformanceSample::new(
                        &label.operation,
                        worker,
                        true,
                        elapsed,
                    ));
                    return Ok(RetryOutcome {
                        value,
                        attempts: attempt,
                        retries,
                        timed_out,
                        elapsed,
                        fallback_reason: None,
                    });
                }
                Err(ServiceError::Cancelled) => {
                    return Err(RetryFailure {
                        error: ServiceError::Cancelled,
                        attempts: attempt,
                        retries,
                        timed_out,
                        elapsed: start.elapsed(),
                    });
                }
                Err(e) => e,
            };

            if err.is_timeout() {
                timed_out = true;
                self.monitor.record_timeout(&label.operation, worker);
                tracing::warn!(
                    operation = %label.operation,
                    worker = worker.unwrap_or("-"),
                    attempt,
                    deadline_ms = deadline.as_millis() as u64,
                    "deadline exceeded"
                );
            }

            let wait = match self.recovery.decide(&err, attempt, policy) {
                RecoveryAction::Retry { delay } => {
                    tracing::info!(
                        operation = %label.operation,
                        worker = worker.unwrap_or("-"),
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "retrying"
                    );
                    delay
                }
                RecoveryAction::Cooldown { wait } => {
                    tracing::warn!(
                        operation = %label.operation,
                        worker = worker.unwrap_or("-"),
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "rate limited, cooling down"
                    );
                    wait
                }
                RecoveryAction::Abort => {
                    let elapsed = start.elapsed();
                    self.monitor.record(PerformanceSample::new(
                        &label.operation,
                        worker,
                        false,
                        elapsed,
                    ));
                    tracing::error!(
                        operation = %label.operation,
                        worker = worker.unwrap_or("-"),
                        attempts = attempt,
                        retries,
                        error = %err,
                        "final failure"
                    );
                    return Err(RetryFailure {
                        error: err,
                        attempts: attempt,
                        retries,
                        timed_out,
                        elapsed,
                    });
                }
            };

            retries += 1;
            self.monitor.record_retry(&label.operation, worker);

            let cancelled = tokio::select! {
                biased;
                _ = wait_cancelled(cancel) => true,
                _ = tokio::time::sleep(wait) => false,
            };
            if cancelled {
                return Err(RetryFailure {
                    error: ServiceError::Cancelled,
                    attempts: attempt,
                    retries,
                    timed_out,
                    elapsed: start.elapsed(),
                });
            }
            attempt += 1;
        }
    }

    /// 与 execute 相同，但在失败时返回调用方提供的安全默认值（取消除外）
    pub async fn execute_or<T, F, Fut, D>(
        &self,
        label: &CallLabel,
        policy: &RetryPolicy,
        cancel: Option<&CancellationToken>,
        operation: F,
        fallback: D,
    ) -> Result<RetryOutcome<T>, RetryFailure>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
        D: FnOnce() -> T,
    {
        match self.execute(label, policy, cancel, operation).await {
            Ok(outcome) => Ok(outcome),
            Err(failure) if matches!(failure.error, ServiceError::Cancelled) => Err(failure),
            Err(failure) => {
                tracing::warn!(
                    operation = %label.operation,
                    error = %failure.error,
                    "using fallback value"
                );
                Ok(RetryOutcome {
                    value: fallback(),
                    attempts: failure.attempts,
                    retries: failure.retries,
                    timed_out: failure.timed_out,
                    elapsed: failure.elapsed,
                    fallback_reason: Some(failure.error),
                })
            }
        }
    }
}

/// 等待取消；没有 token 时永不完成
pub(crate) async fn wait_cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::monitor::MonitorConfig;

    fn executor() -> TimeoutExecutor {
        TimeoutExecutor::new(Arc::new(PerformanceMonitor::new(MonitorConfig::default())))
    }

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(50), 2.0)
            .unwrap()
            .with_max_timeout(Duration::from_millis(150))
            .with_delay(RetryDelay::Fixed(Duration::from_millis(1)))
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::new(0, Duration::from_secs(1), 1.5).is_err());
        assert!(RetryPolicy::new(1, Duration::ZERO, 1.5).is_err());
        assert!(RetryPolicy::new(1, Duration::from_secs(1), 0.5).is_err());
        assert!(RetryPolicy::new(1, Duration::from_secs(1), f64::NAN).is_err());
    }

    #[test]
    fn test_deadline_escalates_and_caps() {
        let p = fast_policy(4);
        assert_eq!(p.deadline_for(1), Duration::from_millis(50));
        assert_eq!(p.deadline_for(2), Duration::from_millis(100));
        assert_eq!(p.deadline_for(3), Duration::from_millis(150));
        assert_eq!(p.deadline_for(4), Duration::from_millis(150));
    }

    #[test]
    fn test_within_clamps_to_budget() {
        let p = RetryPolicy::default().within(Duration::from_millis(20));
        assert_eq!(p.deadline_for(1), Duration::from_millis(20));
        assert_eq!(p.deadline_for(3), Duration::from_millis(20));
        assert_eq!(p.max_attempts(), 3);

        let wide = RetryPolicy::default().within(Duration::from_secs(60));
        assert_eq!(wide.deadline_for(1), Duration::from_secs(30));
        assert_eq!(wide.deadline_for(3), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_transient_then_success_reports_two_retries() {
        let exec = executor();
        let calls = AtomicU32::new(0);
        let label = CallLabel::operation("stub");
        let outcome = exec
            .execute(&label, &fast_policy(3), None, |_attempt| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(ServiceError::Transient(format!("flaky {}", n)))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(outcome.value, "done");
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.retries, 2);
        assert!(!outcome.timed_out);
        assert_eq!(exec.monitor().operation_stats("stub").unwrap().retries, 2);
    }

    #[tokio::test]
    async fn test_timeouts_exhaust_budget() {
        let exec = executor();
        let label = CallLabel::operation("slow");
        let failure = exec
            .execute(&label, &fast_policy(2), None, |_attempt| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, ServiceError>(())
            })
            .await
            .unwrap_err();
        assert!(failure.error.is_timeout());
        assert_eq!(failure.attempts, 2);
        assert_eq!(failure.retries, 1);
        assert!(failure.timed_out);
        let stats = exec.monitor().operation_stats("slow").unwrap();
        assert_eq!(stats.timed_out, 2);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_permanent_is_not_retried() {
        let exec = executor();
        let calls = AtomicU32::new(0);
        let failure = exec
            .execute(&CallLabel::operation("p"), &fast_policy(3), None, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ServiceError::Permanent("400".into())) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.retries, 0);
    }

    #[tokio::test]
    async fn test_execute_or_falls_back() {
        let exec = executor();
        let outcome = exec
            .execute_or(
                &CallLabel::operation("fb"),
                &fast_policy(1),
                None,
                |_| async { Err::<u32, _>(ServiceError::Transient("down".into())) },
                || 7,
            )
            .await
            .unwrap();
        assert_eq!(outcome.value, 7);
        assert!(outcome.is_degraded());
    }

    #[tokio::test]
    async fn test_cancel_stops_immediately() {
        let exec = executor();
        let token = CancellationToken::new();
        token.cancel();
        let failure = exec
            .execute(&CallLabel::operation("c"), &fast_policy(3), Some(&token), |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, ServiceError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(failure.error, ServiceError::Cancelled);
    }

    #[tokio::test]
    async fn test_attempt_receives_escalating_deadline() {
        let exec = executor();
        let seen = std::sync::Mutex::new(Vec::new());
        let _ = exec
            .execute(&CallLabel::operation("d"), &fast_policy(3), None, |attempt| {
                seen.lock().unwrap().push(attempt.deadline);
                async { Err::<(), _>(ServiceError::Transient("x".into())) }
            })
            .await;
        let seen = seen.into_inner().unwrap();
        assert_eq!(
            seen,
            vec![
                Duration::from_millis(50),
                Duration::from_millis(100),
                Duration::from_millis(150)
            ]
        );
    }
}
