//! 性能监控
//!
//! 按操作名与 Worker 名聚合调用次数、成功/失败/超时/重试计数与耗时；
//! 同时保留一个有界的样本环形缓冲区，用于 p95 / p99 等延迟统计。
//! 所有计数由一把 Mutex 保护，临界区只做整数累加，读者持锁时间极短。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::ConfigError;

/// 监控阈值与缓冲区大小
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub history_size: usize,
    pub min_success_rate: f64,
    pub max_mean_latency: Duration,
    pub max_failures: u64,
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_size == 0 {
            return Err(ConfigError::invalid("monitor.history_size must be positive"));
        }
        if !(0.0..=1.0).contains(&self.min_success_rate) {
            return Err(ConfigError::invalid(
                "monitor.min_success_rate must be within [0, 1]",
            ));
        }
        Ok(())
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            history_size: 1000,
            min_success_rate: 0.9,
            max_mean_latency: Duration::from_secs(30),
            max_failures: 10,
        }
    }
}

/// 单次调用样本（只写，不修改）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub operation: String,
    pub worker: Option<String>,
    pub success: bool,
    pub duration_ms: u64,
    /// Unix 毫秒
    pub timestamp: i64,
}

impl PerformanceSample {
    pub fn new(operation: &str, worker: Option<&str>, success: bool, duration: Duration) -> Self {
        Self {
            operation: operation.to_string(),
            worker: worker.map(str::to_string),
            success,
            duration_ms: duration.as_millis() as u64,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 聚合计数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    /// 超时的尝试次数（一次调用可能包含多次超时尝试）
    pub timed_out: u64,
    pub retries: u64,
    pub total_duration_ms: u64,
    pub min_duration_ms: Option<u64>,
    pub max_duration_ms: Option<u64>,
    pub last_duration_ms: Option<u64>,
}

impl CallStats {
    fn observe(&mut self, success: bool, duration_ms: u64) {
        self.total += 1;
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        self.total_duration_ms += duration_ms;
        let min = self.min_duration_ms.map_or(duration_ms, |m| m.min(duration_ms));
        let max = self.max_duration_ms.map_or(duration_ms, |m| m.max(duration_ms));
        self.min_duration_ms = Some(min);
        self.max_duration_ms = Some(max);
        self.last_duration_ms = Some(duration_ms);
    }

    fn absorb(&mut self, other: &CallStats) {
        self.total += other.total;
        self.successful += other.successful;
        self.failed += other.failed;
        self.timed_out += other.timed_out;
        self.retries += other.retries;
        self.total_duration_ms += other.total_duration_ms;
        self.min_duration_ms = match (self.min_duration_ms, other.min_duration_ms) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_duration_ms = match (self.max_duration_ms, other.max_duration_ms) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    /// 没有调用时视为 1.0
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.successful as f64 / self.total as f64
        }
    }

    pub fn mean_duration_ms(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.total as f64
        }
    }
}

/// 延迟分布（基于环形缓冲区中的样本）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyStatistics {
    pub count: usize,
    pub mean_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub success_rate: f64,
    pub mean_latency_ms: f64,
    pub failed: u64,
    /// Degraded 时的原因
    pub reasons: Vec<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// 某一时刻的完整计数快照
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorSnapshot {
    pub operations: BTreeMap<String, CallStats>,
    pub workers: BTreeMap<String, CallStats>,
    pub active_workers: usize,
    pub max_concurrent_workers: usize,
    pub buffered_samples: usize,
    pub taken_at: i64,
}

impl MonitorSnapshot {
    /// 所有操作的合计
    pub fn overall(&self) -> CallStats {
        let mut total = CallStats::default();
        for stats in self.operations.values() {
            total.absorb(stats);
        }
        total
    }

    /// 相对于更早快照的增量，用作单次运行的性能摘要
    pub fn delta_since(&self, earlier: &MonitorSnapshot) -> RunPerformance {
        let mut perf = RunPerformance::default();
        for (op, after) in &self.operations {
            let before = earlier.operations.get(op).cloned().unwrap_or_default();
            let calls = after.total.saturating_sub(before.total);
            perf.calls += calls;
            perf.failures += after.failed.saturating_sub(before.failed);
            perf.timeouts += after.timed_out.saturating_sub(before.timed_out);
            perf.retries += after.retries.saturating_sub(before.retries);
            if let Some(phase) = op.strip_prefix("phase.") {
                if calls > 0 {
                    let ms = after.total_duration_ms.saturating_sub(before.total_duration_ms);
                    perf.phase_mean_ms
                        .insert(phase.to_string(), ms as f64 / calls as f64);
                }
            }
        }
        perf
    }

    /// 快照中全部计数构成的运行摘要；用于只服务一次运行的监控
    pub fn performance(&self) -> RunPerformance {
        self.delta_since(&MonitorSnapshot::default())
    }
}

/// 单次运行的性能摘要（RunResult.performance）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunPerformance {
    pub calls: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub phase_mean_ms: BTreeMap<String, f64>,
}

/// 健康判断 + 总体指标 + 各 Worker 表现
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub health: HealthReport,
    pub overall: CallStats,
    pub operations: BTreeMap<String, CallStats>,
    pub workers: BTreeMap<String, CallStats>,
    pub max_concurrent_workers: usize,
    pub generated_at: i64,
}

#[derive(Default)]
struct MonitorState {
    operations: HashMap<String, CallStats>,
    workers: HashMap<String, CallStats>,
    samples: VecDeque<PerformanceSample>,
    active: usize,
    max_concurrent: usize,
}

/// 线程安全的性能监控；通常以 Arc 共享
///
/// scoped 监控只统计自己收到的调用，同时把每次写入转发给上级监控。
pub struct PerformanceMonitor {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    parent: Option<Arc<PerformanceMonitor>>,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MonitorState::default()),
            parent: None,
        }
    }

    /// 以 parent 的配置新建一个子监控；写入同时累加到 parent
    pub fn scoped(parent: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            config: parent.config.clone(),
            state: Mutex::new(MonitorState::default()),
            parent: Some(Arc::clone(parent)),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 写入一次调用结果
    pub fn record(&self, sample: PerformanceSample) {
        if let Some(parent) = &self.parent {
            parent.record(sample.clone());
        }
        let mut state = self.lock();
        state
            .operations
            .entry(sample.operation.clone())
            .or_default()
            .observe(sample.success, sample.duration_ms);
        if let Some(worker) = &sample.worker {
            state
                .workers
                .entry(worker.clone())
                .or_default()
                .observe(sample.success, sample.duration_ms);
        }
        if state.samples.len() >= self.config.history_size {
            state.samples.pop_front();
        }
        state.samples.push_back(sample);
    }

    pub fn record_retry(&self, operation: &str, worker: Option<&str>) {
        if let Some(parent) = &self.parent {
            parent.record_retry(operation, worker);
        }
        let mut state = self.lock();
        state.operations.entry(operation.to_string()).or_default().retries += 1;
        if let Some(worker) = worker {
            state.workers.entry(worker.to_string()).or_default().retries += 1;
        }
    }

    pub fn record_timeout(&self, operation: &str, worker: Option<&str>) {
        if let Some(parent) = &self.parent {
            parent.record_timeout(operation, worker);
        }
        let mut state = self.lock();
        state.operations.entry(operation.to_string()).or_default().timed_out += 1;
        if let Some(worker) = worker {
            state.workers.entry(worker.to_string()).or_default().timed_out += 1;
        }
    }

    pub fn operation_stats(&self, operation: &str) -> Option<CallStats> {
        self.lock().operations.get(operation).cloned()
    }

    pub fn worker_stats(&self, worker: &str) -> Option<CallStats> {
        self.lock().workers.get(worker).cloned()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let state = self.lock();
        MonitorSnapshot {
            operations: state
                .operations
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            workers: state
                .workers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            active_workers: state.active,
            max_concurrent_workers: state.max_concurrent,
            buffered_samples: state.samples.len(),
            taken_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 系统健康判断；没有任何调用时为 Healthy
    pub fn health(&self) -> HealthReport {
        let overall = self.snapshot().overall();
        self.judge(&overall)
    }

    fn judge(&self, overall: &CallStats) -> HealthReport {
        let success_rate = overall.success_rate();
        let mean_latency_ms = overall.mean_duration_ms();
        let mut reasons = Vec::new();

        if overall.total > 0 {
            if success_rate < self.config.min_success_rate {
                reasons.push(format!(
                    "success rate {:.1}% below {:.1}%",
                    success_rate * 100.0,
                    self.config.min_success_rate * 100.0
                ));
            }
            let ceiling = self.config.max_mean_latency.as_millis() as f64;
            if mean_latency_ms > ceiling {
                reasons.push(format!(
                    "mean latency {:.0}ms above {:.0}ms",
                    mean_latency_ms, ceiling
                ));
            }
            if overall.failed > self.config.max_failures {
                reasons.push(format!(
                    "{} failures above limit {}",
                    overall.failed, self.config.max_failures
                ));
            }
        }

        HealthReport {
            status: if reasons.is_empty() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            success_rate,
            mean_latency_ms,
            failed: overall.failed,
            reasons,
        }
    }

    /// 某操作最近 window 个样本（None 表示全部缓冲样本）的延迟分布
    pub fn statistics(&self, operation: &str, window: Option<usize>) -> Option<LatencyStatistics> {
        let mut durations: Vec<u64> = {
            let state = self.lock();
            let matching = state
                .samples
                .iter()
                .rev()
                .filter(|s| s.operation == operation)
                .map(|s| s.duration_ms);
            match window {
                Some(n) => matching.take(n).collect(),
                None => matching.collect(),
            }
        };
        if durations.is_empty() {
            return None;
        }
        durations.sort_unstable();
        let count = durations.len();
        let sum: u64 = durations.iter().sum();
        Some(LatencyStatistics {
            count,
            mean_ms: sum as f64 / count as f64,
            min_ms: durations[0],
            max_ms: durations[count - 1],
            p95_ms: percentile(&durations, 95.0),
            p99_ms: percentile(&durations, 99.0),
        })
    }

    /// 标记一个进行中的 Worker 调用；guard 释放时计数减一
    pub fn track(self: &Arc<Self>) -> ActiveGuard {
        {
            let mut state = self.lock();
            state.active += 1;
            state.max_concurrent = state.max_concurrent.max(state.active);
        }
        ActiveGuard {
            monitor: Arc::clone(self),
            _parent: self.parent.as_ref().map(|p| Box::new(p.track())),
        }
    }

    pub fn active_workers(&self) -> usize {
        self.lock().active
    }

    pub fn report(&self) -> PerformanceReport {
        let snapshot = self.snapshot();
        let overall = snapshot.overall();
        PerformanceReport {
            health: self.judge(&overall),
            overall,
            operations: snapshot.operations,
            workers: snapshot.workers,
            max_concurrent_workers: snapshot.max_concurrent_workers,
            generated_at: snapshot.taken_at,
        }
    }

    /// 清空计数与样本（进行中的调用数保留）；不影响上级监控
    pub fn reset(&self) {
        let mut state = self.lock();
        let active = state.active;
        *state = MonitorState {
            active,
            max_concurrent: active,
            ..MonitorState::default()
        };
        tracing::info!("performance monitor reset");
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

/// 见 PerformanceMonitor::track
pub struct ActiveGuard {
    monitor: Arc<PerformanceMonitor>,
    _parent: Option<Box<ActiveGuard>>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut state = self.monitor.lock();
        state.active = state.active.saturating_sub(1);
    }
}

/// 线性插值百分位；sorted 非空且升序
fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0] as f64;
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] as f64 + (sorted[upper] as f64 - sorted[lower] as f64) * frac
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(op: &str, worker: Option<&str>, ok: bool, ms: u64) -> PerformanceSample {
        PerformanceSample::new(op, worker, ok, Duration::from_millis(ms))
    }

    #[test]
    fn test_counts_per_operation_and_worker() {
        let m = PerformanceMonitor::default();
        m.record(sample("worker.execute", Some("weather"), true, 10));
        m.record(sample("worker.execute", Some("weather"), false, 30));
        m.record_retry("worker.execute", Some("weather"));
        m.record_timeout("worker.execute", Some("weather"));

        let op = m.operation_stats("worker.execute").unwrap();
        assert_eq!(op.total, 2);
        assert_eq!(op.successful, 1);
        assert_eq!(op.failed, 1);
        assert_eq!(op.retries, 1);
        assert_eq!(op.timed_out, 1);
        assert_eq!(op.min_duration_ms, Some(10));
        assert_eq!(op.max_duration_ms, Some(30));

        let w = m.worker_stats("weather").unwrap();
        assert_eq!(w.total, 2);
        assert_eq!(w.mean_duration_ms(), 20.0);
    }

    #[test]
    fn test_health_degrades_on_low_success_rate() {
        let m = PerformanceMonitor::default();
        assert!(m.health().is_healthy());
        for _ in 0..8 {
            m.record(sample("op", None, true, 5));
        }
        for _ in 0..2 {
            m.record(sample("op", None, false, 5));
        }
        let h = m.health();
        assert_eq!(h.status, HealthStatus::Degraded);
        assert!((h.success_rate - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_health_degrades_on_latency_and_failures() {
        let m = PerformanceMonitor::new(MonitorConfig {
            max_mean_latency: Duration::from_millis(100),
            max_failures: 0,
            min_success_rate: 0.0,
            ..MonitorConfig::default()
        });
        m.record(sample("op", None, true, 500));
        m.record(sample("op", None, false, 500));
        let h = m.health();
        assert_eq!(h.reasons.len(), 2);
    }

    #[test]
    fn test_ring_buffer_and_percentiles() {
        let m = PerformanceMonitor::new(MonitorConfig {
            history_size: 100,
            ..MonitorConfig::default()
        });
        for ms in 1..=150u64 {
            m.record(sample("op", None, true, ms));
        }
        let stats = m.statistics("op", None).unwrap();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min_ms, 51);
        assert_eq!(stats.max_ms, 150);
        // 51..=150 中 p95 = 51 + 0.95 * 99
        assert!((stats.p95_ms - 145.05).abs() < 1e-9);

        let recent = m.statistics("op", Some(10)).unwrap();
        assert_eq!(recent.min_ms, 141);
        assert!(m.statistics("missing", None).is_none());
    }

    #[test]
    fn test_track_guard_counts_concurrency() {
        let m = Arc::new(PerformanceMonitor::default());
        {
            let _a = m.track();
            let _b = m.track();
            assert_eq!(m.active_workers(), 2);
        }
        assert_eq!(m.active_workers(), 0);
        assert_eq!(m.snapshot().max_concurrent_workers, 2);
    }

    #[test]
    fn test_delta_and_reset() {
        let m = PerformanceMonitor::default();
        m.record(sample("phase.think", None, true, 10));
        let before = m.snapshot();
        m.record(sample("phase.think", None, true, 30));
        m.record_retry("phase.think", None);
        let delta = m.snapshot().delta_since(&before);
        assert_eq!(delta.calls, 1);
        assert_eq!(delta.retries, 1);
        assert_eq!(delta.phase_mean_ms.get("think"), Some(&30.0));

        m.reset();
        assert!(m.operation_stats("phase.think").is_none());
        assert_eq!(m.report().overall.total, 0);
    }

    #[test]
    fn test_scoped_monitor_counts_only_its_own_calls() {
        let shared = Arc::new(PerformanceMonitor::default());
        let first = PerformanceMonitor::scoped(&shared);
        let second = PerformanceMonitor::scoped(&shared);

        first.record(sample("phase.think", None, true, 10));
        first.record_timeout("phase.plan", None);
        second.record(sample("phase.think", None, false, 30));
        second.record(sample("worker.execute", Some("w"), true, 5));
        second.record_retry("worker.execute", Some("w"));

        let a = first.snapshot().performance();
        assert_eq!(a.calls, 1);
        assert_eq!(a.timeouts, 1);
        assert_eq!(a.failures, 0);
        let b = second.snapshot().performance();
        assert_eq!(b.calls, 2);
        assert_eq!(b.retries, 1);
        assert_eq!(b.phase_mean_ms.get("think"), Some(&30.0));

        let all = shared.snapshot().performance();
        assert_eq!(all.calls, 3);
        assert_eq!(all.timeouts, 1);
        assert_eq!(all.retries, 1);
        assert_eq!(shared.worker_stats("w").unwrap().total, 1);

        {
            let _guard = first.track();
            assert_eq!(first.active_workers(), 1);
            assert_eq!(shared.active_workers(), 1);
        }
        assert_eq!(shared.active_workers(), 0);

        second.reset();
        assert_eq!(shared.snapshot().performance().calls, 3);
    }
}
