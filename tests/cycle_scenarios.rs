//! 循环端到端场景：健康运行、注册表缺失、全部超时、幂等、并发运行

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cadence::core::{
    ControllerBuilder, Phase, PhaseTimeoutConfig, RetryDelay, RetryPolicy, ServiceError, StepKind,
};
use cadence::cycle::{Controller, ControllerConfig, Outcome, FALLBACK_CONFIDENCE};
use cadence::llm::ScriptedCompletion;
use cadence::workers::{DispatchConfig, Worker, WorkerRegistry, WorkerResult};
use futures_util::future::join_all;
use serde_json::{json, Map, Value};

struct Stub {
    name: &'static str,
    delay: Duration,
}

#[async_trait]
impl Worker for Stub {
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
        payload.insert("answer".into(), json!(format!("{} for {}", self.name, query)));
        Ok(WorkerResult::success(self.name, payload, 0.8))
    }
}

fn registry(workers: &[(&'static str, Duration)]) -> Arc<WorkerRegistry> {
    let registry = WorkerRegistry::new();
    for (name, delay) in workers {
        registry.register(Stub {
            name,
            delay: *delay,
        });
    }
    Arc::new(registry)
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn controller_config(max_iterations: u32, timeouts: PhaseTimeoutConfig) -> ControllerConfig {
    ControllerConfig {
        max_iterations,
        timeout_warning_ratio: 0.8,
        timeouts,
        retry: RetryPolicy::new(2, ms(500), 1.5)
            .unwrap()
            .with_delay(RetryDelay::Fixed(ms(5))),
    }
}

fn dispatch_config(worker_timeout: Duration) -> DispatchConfig {
    DispatchConfig {
        worker_timeout,
        worker_retries: 0,
        retry_delay: ms(5),
        backoff_factor: 1.5,
        group_buffer: ms(20),
        max_group_timeout: Duration::from_secs(5),
        max_concurrent_workers: 4,
    }
}

fn healthy_controller(completion: ScriptedCompletion, registry: Arc<WorkerRegistry>) -> Controller {
    let timeouts = PhaseTimeoutConfig::new(ms(500), ms(500), ms(1000), ms(500)).unwrap();
    ControllerBuilder::new()
        .controller_config(controller_config(5, timeouts))
        .dispatch_config(dispatch_config(ms(500)))
        .completion(Arc::new(completion))
        .registry(registry)
        .build()
        .unwrap()
}

#[tokio::test]
async fn healthy_run_finishes_in_one_iteration() {
    let workers = registry(&[("weather", Duration::ZERO), ("hotel", Duration::ZERO)]);
    let controller = healthy_controller(ScriptedCompletion::healthy(), workers);

    let run = controller.run("X", Map::new()).await;

    assert_eq!(run.iterations, 1);
    assert_eq!(run.answer.outcome, Outcome::Terminated);
    let next = run.history.last().unwrap();
    assert_eq!(next.phase, StepKind::Next);
    assert_eq!(next.output["should_terminate"], json!(true));

    let act = run
        .history
        .steps()
        .iter()
        .find(|s| s.phase == StepKind::Act)
        .unwrap();
    let results = act.worker_results.as_ref().unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.values().all(|r| r.error.is_none()));
    assert!(run.history.steps().iter().all(|s| !s.timeout_occurred));

    assert_eq!(run.answer.context["weather"]["answer"], json!("weather for X"));
    assert_eq!(run.answer.context["last_query"], json!("X"));
    assert_eq!(run.performance.timeouts, 0);
    assert!(run.performance.phase_mean_ms.contains_key("act"));
}

#[tokio::test]
async fn unregistered_worker_gets_not_found_result() {
    let completion = ScriptedCompletion::healthy().with_reply(
        Phase::Plan,
        r#"{"required_workers": ["weather", "budget"], "parallel_groups": [["weather", "budget"]]}"#,
    );
    let controller = healthy_controller(completion, registry(&[("weather", Duration::ZERO)]));

    let run = controller.run("plan a trip", Map::new()).await;

    let act = &run.history.steps()[2];
    assert_eq!(act.phase, StepKind::Act);
    let results = act.worker_results.as_ref().unwrap();
    assert_eq!(results["budget"].error.as_deref(), Some("not found"));
    assert!(results["weather"].is_success());
    assert_eq!(run.history.steps()[3].phase, StepKind::Next);
    assert_eq!(run.answer.outcome, Outcome::Terminated);
    assert!(!run.answer.context.contains_key("budget"));
}

#[tokio::test]
async fn every_phase_timing_out_still_returns_a_result() {
    let max_iterations = 3;
    let timeouts = PhaseTimeoutConfig::new(ms(40), ms(40), ms(60), ms(40)).unwrap();
    let completion = ScriptedCompletion::healthy().with_latency(Duration::from_secs(1));
    let controller = ControllerBuilder::new()
        .controller_config(controller_config(max_iterations, timeouts))
        .dispatch_config(dispatch_config(ms(30)))
        .completion(Arc::new(completion))
        .registry(registry(&[("fast", Duration::ZERO)]))
        .build()
        .unwrap();

    let start = Instant::now();
    let run = controller.run("X", Map::new()).await;

    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(run.iterations, max_iterations);
    assert_eq!(run.answer.outcome, Outcome::IterationLimit);
    assert_eq!(run.history.len(), 4 * max_iterations as usize);
    assert!(run.history.steps().iter().all(|s| s.timeout_occurred));
    for act in run.history.steps().iter().filter(|s| s.phase == StepKind::Act) {
        assert_eq!(act.output["default_plan"], json!(true));
        let results = act.worker_results.as_ref().unwrap();
        assert!(results["fast"].is_success());
    }
    assert_eq!(run.answer.confidence, FALLBACK_CONFIDENCE);
    // Think、Plan、Next 三个阶段每轮至少一次超时
    assert!(run.performance.timeouts >= u64::from(max_iterations) * 3);
}

#[tokio::test]
async fn concurrent_runs_report_their_own_performance() {
    let workers = registry(&[("weather", ms(20)), ("hotel", ms(20))]);
    let controller = healthy_controller(
        ScriptedCompletion::healthy().with_latency(ms(10)),
        workers,
    );

    let solo = controller.run("solo", Map::new()).await;
    assert!(solo.performance.calls > 0);

    let queries: Vec<String> = (0..4).map(|i| format!("query {}", i)).collect();
    let runs = join_all(queries.iter().map(|q| controller.run(q, Map::new()))).await;

    for run in &runs {
        assert_eq!(run.answer.outcome, Outcome::Terminated);
        assert_eq!(run.performance.calls, solo.performance.calls);
        assert_eq!(run.performance.failures, solo.performance.failures);
        assert_eq!(run.performance.timeouts, 0);
    }
    let shared = controller.monitor().snapshot().performance();
    assert_eq!(shared.calls, solo.performance.calls * 5);
    assert_eq!(controller.monitor().active_workers(), 0);
}

#[tokio::test]
async fn identical_runs_are_idempotent() {
    let workers = registry(&[("weather", Duration::ZERO), ("hotel", Duration::ZERO)]);
    let controller = healthy_controller(
        ScriptedCompletion::healthy().with_reply(
            Phase::Next,
            r#"{"should_terminate": false, "confidence_score": 0.6}"#,
        ),
        workers,
    );

    let first = controller.run("same query", Map::new()).await;
    let second = controller.run("same query", Map::new()).await;

    assert_eq!(first.history.len(), second.history.len());
    assert_eq!(first.iterations, 5);
    assert_eq!(first.answer.confidence, second.answer.confidence);
    assert_eq!(first.answer.outcome, second.answer.outcome);
}

#[tokio::test]
async fn history_respects_iteration_bound() {
    for max_iterations in 1..=3 {
        let timeouts = PhaseTimeoutConfig::new(ms(200), ms(200), ms(300), ms(200)).unwrap();
        let controller = ControllerBuilder::new()
            .controller_config(controller_config(max_iterations, timeouts))
            .dispatch_config(dispatch_config(ms(100)))
            .completion(Arc::new(
                ScriptedCompletion::healthy().with_reply(Phase::Next, "keep going"),
            ))
            .registry(registry(&[("w", Duration::ZERO)]))
            .build()
            .unwrap();
        let run = controller.run("q", Map::new()).await;
        assert_eq!(run.history.iteration_count(), max_iterations);
        assert!(run.history.len() <= 4 * max_iterations as usize + 1);
    }
}
