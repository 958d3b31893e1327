//! 阶段控制器：有界的 Think -> Plan -> Act -> Next 循环
//!
//! 每个阶段经 TimeoutExecutor 调用 Completion Service，并受该阶段预算的外层截止时间约束；
//! 超时、限流、瞬时错误与无法解析的输出都降级为该阶段的默认值，运行继续。
//! 不可恢复的错误在迭代边界记为 Error 步骤；无论如何都返回 RunResult。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::{
    CallLabel, ConfigError, CycleState, Phase, PhaseTimeoutConfig, RetryPolicy, ServiceError,
    StepKind, TimeoutExecutor,
};
use crate::cycle::parse::parse_structured_or;
use crate::cycle::{
    prompts, ActResult, CycleEvent, ExecutionPlan, FinalAnswer, IterationHistory, IterationStep,
    NextResult, Outcome, PlanDraft, RunResult, RunningContext, ThinkResult,
};
use crate::llm::{prompt_chars, ChatMessage, CompletionService};
use crate::monitor::{PerformanceMonitor, PerformanceSample};
use crate::workers::{Dispatcher, WorkerRegistry, WorkerResult, WORKER_OPERATION};

/// 控制器参数
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub max_iterations: u32,
    /// 阶段耗时超过该比例的预算时告警
    pub timeout_warning_ratio: f64,
    pub timeouts: PhaseTimeoutConfig,
    /// Completion Service 调用的重试策略；截止时间会被收紧到阶段预算之内
    pub retry: RetryPolicy,
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::invalid(
                "controller.max_iterations must be at least 1",
            ));
        }
        if !(self.timeout_warning_ratio > 0.0 && self.timeout_warning_ratio <= 1.0) {
            return Err(ConfigError::invalid(format!(
                "controller.timeout_warning_ratio must be in (0, 1], got {}",
                self.timeout_warning_ratio
            )));
        }
        Ok(())
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            timeout_warning_ratio: 0.8,
            timeouts: PhaseTimeoutConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// 长提示词放宽截止时间：超过 2000 字符翻倍（上限 90s），超过 1000 字符 1.5 倍（上限 60s）；从不缩短
fn scaled_budget(budget: Duration, prompt_chars: usize) -> Duration {
    let scaled = if prompt_chars > 2000 {
        budget.mul_f64(2.0).min(Duration::from_secs(90))
    } else if prompt_chars > 1000 {
        budget.mul_f64(1.5).min(Duration::from_secs(60))
    } else {
        budget
    };
    scaled.max(budget)
}

/// 一次阶段调用的结果
struct PhaseCall<T> {
    value: T,
    elapsed: Duration,
    timed_out: bool,
    degraded: bool,
    warning: bool,
}

/// 单次运行的进度事件出口
struct EventSink(Option<UnboundedSender<CycleEvent>>);

impl EventSink {
    fn emit(&self, event: CycleEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}

/// 单次运行独占的事件出口与计数；执行器和分发器都写入本次运行的 scoped 监控
struct RunScope {
    sink: EventSink,
    executor: TimeoutExecutor,
    dispatcher: Dispatcher,
}

impl RunScope {
    fn monitor(&self) -> &Arc<PerformanceMonitor> {
        self.executor.monitor()
    }
}

enum PhaseFailure {
    Fatal(ServiceError),
    Cancelled,
}

/// 阶段控制器；一个实例可以顺序或并发执行多次 run，每次 run 独占自己的历史与上下文
pub struct Controller {
    completion: Arc<dyn CompletionService>,
    dispatcher: Dispatcher,
    executor: TimeoutExecutor,
    config: ControllerConfig,
    events: Option<UnboundedSender<CycleEvent>>,
}

impl Controller {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        dispatcher: Dispatcher,
        config: ControllerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            completion,
            executor: dispatcher.executor().clone(),
            dispatcher,
            config,
            events: None,
        })
    }

    /// 进度事件发送端
    pub fn with_events(mut self, tx: UnboundedSender<CycleEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// 修改单个阶段的预算；零值返回 ConfigError
    pub fn set_phase_timeout(
        &mut self,
        phase: Phase,
        budget: Duration,
    ) -> Result<(), ConfigError> {
        self.config.timeouts.set(phase, budget)?;
        tracing::info!(
            phase = %phase,
            budget_ms = budget.as_millis() as u64,
            "phase timeout updated"
        );
        Ok(())
    }

    pub fn timeouts(&self) -> &PhaseTimeoutConfig {
        &self.config.timeouts
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        self.dispatcher.registry()
    }

    /// 所有运行共享的监控
    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        self.executor.monitor()
    }

    fn scope(&self, sink: EventSink) -> RunScope {
        let executor = self
            .executor
            .with_monitor(PerformanceMonitor::scoped(self.monitor()));
        RunScope {
            sink,
            dispatcher: self.dispatcher.with_executor(executor.clone()),
            executor,
        }
    }

    pub async fn run(&self, query: &str, context: Map<String, Value>) -> RunResult {
        self.run_with_cancel(query, context, CancellationToken::new())
            .await
    }

    /// 执行一次运行；token 取消后在下一个挂起点停止，返回已有历史
    pub async fn run_with_cancel(
        &self,
        query: &str,
        initial: Map<String, Value>,
        cancel: CancellationToken,
    ) -> RunResult {
        self.run_inner(query, initial, cancel, EventSink(self.events.clone()))
            .await
    }

    /// 与 run_with_cancel 相同，但本次运行的进度事件发往 tx；运行结束时 tx 被释放
    pub async fn run_observed(
        &self,
        query: &str,
        initial: Map<String, Value>,
        cancel: CancellationToken,
        tx: UnboundedSender<CycleEvent>,
    ) -> RunResult {
        self.run_inner(query, initial, cancel, EventSink(Some(tx)))
            .await
    }

    async fn run_inner(
        &self,
        query: &str,
        initial: Map<String, Value>,
        cancel: CancellationToken,
        sink: EventSink,
    ) -> RunResult {
        let started_at = chrono::Utc::now().timestamp_millis();
        let start = Instant::now();
        let scope = self.scope(sink);
        let max_iterations = self.config.max_iterations;

        let mut context = RunningContext::new(initial);
        context.seed_query(query);
        let mut history = IterationHistory::new();

        let mut iteration = 1u32;
        let mut state = CycleState::Think;
        let mut outcome = Outcome::IterationLimit;
        let mut confidence = 0.0;
        let mut summary = String::new();
        let mut focus: Option<String> = None;
        let mut think: Option<ThinkResult> = None;
        // 计划以及它是否因 Plan 超时而退回默认计划
        let mut plan: Option<(ExecutionPlan, bool)> = None;
        let mut act: Option<ActResult> = None;
        let mut fatal: Option<(Phase, ServiceError)> = None;

        tracing::info!(query = %query, max_iterations, "run started");
        scope.sink.emit(CycleEvent::IterationStarted {
            iteration,
            max_iterations,
        });

        while state != CycleState::Done {
            if cancel.is_cancelled() {
                outcome = Outcome::Cancelled;
                break;
            }
            state = match state {
                CycleState::Think => {
                    let messages = prompts::think_messages(
                        query,
                        iteration,
                        focus.as_deref(),
                        context.as_map(),
                    );
                    let fallback = || ThinkResult::fallback(query, context.as_map());
                    match self
                        .call_phase(
                            &scope,
                            Phase::Think,
                            iteration,
                            messages,
                            &cancel,
                            fallback,
                        )
                        .await
                    {
                        Ok(call) => {
                            let result = call.value.clone().normalized();
                            let step = self.step(&scope, iteration, Phase::Think, &result, &call);
                            history.push(step);
                            confidence = result.confidence;
                            let next = if result.can_answer_now {
                                outcome = Outcome::Answered;
                                summary = result
                                    .answer
                                    .clone()
                                    .unwrap_or_else(|| result.reasoning.clone());
                                CycleState::Done
                            } else {
                                CycleState::Plan
                            };
                            think = Some(result);
                            next
                        }
                        Err(PhaseFailure::Cancelled) => {
                            outcome = Outcome::Cancelled;
                            CycleState::Done
                        }
                        Err(PhaseFailure::Fatal(err)) => {
                            fatal = Some((Phase::Think, err));
                            CycleState::Error
                        }
                    }
                }
                CycleState::Plan => {
                    let available = self.registry().names();
                    let think_result = think
                        .take()
                        .unwrap_or_else(|| ThinkResult::fallback(query, context.as_map()));
                    let messages = prompts::plan_messages(
                        query,
                        iteration,
                        &think_result,
                        &self.registry().describe(),
                    );
                    let call = match self
                        .call_phase(
                            &scope,
                            Phase::Plan,
                            iteration,
                            messages,
                            &cancel,
                            PlanDraft::default,
                        )
                        .await
                    {
                        Ok(call) => Ok(call),
                        // Plan 对不可恢复错误同样使用默认计划
                        Err(PhaseFailure::Fatal(err)) => {
                            tracing::warn!(
                                iteration,
                                error = %err,
                                "plan failed, using default plan"
                            );
                            Err(err)
                        }
                        Err(PhaseFailure::Cancelled) => {
                            outcome = Outcome::Cancelled;
                            break;
                        }
                    };
                    let (execution, step_call) = match call {
                        Ok(call) if !call.degraded => (
                            ExecutionPlan::from_draft(call.value.clone(), query, &available),
                            call,
                        ),
                        Ok(call) => (ExecutionPlan::default_plan(query, &available), call),
                        Err(_) => (
                            ExecutionPlan::default_plan(query, &available),
                            PhaseCall {
                                value: PlanDraft::default(),
                                elapsed: Duration::ZERO,
                                timed_out: false,
                                degraded: true,
                                warning: false,
                            },
                        ),
                    };
                    let step = self.step(&scope, iteration, Phase::Plan, &execution, &step_call);
                    history.push(step);
                    plan = Some((execution, step_call.timed_out));
                    CycleState::Act
                }
                CycleState::Act => {
                    let (execution, plan_timed_out) = plan.take().unwrap_or_else(|| {
                        (ExecutionPlan::default_plan(query, &self.registry().names()), false)
                    });
                    match self
                        .act(&scope, iteration, &execution, plan_timed_out, &context, &cancel)
                        .await
                    {
                        Some((result, step)) => {
                            history.push(step);
                            context = RunningContext::new(result.context.clone());
                            act = Some(result);
                            CycleState::Next
                        }
                        None => {
                            outcome = Outcome::Cancelled;
                            CycleState::Done
                        }
                    }
                }
                CycleState::Next => {
                    let act_result = act.take().unwrap_or_else(|| ActResult {
                        results: BTreeMap::new(),
                        context: context.as_map().clone(),
                        status: ActResult::status_of(&BTreeMap::new()),
                    });
                    let messages = prompts::next_messages(query, iteration, &act_result);
                    match self
                        .call_phase(
                            &scope,
                            Phase::Next,
                            iteration,
                            messages,
                            &cancel,
                            NextResult::fallback,
                        )
                        .await
                    {
                        Ok(call) => {
                            let result = call.value.clone().normalized();
                            let step = self.step(&scope, iteration, Phase::Next, &result, &call);
                            history.push(step);
                            confidence = result.confidence;
                            summary = result.reasoning.clone();
                            if result.should_terminate {
                                outcome = Outcome::Terminated;
                                CycleState::Done
                            } else if iteration >= max_iterations {
                                outcome = Outcome::IterationLimit;
                                CycleState::Done
                            } else {
                                focus = Some(result.next_focus.clone());
                                self.advance(&scope, &mut iteration, max_iterations);
                                CycleState::Think
                            }
                        }
                        Err(PhaseFailure::Cancelled) => {
                            outcome = Outcome::Cancelled;
                            CycleState::Done
                        }
                        Err(PhaseFailure::Fatal(err)) => {
                            fatal = Some((Phase::Next, err));
                            CycleState::Error
                        }
                    }
                }
                CycleState::Error => {
                    let (phase, err) = fatal
                        .take()
                        .unwrap_or((Phase::Think, ServiceError::Permanent("unknown".to_string())));
                    tracing::error!(iteration, phase = %phase, error = %err, "phase failed");
                    let mut step = IterationStep::new(
                        iteration,
                        StepKind::Error,
                        json!({
                            "phase": phase,
                            "kind": err.kind().as_str(),
                            "error": err.to_string(),
                        }),
                    );
                    step.timeout_occurred = err.is_timeout();
                    history.push(step);
                    summary = err.to_string();
                    if iteration >= max_iterations {
                        outcome = Outcome::Failed;
                        CycleState::Done
                    } else {
                        focus = None;
                        self.advance(&scope, &mut iteration, max_iterations);
                        CycleState::Think
                    }
                }
                CycleState::Done => CycleState::Done,
            };
        }

        if summary.is_empty() {
            summary = match outcome {
                Outcome::Cancelled => "run cancelled".to_string(),
                Outcome::IterationLimit => "iteration limit reached".to_string(),
                _ => String::new(),
            };
        }
        let iterations = history.iteration_count();
        let performance = scope.monitor().snapshot().performance();
        let elapsed_ms = start.elapsed().as_millis() as u64;

        tracing::info!(
            outcome = ?outcome,
            iterations,
            steps = history.len(),
            confidence,
            elapsed_ms,
            "run finished"
        );
        scope.sink.emit(CycleEvent::Finished {
            outcome,
            iterations,
            confidence,
        });

        RunResult {
            query: query.to_string(),
            answer: FinalAnswer {
                outcome,
                confidence,
                summary,
                context: context.into_map(),
            },
            history,
            iterations,
            performance,
            started_at,
            elapsed_ms,
        }
    }

    fn near_deadline(&self, elapsed: Duration, budget: Duration) -> bool {
        elapsed.as_secs_f64() > budget.as_secs_f64() * self.config.timeout_warning_ratio
    }

    fn advance(&self, scope: &RunScope, iteration: &mut u32, max_iterations: u32) {
        *iteration += 1;
        scope.sink.emit(CycleEvent::IterationStarted {
            iteration: *iteration,
            max_iterations,
        });
    }

    fn step<T: Serialize, U>(
        &self,
        scope: &RunScope,
        iteration: u32,
        phase: Phase,
        output: &T,
        call: &PhaseCall<U>,
    ) -> IterationStep {
        let mut step = IterationStep::new(
            iteration,
            phase.into(),
            serde_json::to_value(output).unwrap_or(Value::Null),
        );
        step.elapsed_ms = call.elapsed.as_millis() as u64;
        step.timeout_occurred = call.timed_out;
        step.timeout_warning = call.warning;
        step.degraded = call.degraded;
        scope.sink.emit(CycleEvent::PhaseCompleted {
            iteration,
            phase,
            elapsed_ms: step.elapsed_ms,
            degraded: call.degraded,
        });
        step
    }

    /// 调用 Completion Service 并解析为 T；可降级的错误返回 fallback
    async fn call_phase<T, D>(
        &self,
        scope: &RunScope,
        phase: Phase,
        iteration: u32,
        messages: Vec<ChatMessage>,
        cancel: &CancellationToken,
        fallback: D,
    ) -> Result<PhaseCall<T>, PhaseFailure>
    where
        T: DeserializeOwned,
        D: FnOnce() -> T,
    {
        let budget = scaled_budget(self.config.timeouts.get(phase), prompt_chars(&messages));
        let policy = self.config.retry.within(budget);
        let operation = phase.operation();
        let label = CallLabel::operation(operation.as_str());
        let start = Instant::now();

        let completion = Arc::clone(&self.completion);
        let messages = messages.as_slice();
        let call = scope
            .executor
            .execute(&label, &policy, Some(cancel), |attempt| {
                let completion = Arc::clone(&completion);
                async move {
                    completion
                        .generate_for(phase, messages, attempt.deadline)
                        .await
                }
            });
        let outer = tokio::time::timeout(budget, call).await;
        let elapsed = start.elapsed();
        let warning = self.near_deadline(elapsed, budget);

        let (value, timed_out, degraded) = match outer {
            Err(_) => {
                let monitor = scope.monitor();
                monitor.record_timeout(&operation, None);
                monitor.record(PerformanceSample::new(&operation, None, false, elapsed));
                tracing::warn!(
                    phase = %phase,
                    iteration,
                    budget_ms = budget.as_millis() as u64,
                    "phase budget exhausted, using default output"
                );
                scope.sink.emit(CycleEvent::PhaseTimedOut {
                    iteration,
                    phase,
                    budget_ms: budget.as_millis() as u64,
                });
                (fallback(), true, true)
            }
            Ok(Ok(outcome)) => {
                let parsed = parse_structured_or(&outcome.value, fallback);
                if parsed.fallback_used {
                    tracing::warn!(
                        phase = %phase,
                        iteration,
                        "unparsable phase output, using default"
                    );
                }
                (parsed.value, outcome.timed_out, parsed.fallback_used)
            }
            Ok(Err(failure)) => match failure.error {
                ServiceError::Cancelled => return Err(PhaseFailure::Cancelled),
                err if scope.executor.recovery().should_degrade(err.kind()) => {
                    tracing::warn!(
                        phase = %phase,
                        iteration,
                        error = %err,
                        attempts = failure.attempts,
                        "phase degraded to default output"
                    );
                    if err.is_timeout() {
                        scope.sink.emit(CycleEvent::PhaseTimedOut {
                            iteration,
                            phase,
                            budget_ms: budget.as_millis() as u64,
                        });
                    }
                    (fallback(), failure.timed_out || err.is_timeout(), true)
                }
                err => return Err(PhaseFailure::Fatal(err)),
            },
        };

        if warning {
            tracing::warn!(
                phase = %phase,
                iteration,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = budget.as_millis() as u64,
                "phase close to its deadline"
            );
        }
        tracing::info!(
            phase = %phase,
            iteration,
            elapsed_ms = elapsed.as_millis() as u64,
            timed_out,
            degraded,
            "phase completed"
        );
        Ok(PhaseCall {
            value,
            elapsed,
            timed_out,
            degraded,
            warning,
        })
    }

    /// 按组顺序、组内并行执行计划；None 表示运行被取消
    ///
    /// 因 Plan 超时而使用的默认计划，其 Act 步骤同样标记为超时。
    async fn act(
        &self,
        scope: &RunScope,
        iteration: u32,
        plan: &ExecutionPlan,
        plan_timed_out: bool,
        context: &RunningContext,
        cancel: &CancellationToken,
    ) -> Option<(ActResult, IterationStep)> {
        let budget = self.config.timeouts.get(Phase::Act);
        let start = Instant::now();
        let monitor = scope.monitor();
        let mut results: BTreeMap<String, WorkerResult> = BTreeMap::new();

        for group in &plan.groups {
            if cancel.is_cancelled() {
                return None;
            }
            let remaining = budget.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                tracing::warn!(
                    iteration,
                    workers = ?group,
                    "act budget exhausted, skipping group"
                );
                for name in group {
                    monitor.record_timeout(WORKER_OPERATION, Some(name));
                    results.insert(
                        name.clone(),
                        WorkerResult::timeout(name.clone(), budget).with_stats(
                            0,
                            true,
                            Duration::ZERO,
                        ),
                    );
                }
                continue;
            }
            for name in group {
                scope.sink.emit(CycleEvent::WorkerDispatched {
                    iteration,
                    worker: name.clone(),
                });
            }
            let group_results = scope
                .dispatcher
                .dispatch(group, &plan.sub_queries, context.as_map(), remaining, Some(cancel))
                .await;
            if cancel.is_cancelled() {
                return None;
            }
            for result in group_results.values() {
                scope.sink.emit(CycleEvent::WorkerFinished {
                    iteration,
                    worker: result.worker.clone(),
                    ok: result.is_success(),
                    duration_ms: result.duration_ms,
                });
            }
            results.extend(group_results);
        }

        let elapsed = start.elapsed();
        let status = ActResult::status_of(&results);
        let workers_timed_out = results.values().any(|r| r.timed_out);
        let timed_out = workers_timed_out || (plan.fallback && plan_timed_out);
        let mut merged = context.clone();
        let merged_count = merged.merge_results(results.values());
        monitor.record(PerformanceSample::new(
            &Phase::Act.operation(),
            None,
            status != crate::cycle::ActStatus::Failed,
            elapsed,
        ));
        if workers_timed_out {
            scope.sink.emit(CycleEvent::PhaseTimedOut {
                iteration,
                phase: Phase::Act,
                budget_ms: budget.as_millis() as u64,
            });
        }

        let warning = self.near_deadline(elapsed, budget);
        if warning {
            tracing::warn!(
                phase = %Phase::Act,
                iteration,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = budget.as_millis() as u64,
                "phase close to its deadline"
            );
        }
        tracing::info!(
            phase = %Phase::Act,
            iteration,
            workers = results.len(),
            merged = merged_count,
            status = ?status,
            elapsed_ms = elapsed.as_millis() as u64,
            "phase completed"
        );

        let act = ActResult {
            results,
            context: merged.into_map(),
            status,
        };
        let call = PhaseCall {
            value: (),
            elapsed,
            timed_out,
            degraded: false,
            warning,
        };
        let mut step = self.step(
            scope,
            iteration,
            Phase::Act,
            &json!({
                "status": act.status,
                "strategy": plan.strategy,
                "groups": plan.groups,
                "default_plan": plan.fallback,
            }),
            &call,
        );
        step.worker_results = Some(act.results.clone());
        Some((act, step))
    }
}
