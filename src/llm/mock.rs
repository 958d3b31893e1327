//! Scripted Completion Service（用于测试与演示，无需 API）
//!
//! 控制器经 generate_for 传入当前阶段，据此返回预设回复；不带阶段的 generate 一律返回 `{}`。
//! 每个阶段可以有一条重复使用的回复，外加一个先被消费的一次性队列；
//! 支持人为延迟与预设错误，便于复现超时、限流等场景。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::{Phase, ServiceError};
use crate::llm::{ChatMessage, CompletionService};

type Reply = Result<String, ServiceError>;

#[derive(Default)]
struct Script {
    repeat: HashMap<Phase, Reply>,
    queued: HashMap<Phase, VecDeque<Reply>>,
    calls: HashMap<Phase, u32>,
    unmarked_calls: u32,
}

/// 按阶段脚本化的 Completion Service
pub struct ScriptedCompletion {
    script: Mutex<Script>,
    latency: Duration,
    phase_latency: HashMap<Phase, Duration>,
}

impl ScriptedCompletion {
    /// 空脚本：未配置的阶段返回 `{}`
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::default()),
            latency: Duration::ZERO,
            phase_latency: HashMap::new(),
        }
    }

    /// 一次迭代即可结束的健康脚本：Think 需要更多信息，Plan 交给默认分组，Next 终止
    pub fn healthy() -> Self {
        Self::new()
            .with_reply(
                Phase::Think,
                r#"{"core_requirements":["answer the query"],"acquired_info":[],"missing_info":["worker results"],"confidence_level":0.3,"should_complete":false}"#,
            )
            .with_reply(Phase::Plan, r#"{"strategy":"parallel"}"#)
            .with_reply(
                Phase::Next,
                r#"{"should_terminate":true,"confidence_score":0.9,"next_focus":"","reasoning":"workers answered"}"#,
            )
    }

    pub fn with_reply(self, phase: Phase, text: impl Into<String>) -> Self {
        self.lock().repeat.insert(phase, Ok(text.into()));
        self
    }

    pub fn with_error(self, phase: Phase, err: ServiceError) -> Self {
        self.lock().repeat.insert(phase, Err(err));
        self
    }

    /// 所有调用的人为延迟
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// 单个阶段的人为延迟（覆盖 with_latency）
    pub fn with_phase_latency(mut self, phase: Phase, latency: Duration) -> Self {
        self.phase_latency.insert(phase, latency);
        self
    }

    /// 追加一次性回复，先于重复回复被消费
    pub fn push_reply(&self, phase: Phase, reply: Result<String, ServiceError>) {
        self.lock().queued.entry(phase).or_default().push_back(reply);
    }

    pub fn calls(&self, phase: Phase) -> u32 {
        self.lock().calls.get(&phase).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        let script = self.lock();
        script.calls.values().sum::<u32>() + script.unmarked_calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn respond(&self, phase: Option<Phase>, timeout: Duration) -> Reply {
        let reply = self.next_reply(phase);
        let delay = phase
            .and_then(|p| self.phase_latency.get(&p).copied())
            .unwrap_or(self.latency);

        if delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(ServiceError::Timeout(timeout));
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        reply
    }

    fn next_reply(&self, phase: Option<Phase>) -> Reply {
        let mut script = self.lock();
        let Some(phase) = phase else {
            script.unmarked_calls += 1;
            return Ok("{}".to_string());
        };
        *script.calls.entry(phase).or_insert(0) += 1;
        if let Some(reply) = script.queued.get_mut(&phase).and_then(VecDeque::pop_front) {
            return reply;
        }
        script
            .repeat
            .get(&phase)
            .cloned()
            .unwrap_or_else(|| Ok("{}".to_string()))
    }
}

impl Default for ScriptedCompletion {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn generate(
        &self,
        _messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<String, ServiceError> {
        self.respond(None, timeout).await
    }

    async fn generate_for(
        &self,
        phase: Phase,
        _messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<String, ServiceError> {
        self.respond(Some(phase), timeout).await
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
