//! 编排器：从配置组装整套运行时
//!
//! 负责：选择 Completion Service、注册 Worker（内置、配置与插件目录）、创建监控与消息总线，
//! 并在运行期间把循环进度事件转发到总线的 iteration.progress 频道。

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::bus::{channels, MessageBus, MessageKind, Priority, PublishOptions};
use crate::config::AppConfig;
use crate::core::{ConfigError, ControllerBuilder, RunSupervisor};
use crate::cycle::{Controller, CycleEvent, RunResult};
use crate::llm::{CompletionService, OpenAiCompletion, ScriptedCompletion};
use crate::monitor::PerformanceMonitor;
use crate::workers::{discover_plugins, CommandWorker, EchoWorker, WorkerRegistry};

/// 根据配置与环境变量选择 Completion Service（DeepSeek / OpenAI 兼容 / Scripted）
pub fn create_completion_from_config(cfg: &AppConfig) -> Arc<dyn CompletionService> {
    let provider = cfg.llm.provider.to_lowercase();
    let has_deepseek = std::env::var("DEEPSEEK_API_KEY").is_ok();
    let has_openai = std::env::var("OPENAI_API_KEY").is_ok();

    match provider.as_str() {
        "deepseek" if has_deepseek || has_openai => {
            tracing::info!(model = %cfg.llm.model, "using DeepSeek completion");
            Arc::new(match cfg.llm.base_url.as_deref() {
                Some(url) => OpenAiCompletion::new(
                    Some(url),
                    &cfg.llm.model,
                    std::env::var("DEEPSEEK_API_KEY").ok().as_deref(),
                ),
                None => OpenAiCompletion::deepseek(&cfg.llm.model),
            })
        }
        "openai" if has_openai => {
            tracing::info!(model = %cfg.llm.model, "using OpenAI-compatible completion");
            Arc::new(OpenAiCompletion::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                std::env::var("OPENAI_API_KEY").ok().as_deref(),
            ))
        }
        "mock" => {
            tracing::info!("using scripted completion");
            Arc::new(ScriptedCompletion::healthy())
        }
        other => {
            tracing::warn!(provider = %other, "no API key for provider, using scripted completion");
            Arc::new(ScriptedCompletion::healthy())
        }
    }
}

/// 显式注册所有 Worker：内置 echo、[[workers.plugins]]、插件目录中的清单
///
/// 同名时后注册的覆盖先注册的（插件目录可以覆盖配置中的定义）。
pub fn build_registry(cfg: &AppConfig) -> Arc<WorkerRegistry> {
    let registry = WorkerRegistry::new();
    registry.register(EchoWorker);
    for entry in &cfg.workers.plugins {
        registry.register(CommandWorker::new(entry));
    }
    if let Some(dir) = &cfg.workers.plugin_dir {
        for entry in discover_plugins(dir) {
            if registry.register(CommandWorker::new(&entry)).is_some() {
                tracing::warn!(worker = %entry.name, "plugin manifest replaced an existing worker");
            }
        }
    }
    tracing::info!(workers = ?registry.names(), "worker registry ready");
    Arc::new(registry)
}

/// 一次进程内的完整运行时
pub struct Orchestrator {
    controller: Controller,
    bus: MessageBus,
    monitor: Arc<PerformanceMonitor>,
    supervisor: RunSupervisor,
}

impl Orchestrator {
    /// 校验配置并组装；ConfigError 在任何运行开始之前返回
    pub fn from_config(cfg: &AppConfig) -> Result<Self, ConfigError> {
        let runtime = cfg.validate()?;
        let monitor = Arc::new(PerformanceMonitor::new(runtime.monitor.clone()));
        let controller = ControllerBuilder::from_runtime(&runtime)
            .completion(create_completion_from_config(cfg))
            .registry(build_registry(cfg))
            .monitor(Arc::clone(&monitor))
            .build()?;
        Ok(Self::assemble(controller, MessageBus::new(runtime.bus)?, monitor))
    }

    /// 使用已有的 Controller 与总线（测试与嵌入场景）
    pub fn assemble(
        controller: Controller,
        bus: MessageBus,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        Self {
            controller,
            bus,
            monitor,
            supervisor: RunSupervisor::new(),
        }
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn supervisor(&self) -> &RunSupervisor {
        &self.supervisor
    }

    /// 执行一次运行；进度事件发布到 iteration.progress，结束后发布到 agent.responses
    pub async fn run(&self, query: &str, context: Map<String, Value>) -> RunResult {
        let (tx, mut rx) = mpsc::unbounded_channel::<CycleEvent>();
        let bus = self.bus.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let priority = match event {
                    CycleEvent::PhaseTimedOut { .. } => Priority::High,
                    CycleEvent::Finished { .. } => Priority::High,
                    _ => Priority::Normal,
                };
                let payload = serde_json::to_value(&event).unwrap_or(Value::Null);
                let options = PublishOptions::new().priority(priority).source("controller");
                if let Err(e) = bus.publish(
                    channels::ITERATION_PROGRESS,
                    MessageKind::IterationProgress,
                    payload,
                    options,
                ) {
                    tracing::debug!(error = %e, "progress event dropped");
                }
            }
        });

        let result = self
            .controller
            .run_observed(query, context, self.supervisor.child_token(), tx)
            .await;
        let _ = forwarder.await;

        let summary = serde_json::json!({
            "query": result.query,
            "outcome": result.answer.outcome,
            "confidence": result.answer.confidence,
            "iterations": result.iterations,
        });
        if let Err(e) = self.bus.publish(
            channels::AGENT_RESPONSES,
            MessageKind::AgentResponse,
            summary,
            PublishOptions::new().source("controller"),
        ) {
            tracing::warn!(error = %e, "run summary not published");
        }
        result
    }

    /// 取消正在进行的运行
    pub fn cancel(&self) {
        self.supervisor.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_registry_includes_configured_plugins() {
        let mut cfg = AppConfig::default();
        cfg.workers.plugins.push(crate::config::PluginEntry {
            name: "date".into(),
            description: String::new(),
            program: "date".into(),
            args: vec![],
            timeout_ms: None,
        });
        let registry = build_registry(&cfg);
        assert_eq!(registry.names(), vec!["date", "echo"]);
    }

    #[tokio::test]
    async fn test_run_publishes_progress() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "mock".into();
        cfg.timeouts.act_ms = 2000;
        let orchestrator = Orchestrator::from_config(&cfg).unwrap();
        let run = orchestrator.run("hello", Map::new()).await;
        assert_eq!(run.iterations, 1);

        let info = orchestrator
            .bus()
            .channel_info(channels::ITERATION_PROGRESS)
            .unwrap();
        assert!(info.queue_len > 0);
        let first = orchestrator
            .bus()
            .receive(channels::ITERATION_PROGRESS, Some(Duration::from_millis(50)), None)
            .await
            .unwrap();
        assert_eq!(first.priority, Priority::High);
        assert!(orchestrator
            .bus()
            .receive(channels::AGENT_RESPONSES, Some(Duration::from_millis(50)), None)
            .await
            .is_some());
    }
}
