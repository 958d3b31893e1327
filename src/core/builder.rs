//! Controller 构建器：把配置、Completion Service、注册表与监控组装成 Controller
//!
//! 所有依赖显式传入；未提供的注册表与监控按配置新建。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::config::RuntimeConfig;
use crate::core::{ConfigError, Phase, TimeoutExecutor};
use crate::cycle::{Controller, ControllerConfig, CycleEvent};
use crate::llm::CompletionService;
use crate::monitor::{MonitorConfig, PerformanceMonitor};
use crate::workers::{DispatchConfig, Dispatcher, WorkerRegistry};

/// Controller 构建器
#[derive(Default)]
pub struct ControllerBuilder {
    controller: ControllerConfig,
    dispatch: DispatchConfig,
    monitor_config: MonitorConfig,
    phase_timeouts: Vec<(Phase, Duration)>,
    completion: Option<Arc<dyn CompletionService>>,
    registry: Option<Arc<WorkerRegistry>>,
    monitor: Option<Arc<PerformanceMonitor>>,
    events: Option<UnboundedSender<CycleEvent>>,
}

impl ControllerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 使用校验后的运行期配置
    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        Self {
            controller: runtime.controller.clone(),
            dispatch: runtime.dispatch.clone(),
            monitor_config: runtime.monitor.clone(),
            ..Self::default()
        }
    }

    pub fn controller_config(mut self, config: ControllerConfig) -> Self {
        self.controller = config;
        self
    }

    pub fn dispatch_config(mut self, config: DispatchConfig) -> Self {
        self.dispatch = config;
        self
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.controller.max_iterations = max_iterations;
        self
    }

    /// 覆盖单个阶段预算；零值在 build 时报错
    pub fn phase_timeout(mut self, phase: Phase, budget: Duration) -> Self {
        self.phase_timeouts.push((phase, budget));
        self
    }

    pub fn completion(mut self, completion: Arc<dyn CompletionService>) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn registry(mut self, registry: Arc<WorkerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn events(mut self, tx: UnboundedSender<CycleEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn build(self) -> Result<Controller, ConfigError> {
        let completion = self
            .completion
            .ok_or_else(|| ConfigError::invalid("completion service not set"))?;
        let mut controller_config = self.controller;
        for (phase, budget) in self.phase_timeouts {
            controller_config.timeouts.set(phase, budget)?;
        }
        let monitor = match self.monitor {
            Some(monitor) => monitor,
            None => {
                self.monitor_config.validate()?;
                Arc::new(PerformanceMonitor::new(self.monitor_config))
            }
        };
        let registry = self.registry.unwrap_or_default();
        let dispatcher = Dispatcher::new(registry, TimeoutExecutor::new(monitor), self.dispatch)?;
        let controller = Controller::new(completion, dispatcher, controller_config)?;
        Ok(match self.events {
            Some(tx) => controller.with_events(tx),
            None => controller,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedCompletion;

    #[test]
    fn test_build_requires_completion() {
        assert!(ControllerBuilder::new().build().is_err());
    }

    #[test]
    fn test_phase_override_and_validation() {
        let controller = ControllerBuilder::new()
            .completion(Arc::new(ScriptedCompletion::healthy()))
            .phase_timeout(Phase::Next, Duration::from_millis(250))
            .max_iterations(2)
            .build()
            .unwrap();
        assert_eq!(controller.timeouts().get(Phase::Next), Duration::from_millis(250));
        assert_eq!(controller.config().max_iterations, 2);
        assert!(controller.registry().is_empty());

        let err = ControllerBuilder::new()
            .completion(Arc::new(ScriptedCompletion::healthy()))
            .phase_timeout(Phase::Act, Duration::ZERO)
            .build();
        assert!(err.is_err());
    }
}
