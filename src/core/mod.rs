//! 核心层：错误分类与恢复、阶段状态、超时重试执行器、并发调度、运行监管、组件装配

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod state;
pub mod task_scheduler;
pub mod timeout;

pub use builder::ControllerBuilder;
pub use error::{ConfigError, ErrorKind, RecoveryAction, ServiceError};
pub use orchestrator::{build_registry, create_completion_from_config, Orchestrator};
pub use recovery::RecoveryEngine;
pub use session_supervisor::RunSupervisor;
pub use state::{CycleState, Phase, PhaseTimeoutConfig, StepKind};
pub use task_scheduler::TaskScheduler;
pub use timeout::{
    Attempt, CallLabel, RetryDelay, RetryFailure, RetryOutcome, RetryPolicy, TimeoutExecutor,
};
