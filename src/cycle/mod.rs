//! 迭代循环：控制器、阶段输出、运行上下文与历史

pub mod context;
pub mod controller;
pub mod events;
pub mod history;
pub mod parse;
pub mod prompts;
pub mod types;

pub use context::RunningContext;
pub use controller::{Controller, ControllerConfig};
pub use events::CycleEvent;
pub use history::{IterationHistory, IterationStep};
pub use parse::{extract_json, parse_structured, parse_structured_or, Parsed};
pub use types::{
    ActResult, ActStatus, ExecutionPlan, FinalAnswer, NextResult, Outcome, PlanDraft, RunResult,
    ThinkResult, DEFAULT_STRATEGY, FALLBACK_CONFIDENCE,
};
