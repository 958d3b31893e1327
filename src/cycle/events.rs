//! 循环进度事件：可序列化为 JSON，供流式界面展示

use serde::Serialize;

use crate::core::Phase;
use crate::cycle::Outcome;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CycleEvent {
    IterationStarted { iteration: u32, max_iterations: u32 },
    PhaseCompleted {
        iteration: u32,
        phase: Phase,
        elapsed_ms: u64,
        degraded: bool,
    },
    /// 阶段截止时间已到，使用默认输出
    PhaseTimedOut {
        iteration: u32,
        phase: Phase,
        budget_ms: u64,
    },
    WorkerDispatched { iteration: u32, worker: String },
    WorkerFinished {
        iteration: u32,
        worker: String,
        ok: bool,
        duration_ms: u64,
    },
    Finished {
        outcome: Outcome,
        iterations: u32,
        confidence: f64,
    },
}
