//! 迭代历史：每次阶段执行一条记录，只追加

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::core::StepKind;
use crate::workers::WorkerResult;

/// 一次阶段执行的记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationStep {
    /// 从 1 开始
    pub iteration: u32,
    pub phase: StepKind,
    pub output: Value,
    /// Unix 毫秒
    pub timestamp: i64,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_results: Option<BTreeMap<String, WorkerResult>>,
    pub timeout_occurred: bool,
    /// 完成时已超过 timeout_warning_ratio × 预算
    pub timeout_warning: bool,
    /// 输出是降级默认值
    pub degraded: bool,
}

impl IterationStep {
    pub fn new(iteration: u32, phase: StepKind, output: Value) -> Self {
        Self {
            iteration,
            phase,
            output,
            timestamp: chrono::Utc::now().timestamp_millis(),
            elapsed_ms: 0,
            worker_results: None,
            timeout_occurred: false,
            timeout_warning: false,
            degraded: false,
        }
    }
}

/// 一次运行的有序历史
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct IterationHistory {
    steps: Vec<IterationStep>,
}

impl IterationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, step: IterationStep) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[IterationStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn last(&self) -> Option<&IterationStep> {
        self.steps.last()
    }

    /// 出现过的不同迭代数
    pub fn iteration_count(&self) -> u32 {
        self.steps.iter().map(|s| s.iteration).max().unwrap_or(0)
    }

    /// 第 iteration 次迭代的全部记录
    pub fn iteration(&self, iteration: u32) -> impl Iterator<Item = &IterationStep> {
        self.steps.iter().filter(move |s| s.iteration == iteration)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_history_counts_iterations() {
        let mut history = IterationHistory::new();
        assert_eq!(history.iteration_count(), 0);
        history.push(IterationStep::new(1, StepKind::Think, json!({})));
        history.push(IterationStep::new(1, StepKind::Plan, json!({})));
        history.push(IterationStep::new(2, StepKind::Error, json!({"error": "x"})));
        assert_eq!(history.len(), 3);
        assert_eq!(history.iteration_count(), 2);
        assert_eq!(history.iteration(1).count(), 2);
        assert_eq!(history.last().map(|s| s.phase), Some(StepKind::Error));

        let encoded = serde_json::to_value(&history).unwrap();
        assert_eq!(encoded.as_array().map(Vec::len), Some(3));
        assert!(encoded[0].get("worker_results").is_none());
    }
}
