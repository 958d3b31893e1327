//! 各阶段的结构化输出与运行结果

use std::collections::{BTreeMap, BTreeSet};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cycle::IterationHistory;
use crate::monitor::RunPerformance;
use crate::workers::WorkerResult;

/// 降级输出使用的置信度
pub const FALLBACK_CONFIDENCE: f64 = 0.2;

/// 默认计划与未给出策略时的策略名
pub const DEFAULT_STRATEGY: &str = "parallel";

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Think 阶段输出
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ThinkResult {
    /// 查询的核心需求
    pub core_requirements: Vec<String>,
    /// 上下文中已经掌握的信息
    pub acquired_info: Vec<String>,
    /// 仍然缺失、需要 Worker 补充的信息
    pub missing_info: Vec<String>,
    /// 0.0 - 1.0
    #[serde(alias = "confidence_level")]
    pub confidence: f64,
    /// 已知信息足以直接回答时为 true
    #[serde(alias = "should_complete")]
    pub can_answer_now: bool,
    pub reasoning: String,
    /// can_answer_now 为 true 时的答案
    pub answer: Option<String>,
}

impl ThinkResult {
    /// 「信息不足，继续」
    pub fn fallback(query: &str, context: &Map<String, Value>) -> Self {
        Self {
            core_requirements: vec![query.to_string()],
            acquired_info: context.keys().cloned().collect(),
            missing_info: vec!["information required to answer the query".to_string()],
            confidence: FALLBACK_CONFIDENCE,
            can_answer_now: false,
            reasoning: "analysis unavailable, continuing with defaults".to_string(),
            answer: None,
        }
    }

    pub(crate) fn normalized(mut self) -> Self {
        self.confidence = clamp_unit(self.confidence);
        self
    }
}

/// Plan 阶段的原始输出（由 Completion Service 给出）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PlanDraft {
    /// 需要调用的 Worker 名
    #[serde(alias = "required_agents")]
    pub required_workers: Vec<String>,
    /// 并行组：组间顺序执行，组内并行
    #[serde(alias = "execution_sequence")]
    pub parallel_groups: Vec<Vec<String>>,
    /// Worker 名到子查询
    pub sub_queries: BTreeMap<String, String>,
    /// Worker 名到期望输出
    pub expected_outputs: BTreeMap<String, String>,
    pub strategy: String,
    pub iteration_goal: String,
}

/// 规范化后的执行计划：每个 Worker 恰好出现在一个组里，且都有子查询
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub workers: Vec<String>,
    pub groups: Vec<Vec<String>>,
    pub sub_queries: BTreeMap<String, String>,
    pub expected_outputs: BTreeMap<String, String>,
    pub strategy: String,
    pub goal: String,
    /// 是否为默认计划（Plan 阶段失败或无法解析）
    pub fallback: bool,
}

impl ExecutionPlan {
    /// 默认计划：所有可用 Worker 放在一个并行组
    pub fn default_plan(query: &str, available: &[String]) -> Self {
        let workers: Vec<String> = available.to_vec();
        Self {
            groups: if workers.is_empty() {
                Vec::new()
            } else {
                vec![workers.clone()]
            },
            sub_queries: workers
                .iter()
                .map(|w| (w.clone(), query.to_string()))
                .collect(),
            workers,
            expected_outputs: BTreeMap::new(),
            strategy: DEFAULT_STRATEGY.to_string(),
            goal: String::new(),
            fallback: true,
        }
    }

    /// 由草稿生成计划
    ///
    /// 组中出现但未列入 required_workers 的名字会被补入；重复名字只保留第一次出现；
    /// 未分组的 Worker 追加为最后一组；草稿未选任何 Worker 时使用所有可用 Worker。
    pub fn from_draft(draft: PlanDraft, query: &str, available: &[String]) -> Self {
        let mut seen = BTreeSet::new();
        let mut workers = Vec::new();
        for name in draft
            .required_workers
            .iter()
            .chain(draft.parallel_groups.iter().flatten())
        {
            let name = name.trim();
            if !name.is_empty() && seen.insert(name.to_string()) {
                workers.push(name.to_string());
            }
        }

        if workers.is_empty() {
            let mut plan = Self::default_plan(query, available);
            plan.fallback = false;
            if !draft.strategy.is_empty() {
                plan.strategy = draft.strategy;
            }
            plan.goal = draft.iteration_goal;
            return plan;
        }

        let mut grouped = BTreeSet::new();
        let mut groups: Vec<Vec<String>> = draft
            .parallel_groups
            .iter()
            .map(|group| {
                group
                    .iter()
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty() && grouped.insert(n.clone()))
                    .collect::<Vec<_>>()
            })
            .filter(|g| !g.is_empty())
            .collect();
        let ungrouped: Vec<String> = workers
            .iter()
            .filter(|w| !grouped.contains(*w))
            .cloned()
            .collect();
        if !ungrouped.is_empty() {
            groups.push(ungrouped);
        }

        let sub_queries = workers
            .iter()
            .map(|w| {
                let sub = draft
                    .sub_queries
                    .get(w)
                    .filter(|s| !s.trim().is_empty())
                    .cloned()
                    .unwrap_or_else(|| query.to_string());
                (w.clone(), sub)
            })
            .collect();

        Self {
            workers,
            groups,
            sub_queries,
            expected_outputs: draft.expected_outputs,
            strategy: if draft.strategy.is_empty() {
                DEFAULT_STRATEGY.to_string()
            } else {
                draft.strategy
            },
            goal: draft.iteration_goal,
            fallback: false,
        }
    }
}

/// Act 阶段整体状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActStatus {
    /// 所有 Worker 成功
    Complete,
    /// 部分成功
    Partial,
    /// 全部失败
    Failed,
    /// 计划中没有 Worker
    Empty,
}

/// Act 阶段输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActResult {
    pub results: BTreeMap<String, WorkerResult>,
    /// 合并结果后的上下文副本
    pub context: Map<String, Value>,
    pub status: ActStatus,
}

impl ActResult {
    pub fn status_of(results: &BTreeMap<String, WorkerResult>) -> ActStatus {
        let ok = results.values().filter(|r| r.is_success()).count();
        match (ok, results.len()) {
            (_, 0) => ActStatus::Empty,
            (ok, total) if ok == total => ActStatus::Complete,
            (0, _) => ActStatus::Failed,
            _ => ActStatus::Partial,
        }
    }
}

/// Next 阶段输出
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct NextResult {
    #[serde(alias = "should_stop")]
    pub should_terminate: bool,
    /// 0.0 - 1.0
    #[serde(alias = "confidence_score")]
    pub confidence: f64,
    /// 下一轮的关注点
    pub next_focus: String,
    pub reasoning: String,
}

impl NextResult {
    /// 「继续」：降级时不终止，交给迭代上限收尾
    pub fn fallback() -> Self {
        Self {
            should_terminate: false,
            confidence: FALLBACK_CONFIDENCE,
            next_focus: "retry the missing information".to_string(),
            reasoning: "decision unavailable, continuing".to_string(),
        }
    }

    pub(crate) fn normalized(mut self) -> Self {
        self.confidence = clamp_unit(self.confidence);
        self
    }
}

/// 运行的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Think 判断已知信息足够
    Answered,
    /// Next 决定终止
    Terminated,
    /// 达到最大迭代次数
    IterationLimit,
    /// 最后一轮以 Error 结束
    Failed,
    Cancelled,
}

/// 最终答案
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalAnswer {
    pub outcome: Outcome,
    pub confidence: f64,
    pub summary: String,
    /// 运行结束时的完整上下文
    pub context: Map<String, Value>,
}

/// Controller::run 的返回值
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub query: String,
    pub answer: FinalAnswer,
    pub history: IterationHistory,
    pub iterations: u32,
    pub performance: RunPerformance,
    /// Unix 毫秒
    pub started_at: i64,
    pub elapsed_ms: u64,
}
