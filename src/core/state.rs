//! 状态定义：循环阶段、状态机状态与阶段超时预算
//!
//! Controller 内部用 CycleState 驱动 Think -> Plan -> Act -> Next；
//! 每条 IterationStep 用 StepKind 标记所属阶段（含 Error）。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::ConfigError;

/// 一次迭代中的四个阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Think,
    Plan,
    Act,
    Next,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Think, Phase::Plan, Phase::Act, Phase::Next];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Think => "think",
            Phase::Plan => "plan",
            Phase::Act => "act",
            Phase::Next => "next",
        }
    }

    /// 性能监控中的操作名
    pub fn operation(&self) -> String {
        format!("phase.{}", self.as_str())
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// IterationStep 的阶段标记
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Think,
    Plan,
    Act,
    Next,
    Error,
}

impl From<Phase> for StepKind {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Think => StepKind::Think,
            Phase::Plan => StepKind::Plan,
            Phase::Act => StepKind::Act,
            Phase::Next => StepKind::Next,
        }
    }
}

/// 状态机状态；Done / Error 为终止态（Error 在迭代边界处理后可回到 Think）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Think,
    Plan,
    Act,
    Next,
    Done,
    Error,
}

/// 四个阶段的超时预算；只能通过 set 修改
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseTimeoutConfig {
    think: Duration,
    plan: Duration,
    act: Duration,
    next: Duration,
}

impl PhaseTimeoutConfig {
    pub fn new(
        think: Duration,
        plan: Duration,
        act: Duration,
        next: Duration,
    ) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.set(Phase::Think, think)?;
        cfg.set(Phase::Plan, plan)?;
        cfg.set(Phase::Act, act)?;
        cfg.set(Phase::Next, next)?;
        Ok(cfg)
    }

    pub fn get(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Think => self.think,
            Phase::Plan => self.plan,
            Phase::Act => self.act,
            Phase::Next => self.next,
        }
    }

    pub fn set(&mut self, phase: Phase, budget: Duration) -> Result<(), ConfigError> {
        if budget.is_zero() {
            return Err(ConfigError::invalid(format!(
                "{} timeout must be positive",
                phase
            )));
        }
        match phase {
            Phase::Think => self.think = budget,
            Phase::Plan => self.plan = budget,
            Phase::Act => self.act = budget,
            Phase::Next => self.next = budget,
        }
        Ok(())
    }

    /// 一次完整迭代的预算之和
    pub fn total(&self) -> Duration {
        self.think + self.plan + self.act + self.next
    }
}

impl Default for PhaseTimeoutConfig {
    fn default() -> Self {
        Self {
            think: Duration::from_secs(30),
            plan: Duration::from_secs(30),
            act: Duration::from_secs(60),
            next: Duration::from_secs(15),
        }
    }
}
