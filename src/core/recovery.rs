//! 错误恢复引擎
//!
//! 根据 ErrorKind 返回 RecoveryAction：超时与瞬时错误退避重试，限流冷却后重试，其余终止。
//! 另外集中定义「哪些错误在阶段边界降级为默认值」。

use crate::core::timeout::RetryPolicy;
use crate::core::{ErrorKind, RecoveryAction, ServiceError};

/// 把错误映射为可执行动作（重试 / 冷却 / 终止）
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// attempt 从 1 开始；预算用完时一律 Abort
    pub fn decide(&self, err: &ServiceError, attempt: u32, policy: &RetryPolicy) -> RecoveryAction {
        if attempt >= policy.max_attempts() {
            return RecoveryAction::Abort;
        }
        match err.kind() {
            ErrorKind::Timeout | ErrorKind::Transient => RecoveryAction::Retry {
                delay: policy.delay_after(attempt),
            },
            ErrorKind::RateLimited => RecoveryAction::Cooldown {
                wait: policy.cooldown_after(attempt),
            },
            ErrorKind::Permanent
            | ErrorKind::MalformedResponse
            | ErrorKind::WorkerNotFound
            | ErrorKind::Cancelled => RecoveryAction::Abort,
        }
    }

    /// 阶段边界上可以用默认输出替代的错误
    pub fn should_degrade(&self, kind: ErrorKind) -> bool {
        matches!(
            kind,
            ErrorKind::Timeout
                | ErrorKind::RateLimited
                | ErrorKind::Transient
                | ErrorKind::MalformedResponse
        )
    }
}
