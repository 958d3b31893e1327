//! 错误分类与恢复动作
//!
//! 外部调用（Completion Service、Worker）的失败统一归类为 ServiceError，
//! 由 RecoveryEngine 根据 ErrorKind 决定重试、冷却后重试、降级或终止。

use std::time::Duration;

use thiserror::Error;

/// 错误类别：执行器的重试/降级决策只依赖这个值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Timeout,
    RateLimited,
    Transient,
    Permanent,
    MalformedResponse,
    WorkerNotFound,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::MalformedResponse => "malformed_response",
            ErrorKind::WorkerNotFound => "worker_not_found",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 外部协作方（Completion Service / Worker）调用失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("deadline of {}ms exceeded", .0.as_millis())]
    Timeout(Duration),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transient service error: {0}")]
    Transient(String),

    #[error("permanent service error: {0}")]
    Permanent(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("not found")]
    WorkerNotFound(String),

    #[error("cancelled")]
    Cancelled,
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Timeout(_) => ErrorKind::Timeout,
            ServiceError::RateLimited(_) => ErrorKind::RateLimited,
            ServiceError::Transient(_) => ErrorKind::Transient,
            ServiceError::Permanent(_) => ErrorKind::Permanent,
            ServiceError::MalformedResponse(_) => ErrorKind::MalformedResponse,
            ServiceError::WorkerNotFound(_) => ErrorKind::WorkerNotFound,
            ServiceError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ServiceError::Timeout(_))
    }
}

/// 配置非法：只在构造阶段出现，运行期不会产生
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("config load failed: {0}")]
    Load(#[from] config::ConfigError),
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ConfigError::Invalid(msg.into())
    }
}

/// 恢复引擎给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 等待 delay 后重试
    Retry { delay: Duration },
    /// 限流：冷却 wait 后重试（与超时退避分开计算）
    Cooldown { wait: Duration },
    /// 不再重试
    Abort,
}
