//! 运行监管：取消令牌
//!
//! 持有根 CancellationToken；每次运行拿一个子 token，取消根 token 会停止所有运行中的循环。

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct RunSupervisor {
    cancel_token: CancellationToken,
}

impl RunSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 触发取消（例如 Ctrl+C）
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 单次运行使用的子 token
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_propagates_to_children() {
        let supervisor = RunSupervisor::new();
        let child = supervisor.child_token();
        assert!(!child.is_cancelled());
        supervisor.cancel();
        assert!(child.is_cancelled());
        assert!(supervisor.is_cancelled());
    }
}
