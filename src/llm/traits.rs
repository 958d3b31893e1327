//! Completion Service 抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Scripted）实现 CompletionService；
//! 失败一律归类为 ServiceError，由执行器决定重试还是降级。

use std::time::Duration;

use async_trait::async_trait;

use crate::core::{Phase, ServiceError};
use crate::llm::ChatMessage;

#[async_trait]
pub trait CompletionService: Send + Sync {
    /// 非流式完成；timeout 为本次尝试的截止时间，实现方应在超时前返回
    async fn generate(
        &self,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<String, ServiceError>;

    /// 控制器的阶段调用入口；phase 只在进程内传递，不进入请求内容
    async fn generate_for(
        &self,
        _phase: Phase,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<String, ServiceError> {
        self.generate(messages, timeout).await
    }

    /// 日志中使用的后端名称
    fn name(&self) -> &str {
        "completion"
    }

    /// 累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
