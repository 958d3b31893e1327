//! OpenAI 兼容 Completion Service
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! 错误按 OpenAIError 的变体归类：HTTP 状态、网络错误类型与 API 返回的 type / code；
//! 只有没有结构化信息时才退回到文本中的独立状态码。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::{ApiError, OpenAIError};
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::core::ServiceError;
use crate::llm::{ChatMessage, CompletionService, Role};

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client 与 model 名
pub struct OpenAiCompletion {
    client: Client<OpenAIConfig>,
    model: String,
    pub usage: TokenUsage,
}

impl OpenAiCompletion {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            usage: TokenUsage::new(),
        }
    }

    /// DeepSeek 端点；Key 取 `DEEPSEEK_API_KEY`，其次 `OPENAI_API_KEY`
    pub fn deepseek(model: &str) -> Self {
        let api_key = std::env::var("DEEPSEEK_API_KEY").ok();
        Self::new(Some(DEEPSEEK_BASE_URL), model, api_key.as_deref())
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn to_openai_messages(
        messages: &[ChatMessage],
    ) -> Result<Vec<ChatCompletionRequestMessage>, ServiceError> {
        let invalid = |e: OpenAIError| ServiceError::Permanent(e.to_string());
        messages
            .iter()
            .map(|m| {
                Ok(match m.role {
                    Role::System => ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(invalid)?,
                    ),
                    Role::User => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(invalid)?,
                    ),
                    Role::Assistant => ChatCompletionRequestMessage::Assistant(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(invalid)?,
                    ),
                })
            })
            .collect()
    }
}

/// 把 async_openai 的错误归类为 ServiceError
pub fn classify_api_error(err: &OpenAIError) -> ServiceError {
    let message = err.to_string();
    match err {
        OpenAIError::Reqwest(e) => {
            if e.is_builder() {
                ServiceError::Permanent(message)
            } else if e.is_decode() {
                ServiceError::MalformedResponse(message)
            } else if let Some(status) = e.status() {
                classify_status(status.as_u16(), message)
            } else {
                // 超时、连接失败与其它传输层错误
                ServiceError::Transient(message)
            }
        }
        OpenAIError::ApiError(api) => classify_api_body(api, message),
        OpenAIError::JSONDeserialize(..) => ServiceError::MalformedResponse(message),
        OpenAIError::StreamError(_) => ServiceError::Transient(message),
        OpenAIError::InvalidArgument(_)
        | OpenAIError::FileSaveError(_)
        | OpenAIError::FileReadError(_) => ServiceError::Permanent(message),
    }
}

fn classify_status(status: u16, message: String) -> ServiceError {
    match status {
        429 => ServiceError::RateLimited(message),
        408 | 500..=599 => ServiceError::Transient(message),
        _ => ServiceError::Permanent(message),
    }
}

/// 错误体的 type / code；5xx 的错误体不是 JSON，两者都为空
fn classify_api_body(api: &ApiError, message: String) -> ServiceError {
    let tags = [api.code.as_deref(), api.r#type.as_deref()];
    let tagged = |names: &[&str]| tags.iter().flatten().any(|t| names.contains(t));

    if tagged(&["insufficient_quota", "billing_hard_limit_reached"]) {
        return ServiceError::Permanent(message);
    }
    if tagged(&["rate_limit_exceeded", "rate_limit_error", "requests", "tokens"]) {
        return ServiceError::RateLimited(message);
    }
    if tagged(&[
        "server_error",
        "service_unavailable",
        "overloaded_error",
        "engine_overloaded",
        "timeout",
    ]) {
        return ServiceError::Transient(message);
    }
    if tags.iter().all(Option::is_none) {
        return match classify_error_text(&api.message) {
            ServiceError::RateLimited(_) => ServiceError::RateLimited(message),
            _ => ServiceError::Transient(message),
        };
    }
    ServiceError::Permanent(message)
}

/// 文本中独立出现的三位数字（不匹配 150000 这样的长数字内部）
fn status_codes(text: &str) -> impl Iterator<Item = u16> + '_ {
    text.split(|c: char| !c.is_ascii_digit())
        .filter(|token| token.len() == 3)
        .filter_map(|token| token.parse::<u16>().ok())
}

/// 只有错误文本可用时的归类
pub fn classify_error_text(text: &str) -> ServiceError {
    let lower = text.to_lowercase();
    if status_codes(&lower).any(|c| c == 429)
        || lower.contains("rate limit")
        || lower.contains("too many requests")
    {
        return ServiceError::RateLimited(text.to_string());
    }
    let transient_phrases = [
        "timed out",
        "service unavailable",
        "bad gateway",
        "gateway timeout",
        "overloaded",
    ];
    if status_codes(&lower).any(|c| (500..=599).contains(&c))
        || transient_phrases.iter().any(|p| lower.contains(p))
    {
        return ServiceError::Transient(text.to_string());
    }
    ServiceError::Permanent(text.to_string())
}

#[async_trait]
impl CompletionService for OpenAiCompletion {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<String, ServiceError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(Self::to_openai_messages(messages)?)
            .build()
            .map_err(|e| ServiceError::Permanent(e.to_string()))?;

        let response = tokio::time::timeout(timeout, self.client.chat().create(request))
            .await
            .map_err(|_| ServiceError::Timeout(timeout))?
            .map_err(|e| classify_api_error(&e))?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| ServiceError::MalformedResponse("empty choices".to_string()))
    }

    fn name(&self) -> &str {
        &self.model
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}
