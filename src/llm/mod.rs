//! Completion Service 层：抽象与实现（OpenAI 兼容端点 / Scripted）

pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

pub use message::{prompt_chars, ChatMessage, Role};
pub use mock::ScriptedCompletion;
pub use openai::{
    classify_api_error, classify_error_text, OpenAiCompletion, TokenUsage, DEEPSEEK_BASE_URL,
};
pub use traits::CompletionService;
