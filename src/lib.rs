//! Cadence - 有界迭代编排核心
//!
//! 模块划分：
//! - **bus**: 优先级消息总线（频道、发布/订阅、请求/响应）
//! - **config**: 应用配置加载（TOML + 环境变量）与校验
//! - **core**: 错误分类、恢复策略、超时重试执行器、状态定义、编排器
//! - **cycle**: Think -> Plan -> Act -> Next 阶段控制器
//! - **llm**: Completion Service 抽象与实现（OpenAI 兼容 / DeepSeek / Scripted）
//! - **monitor**: 性能监控与健康判断
//! - **observability**: tracing 初始化
//! - **workers**: Worker trait、注册表、并行分发与内置 Worker

pub mod bus;
pub mod config;
pub mod core;
pub mod cycle;
pub mod llm;
pub mod monitor;
pub mod observability;
pub mod workers;

pub use crate::core::{ControllerBuilder, Orchestrator};
pub use crate::cycle::{Controller, RunResult};
