//! Worker 注册表
//!
//! 所有 Worker 实现 Worker trait（name / description / timeout / execute），
//! 由 WorkerRegistry 按名注册与查找；运行期可以注册与注销。

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::core::ServiceError;
use crate::workers::WorkerResult;

/// Worker trait：给定查询文本与上下文快照，异步返回结构化结果；重试安全
#[async_trait]
pub trait Worker: Send + Sync {
    /// 注册名（ExecutionPlan 中引用的名字）
    fn name(&self) -> &str;

    /// 描述（写入 Plan 阶段的提示）
    fn description(&self) -> &str {
        ""
    }

    /// 自身的单次调用截止时间；None 时使用 dispatch.worker_timeout_ms
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn execute(
        &self,
        query: &str,
        context: &Map<String, Value>,
    ) -> Result<WorkerResult, ServiceError>;
}

/// 注册表中单个 Worker 的描述
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerInfo {
    pub name: String,
    pub description: String,
    pub timeout_ms: Option<u64>,
}

/// 名称到 Worker 的映射；一把读写锁保护整个表
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, Arc<dyn Worker>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<dyn Worker>>> {
        self.workers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<dyn Worker>>> {
        self.workers.write().unwrap_or_else(|e| e.into_inner())
    }

    /// 注册；同名时替换并返回旧的 Worker
    pub fn register(&self, worker: impl Worker + 'static) -> Option<Arc<dyn Worker>> {
        self.register_arc(Arc::new(worker))
    }

    pub fn register_arc(&self, worker: Arc<dyn Worker>) -> Option<Arc<dyn Worker>> {
        let name = worker.name().to_string();
        let replaced = self.write().insert(name.clone(), worker);
        if replaced.is_some() {
            tracing::warn!(worker = %name, "worker replaced");
        } else {
            tracing::debug!(worker = %name, "worker registered");
        }
        replaced
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Worker>> {
        let removed = self.write().remove(name);
        if removed.is_some() {
            tracing::debug!(worker = %name, "worker unregistered");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// 按名称排序，保证默认计划的顺序确定
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// 按名称排序的 Worker 描述
    pub fn describe(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self
            .read()
            .values()
            .map(|w| WorkerInfo {
                name: w.name().to_string(),
                description: w.description().to_string(),
                timeout_ms: w.timeout().map(|t| t.as_millis() as u64),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}
