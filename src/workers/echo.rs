//! Echo Worker（演示与测试用）

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::core::ServiceError;
use crate::workers::{Worker, WorkerResult};

/// 回显查询文本与上下文中的键
pub struct EchoWorker;

#[async_trait]
impl Worker for EchoWorker {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the sub-query back (for testing)."
    }

    async fn execute(
        &self,
        query: &str,
        context: &Map<String, Value>,
    ) -> Result<WorkerResult, ServiceError> {
        let mut payload = Map::new();
        payload.insert("echo".to_string(), json!(query));
        payload.insert(
            "context_keys".to_string(),
            json!(context.keys().collect::<Vec<_>>()),
        );
        Ok(WorkerResult::success(self.name(), payload, 1.0))
    }
}
