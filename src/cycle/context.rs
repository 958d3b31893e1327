//! 运行上下文：一次运行内跨迭代携带的键值表，只增不删

use serde_json::{Map, Value};

use crate::workers::WorkerResult;

/// 单次运行独占的上下文
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunningContext {
    entries: Map<String, Value>,
}

impl RunningContext {
    pub fn new(initial: Map<String, Value>) -> Self {
        Self { entries: initial }
    }

    /// 写入 last_query 与 query_timestamp（Unix 毫秒）
    pub fn seed_query(&mut self, query: &str) {
        self.entries
            .insert("last_query".to_string(), Value::String(query.to_string()));
        self.entries.insert(
            "query_timestamp".to_string(),
            Value::from(chrono::Utc::now().timestamp_millis()),
        );
    }

    /// 插入或覆盖一个键；键集合只会增长
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    /// 合并成功的 Worker 结果：键为 Worker 名，值为 payload；返回新增或更新的键数
    pub fn merge_results<'a>(
        &mut self,
        results: impl IntoIterator<Item = &'a WorkerResult>,
    ) -> usize {
        let mut merged = 0;
        for result in results.into_iter().filter(|r| r.is_success()) {
            self.entries
                .insert(result.worker.clone(), Value::Object(result.payload.clone()));
            merged += 1;
        }
        merged
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.entries
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }
}
