//! Worker 调用结果

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::ServiceError;

/// 单个 Worker 的结果；失败时 error 非空，payload 为空
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub worker: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// [0, 1]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub duration_ms: u64,
}

impl WorkerResult {
    pub fn success(
        worker: impl Into<String>,
        payload: Map<String, Value>,
        confidence: f64,
    ) -> Self {
        Self {
            worker: worker.into(),
            payload,
            confidence: clamp_confidence(confidence),
            error: None,
            attempts: 1,
            timed_out: false,
            duration_ms: 0,
        }
    }

    /// 合成失败结果；error 文本取 ServiceError 的 Display
    pub fn failed(worker: impl Into<String>, err: &ServiceError) -> Self {
        Self {
            worker: worker.into(),
            payload: Map::new(),
            confidence: 0.0,
            error: Some(err.to_string()),
            attempts: 0,
            timed_out: err.is_timeout(),
            duration_ms: 0,
        }
    }

    /// 注册表中不存在的 Worker：error = "not found"
    pub fn not_found(worker: impl Into<String>) -> Self {
        let worker = worker.into();
        let err = ServiceError::WorkerNotFound(worker.clone());
        Self::failed(worker, &err)
    }

    /// 外层等待上限到期时仍未返回的 Worker
    pub fn timeout(worker: impl Into<String>, bound: Duration) -> Self {
        Self::failed(worker, &ServiceError::Timeout(bound))
    }

    pub fn with_stats(mut self, attempts: u32, timed_out: bool, duration: Duration) -> Self {
        self.attempts = attempts;
        self.timed_out = self.timed_out || timed_out;
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

pub(crate) fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
